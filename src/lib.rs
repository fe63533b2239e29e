//! Control core for a drain-resistor LiFePO4 battery management board.
//!
//! The controller owns the board: it sweeps the cell ADCs through the
//! harness map, enforces the cell voltage and temperature limits, runs the
//! charge/balance cycle, and answers a small serial request/response
//! protocol. The same core drives real peripherals behind the [`hardware`]
//! traits or the simulated board in [`hardware::sim`].
//!
//! Over the serial protocol a host can:
//!
//! - Read pack voltage, capacity, cell voltages, temperatures and status
//! - Switch the device between idle, charge/balance and shutdown
//! - Adjust every protection and balancing setpoint
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! #
//! # #[tokio::main]
//! # pub async fn main() {
//!     let socket = tokio::net::TcpStream::connect("127.0.0.1:7460").await.unwrap();
//!     let mut client = celltend::SercomClient::new(socket);
//!     client.handshake().await.unwrap();
//!     loop {
//!         let snapshot = client.fetch_state().await.unwrap();
//!         println!("{snapshot:?}");
//!         tokio::time::sleep(Duration::from_secs(5)).await;
//!     }
//! # }
//! ```

pub mod balance;
pub mod client;
pub mod config;
pub mod controller;
pub mod hardware;
pub mod port;
pub mod protocol;
pub mod state;

pub use client::SercomClient;
pub use config::Config;
pub use controller::Controller;
pub use state::{Mode, PackReadings, PackSnapshot};
