//! Command line frontend: run the simulated device, or talk to one.

use anyhow::{bail, Context, Result};
use celltend::config::Config;
use celltend::controller::Controller;
use celltend::hardware::sim::{FileFaultFlag, SimBoard};
use celltend::protocol::Setpoint;
use celltend::state::Mode;
use celltend::{port, SercomClient};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "celltend")]
#[command(about = "LiFePO4 battery management controller and host tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller against the simulated board, serving the serial
    /// protocol over TCP
    Simulate {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7460")]
        listen: SocketAddr,

        /// File standing in for the fault byte in non-volatile memory
        #[arg(long, default_value = "celltend.fault")]
        fault_file: PathBuf,
    },

    /// Poll a device once and print the full pack state
    Status {
        /// Device address
        #[arg(long, default_value = "127.0.0.1:7460")]
        connect: SocketAddr,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll a device repeatedly
    Watch {
        /// Device address
        #[arg(long, default_value = "127.0.0.1:7460")]
        connect: SocketAddr,

        /// Seconds between polls
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },

    /// Write one setpoint to a device
    Set {
        /// Device address
        #[arg(long, default_value = "127.0.0.1:7460")]
        connect: SocketAddr,

        /// mode, max-temp, fan-trigger, min-cell, max-cell, target,
        /// margin, dwell or verbose
        setting: String,

        /// The new value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate { listen, fault_file } => simulate(config, listen, fault_file).await,
        Commands::Status { connect, json } => status(connect, json).await,
        Commands::Watch { connect, interval } => watch(connect, interval).await,
        Commands::Set {
            connect,
            setting,
            value,
        } => set(connect, &setting, &value).await,
    }
}

async fn simulate(config: Config, listen: SocketAddr, fault_file: PathBuf) -> Result<()> {
    let frame_gap = Duration::from_millis(config.serial.frame_gap_ms);
    let board = SimBoard::new(&config);
    let hw = board.peripherals_with_fault_flag(Box::new(FileFaultFlag::new(fault_file)));
    let (requests, rx) = mpsc::channel(16);

    let controller = Controller::new(&config, hw, rx);
    tokio::spawn(async move {
        if let Err(err) = controller.run().await {
            error!(%err, "controller stopped");
        }
    });

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(%listen, cells = config.pack.cell_count, "simulated device ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("accepting a serial session")?;
                info!(%peer, "serial session open");
                let tx = requests.clone();
                tokio::spawn(async move {
                    match port::serve(socket, tx, frame_gap).await {
                        Ok(()) => info!(%peer, "serial session closed"),
                        Err(err) => warn!(%peer, %err, "serial session failed"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn status(connect: SocketAddr, json: bool) -> Result<()> {
    let mut client = open(connect).await?;
    let snapshot = client.fetch_state().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    println!("pack voltage   {:.4} V", snapshot.pack_voltage);
    println!("capacity       {} %", snapshot.capacity_pct);
    println!("mean cell      {:.4} V", snapshot.mean_cell_voltage);
    for (cell, volts) in snapshot.cell_voltages.iter().enumerate() {
        println!("cell {cell:<2}        {volts:.4} V");
    }
    for (sensor, celsius) in snapshot.temperatures.iter().enumerate() {
        println!("temperature {sensor}  {celsius:.2} C");
    }
    println!(
        "status         {}",
        if snapshot.fault { "SHUTDOWN" } else { "ok" }
    );
    Ok(())
}

async fn watch(connect: SocketAddr, interval: u64) -> Result<()> {
    let mut client = open(connect).await?;
    loop {
        let snapshot = client.fetch_state().await?;
        println!("{snapshot:?}");
        sleep(Duration::from_secs(interval)).await;
    }
}

async fn set(connect: SocketAddr, setting: &str, value: &str) -> Result<()> {
    let setpoint = parse_setpoint(setting, value)?;
    let mut client = open(connect).await?;
    client.write_setpoint(setpoint).await?;
    println!("ok");
    Ok(())
}

async fn open(addr: SocketAddr) -> Result<SercomClient<TcpStream>> {
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let mut client = SercomClient::new(socket);
    client.handshake().await?;
    Ok(client)
}

fn parse_setpoint(setting: &str, value: &str) -> Result<Setpoint> {
    let setpoint = match setting {
        "mode" => Setpoint::Mode(match value {
            "0" | "idle" => Mode::Idle,
            "1" | "balance" => Mode::Balance,
            "2" | "shutdown" => Mode::Shutdown,
            other => bail!("unknown mode {other:?} (idle, balance or shutdown)"),
        }),
        "max-temp" => Setpoint::MaxTemperature(value.parse()?),
        "fan-trigger" => Setpoint::FanTrigger(value.parse()?),
        "min-cell" => Setpoint::MinCellVoltage(value.parse()?),
        "max-cell" => Setpoint::MaxCellVoltage(value.parse()?),
        "target" => Setpoint::TargetVoltage(value.parse()?),
        "margin" => Setpoint::BalanceMargin(value.parse()?),
        "dwell" => Setpoint::DwellSecs(value.parse()?),
        "verbose" => Setpoint::Verbose(match value {
            "0" | "false" => false,
            "1" | "true" => true,
            other => bail!("unknown verbosity {other:?} (true or false)"),
        }),
        other => bail!(
            "unknown setting {other:?} (mode, max-temp, fan-trigger, min-cell, \
             max-cell, target, margin, dwell or verbose)"
        ),
    };
    Ok(setpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_map_to_setpoints() {
        assert_eq!(
            parse_setpoint("mode", "balance").unwrap(),
            Setpoint::Mode(Mode::Balance)
        );
        assert_eq!(
            parse_setpoint("target", "3.9").unwrap(),
            Setpoint::TargetVoltage(3.9)
        );
        assert_eq!(
            parse_setpoint("dwell", "16").unwrap(),
            Setpoint::DwellSecs(16)
        );
        assert!(parse_setpoint("frequency", "50").is_err());
        assert!(parse_setpoint("mode", "9").is_err());
    }
}
