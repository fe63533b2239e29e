//! Host-side access to a device over any byte stream.
//!
//! Replies carry no length framing, so the client accumulates bytes until
//! the line goes quiet, then decodes. Works over a TCP socket, a serial
//! port adapter, or an in-process pipe in tests.

use crate::protocol::{self, Query, Setpoint, ACK, GREETING, NAK};
use crate::state::{Mode, PackSnapshot};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Quiet time that ends a reply.
const REPLY_QUIET: Duration = Duration::from_millis(100);
/// Longest wait for a reply to start. The device answers between control
/// ticks, and a charge/balance dwell can hold one back for its full length.
const REPLY_TIMEOUT: Duration = Duration::from_secs(90);
/// How long a freshly opened session waits for the greeting byte.
const GREETING_WINDOW: Duration = Duration::from_millis(500);

/// A client for the device's serial protocol.
pub struct SercomClient<T> {
    transport: T,
}

impl<T> SercomClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: T) -> Self {
        SercomClient { transport }
    }

    /// Swallow the greeting byte a device sends when a session opens.
    /// Returns whether one arrived; attaching to an already-open line sees
    /// none, which is fine.
    pub async fn handshake(&mut self) -> Result<bool> {
        match timeout(GREETING_WINDOW, self.transport.read_u8()).await {
            Err(_) => Ok(false),
            Ok(Ok(GREETING)) => Ok(true),
            Ok(Ok(other)) => Err(anyhow!("expected the session greeting, got {other:#04x}")),
            Ok(Err(err)) => Err(err).context("reading the session greeting"),
        }
    }

    /// Total pack voltage in volts.
    pub async fn pack_voltage(&mut self) -> Result<f64> {
        let reply = self.query(Query::PackVoltage).await?;
        Ok(protocol::decode_number(&reply)?)
    }

    /// Remaining capacity in percent.
    pub async fn capacity(&mut self) -> Result<u8> {
        let reply = self.query(Query::Capacity).await?;
        Ok(protocol::decode_capacity(&reply)?)
    }

    /// Mean cell voltage in volts.
    pub async fn mean_cell_voltage(&mut self) -> Result<f64> {
        let reply = self.query(Query::MeanCellVoltage).await?;
        Ok(protocol::decode_number(&reply)?)
    }

    /// Every cell voltage in volts, in logical cell order.
    pub async fn cell_voltages(&mut self) -> Result<Vec<f64>> {
        let reply = self.query(Query::CellVoltages).await?;
        Ok(protocol::decode_series(&reply)?)
    }

    /// Board temperatures in °C; the last entry is the die temperature.
    pub async fn temperatures(&mut self) -> Result<Vec<f64>> {
        let reply = self.query(Query::Temperatures).await?;
        Ok(protocol::decode_series(&reply)?)
    }

    /// Whether the device has latched into shutdown.
    pub async fn status(&mut self) -> Result<bool> {
        let reply = self.query(Query::Status).await?;
        Ok(protocol::decode_status(&reply)?)
    }

    /// Poll every query and assemble the full view of the pack.
    pub async fn fetch_state(&mut self) -> Result<PackSnapshot> {
        Ok(PackSnapshot {
            pack_voltage: self.pack_voltage().await?,
            capacity_pct: self.capacity().await?,
            mean_cell_voltage: self.mean_cell_voltage().await?,
            cell_voltages: self.cell_voltages().await?,
            temperatures: self.temperatures().await?,
            fault: self.status().await?,
        })
    }

    pub async fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.write_setpoint(Setpoint::Mode(mode)).await
    }

    pub async fn set_max_temperature(&mut self, celsius: f64) -> Result<()> {
        self.write_setpoint(Setpoint::MaxTemperature(celsius)).await
    }

    pub async fn set_fan_trigger(&mut self, celsius: f64) -> Result<()> {
        self.write_setpoint(Setpoint::FanTrigger(celsius)).await
    }

    pub async fn set_min_cell_voltage(&mut self, volts: f64) -> Result<()> {
        self.write_setpoint(Setpoint::MinCellVoltage(volts)).await
    }

    pub async fn set_max_cell_voltage(&mut self, volts: f64) -> Result<()> {
        self.write_setpoint(Setpoint::MaxCellVoltage(volts)).await
    }

    pub async fn set_target_voltage(&mut self, volts: f64) -> Result<()> {
        self.write_setpoint(Setpoint::TargetVoltage(volts)).await
    }

    pub async fn set_balance_margin(&mut self, volts: f64) -> Result<()> {
        self.write_setpoint(Setpoint::BalanceMargin(volts)).await
    }

    pub async fn set_dwell_secs(&mut self, secs: u64) -> Result<()> {
        self.write_setpoint(Setpoint::DwellSecs(secs)).await
    }

    pub async fn set_verbose(&mut self, on: bool) -> Result<()> {
        self.write_setpoint(Setpoint::Verbose(on)).await
    }

    /// Write one setpoint frame and wait for the acknowledgement byte.
    pub async fn write_setpoint(&mut self, setpoint: Setpoint) -> Result<()> {
        let frame = setpoint.encode();
        debug!(tx = %hex::encode(&frame), "writing setpoint");
        self.transport.write_all(&frame).await?;
        let verdict = timeout(REPLY_TIMEOUT, self.transport.read_u8())
            .await
            .map_err(|_| anyhow!("timed out waiting for the write acknowledgement"))?
            .context("reading the write acknowledgement")?;
        match verdict {
            ACK => Ok(()),
            NAK => Err(anyhow!("device rejected the write")),
            other => Err(anyhow!("unexpected acknowledgement byte {other:#04x}")),
        }
    }

    async fn query(&mut self, query: Query) -> Result<Vec<u8>> {
        self.transport.write_all(&[query.byte()]).await?;
        let reply = self.read_reply().await?;
        debug!(?query, rx = %hex::encode(&reply), "query reply");
        Ok(reply)
    }

    /// Accumulate one reply until the line goes quiet.
    async fn read_reply(&mut self) -> Result<Vec<u8>> {
        let mut reply = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let wait = if reply.is_empty() {
                REPLY_TIMEOUT
            } else {
                REPLY_QUIET
            };
            match timeout(wait, self.transport.read(&mut buf)).await {
                Err(_) if reply.is_empty() => {
                    return Err(anyhow!("timed out waiting for a reply"))
                }
                Err(_) => return Ok(reply),
                Ok(Ok(0)) if reply.is_empty() => {
                    return Err(anyhow!("connection closed before a reply arrived"))
                }
                Ok(Ok(0)) => return Ok(reply),
                Ok(Ok(n)) => reply.extend_from_slice(&buf[..n]),
                Ok(Err(err)) => return Err(err).context("reading a reply"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
