//! The SERCOM request/response protocol spoken over the board's isolated
//! serial interface.
//!
//! A host frame starts with one instruction byte. If the most significant
//! bit is set the frame is a *write*: an ASCII payload of up to
//! [`MAX_PAYLOAD`] bytes follows, delimited by line quiet (the board's UART
//! idles between frames). If the bit is clear the frame is a *read* and
//! carries no payload.
//!
//! The device answers writes with a single byte, [`ACK`] or [`NAK`]. Reads
//! are answered with fixed-layout ASCII:
//!
//! | Byte   | Meaning                      | Reply layout                 |
//! |--------|------------------------------|------------------------------|
//! | `0x01` | pack voltage                 | 7 bytes                      |
//! | `0x02` | capacity percent             | integer digits               |
//! | `0x03` | mean cell voltage            | 7 bytes                      |
//! | `0x04` | all cell voltages            | 7 bytes + `\n` per cell      |
//! | `0x05` | temperatures                 | 5 bytes + `\n` per reading   |
//! | `0x06` | status                       | 1 byte, `1` when shut down   |
//! | `0x80` | set mode                     | payload `0`, `1` or `2`      |
//! | `0x81` | set maximum temperature      | ASCII float                  |
//! | `0x82` | set fan trigger temperature  | ASCII float                  |
//! | `0x83` | set minimum cell voltage     | ASCII float                  |
//! | `0x84` | set maximum cell voltage     | ASCII float                  |
//! | `0x85` | set target cell voltage      | ASCII float                  |
//! | `0x86` | set balance margin           | ASCII float                  |
//! | `0x87` | set dwell seconds            | ASCII integer                |
//! | `0x88` | set verbosity                | `0`/`1`/`true`/`false`       |
//!
//! Numeric reply fields are right-padded with `'0'` to their width;
//! overlong values are truncated to the field width instead of
//! overflowing it.

use crate::state::Mode;
use thiserror::Error;

/// Sent by the device once when a serial session opens.
pub const GREETING: u8 = 0x7F;

/// Write accepted and applied.
pub const ACK: u8 = 0xFF;

/// Write malformed or unknown; nothing was changed.
pub const NAK: u8 = 0x00;

/// Longest permitted write payload in bytes.
pub const MAX_PAYLOAD: usize = 63;

/// Width of a voltage reply field.
pub const VOLTAGE_WIDTH: usize = 7;

/// Width of a temperature reply field.
pub const TEMPERATURE_WIDTH: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown instruction byte 0x{0:02x}")]
    UnknownInstruction(u8),
    #[error("write instruction 0x{0:02x} carries no payload")]
    EmptyPayload(u8),
    #[error("payload exceeds {MAX_PAYLOAD} bytes")]
    OversizedPayload,
    #[error("payload is not ASCII text")]
    MalformedText,
    #[error("malformed number {0:?}")]
    MalformedNumber(String),
    #[error("value {0:?} is not finite")]
    NotFinite(String),
    #[error("unknown mode {0:?}, expected 0, 1 or 2")]
    UnknownMode(String),
    #[error("unknown flag {0:?}, expected 0/1/true/false")]
    UnknownFlag(String),
    #[error("reply too short: {0} bytes")]
    TruncatedReply(usize),
}

/// What the first byte of a host frame announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// MSB set: a setpoint write, ASCII payload follows.
    Write(u8),
    /// MSB clear: a state query, no payload.
    Read(u8),
}

impl Instruction {
    pub fn classify(byte: u8) -> Self {
        if byte & 0x80 != 0 {
            Instruction::Write(byte)
        } else {
            Instruction::Read(byte)
        }
    }
}

/// A state query the host can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    PackVoltage,
    Capacity,
    MeanCellVoltage,
    CellVoltages,
    Temperatures,
    Status,
}

impl Query {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Query::PackVoltage),
            0x02 => Ok(Query::Capacity),
            0x03 => Ok(Query::MeanCellVoltage),
            0x04 => Ok(Query::CellVoltages),
            0x05 => Ok(Query::Temperatures),
            0x06 => Ok(Query::Status),
            other => Err(ProtocolError::UnknownInstruction(other)),
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Query::PackVoltage => 0x01,
            Query::Capacity => 0x02,
            Query::MeanCellVoltage => 0x03,
            Query::CellVoltages => 0x04,
            Query::Temperatures => 0x05,
            Query::Status => 0x06,
        }
    }
}

/// A setpoint write with its decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Setpoint {
    Mode(Mode),
    MaxTemperature(f64),
    FanTrigger(f64),
    MinCellVoltage(f64),
    MaxCellVoltage(f64),
    TargetVoltage(f64),
    BalanceMargin(f64),
    DwellSecs(u64),
    Verbose(bool),
}

impl Setpoint {
    pub fn instruction(&self) -> u8 {
        match self {
            Setpoint::Mode(_) => 0x80,
            Setpoint::MaxTemperature(_) => 0x81,
            Setpoint::FanTrigger(_) => 0x82,
            Setpoint::MinCellVoltage(_) => 0x83,
            Setpoint::MaxCellVoltage(_) => 0x84,
            Setpoint::TargetVoltage(_) => 0x85,
            Setpoint::BalanceMargin(_) => 0x86,
            Setpoint::DwellSecs(_) => 0x87,
            Setpoint::Verbose(_) => 0x88,
        }
    }

    /// Decode a write frame's payload for the given instruction byte.
    pub fn parse(instruction: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::OversizedPayload);
        }
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload(instruction));
        }
        let text = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::MalformedText)?
            .trim();
        match instruction {
            0x80 => match text {
                "0" => Ok(Setpoint::Mode(Mode::Idle)),
                "1" => Ok(Setpoint::Mode(Mode::Balance)),
                "2" => Ok(Setpoint::Mode(Mode::Shutdown)),
                other => Err(ProtocolError::UnknownMode(other.to_string())),
            },
            0x81 => Ok(Setpoint::MaxTemperature(parse_finite(text)?)),
            0x82 => Ok(Setpoint::FanTrigger(parse_finite(text)?)),
            0x83 => Ok(Setpoint::MinCellVoltage(parse_finite(text)?)),
            0x84 => Ok(Setpoint::MaxCellVoltage(parse_finite(text)?)),
            0x85 => Ok(Setpoint::TargetVoltage(parse_finite(text)?)),
            0x86 => Ok(Setpoint::BalanceMargin(parse_finite(text)?)),
            0x87 => {
                let secs = text
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::MalformedNumber(text.to_string()))?;
                Ok(Setpoint::DwellSecs(secs))
            }
            0x88 => match text.to_ascii_lowercase().as_str() {
                "0" | "false" => Ok(Setpoint::Verbose(false)),
                "1" | "true" => Ok(Setpoint::Verbose(true)),
                other => Err(ProtocolError::UnknownFlag(other.to_string())),
            },
            other => Err(ProtocolError::UnknownInstruction(other)),
        }
    }

    /// Render the full wire frame: instruction byte followed by the ASCII
    /// payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Setpoint::Mode(mode) => (mode.wire() as char).to_string(),
            Setpoint::MaxTemperature(v)
            | Setpoint::FanTrigger(v)
            | Setpoint::MinCellVoltage(v)
            | Setpoint::MaxCellVoltage(v)
            | Setpoint::TargetVoltage(v)
            | Setpoint::BalanceMargin(v) => format!("{v}"),
            Setpoint::DwellSecs(s) => format!("{s}"),
            Setpoint::Verbose(true) => "1".to_string(),
            Setpoint::Verbose(false) => "0".to_string(),
        };
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(self.instruction());
        frame.extend_from_slice(payload.as_bytes());
        frame
    }
}

/// A decoded host request, ready for the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Query(Query),
    Set(Setpoint),
}

fn parse_finite(text: &str) -> Result<f64, ProtocolError> {
    let value = text
        .parse::<f64>()
        .map_err(|_| ProtocolError::MalformedNumber(text.to_string()))?;
    if !value.is_finite() {
        return Err(ProtocolError::NotFinite(text.to_string()));
    }
    Ok(value)
}

/// Format a number into a fixed-width ASCII field: right-padded with `'0'`,
/// truncated if the shortest representation is longer than the field.
///
/// Whole numbers gain a decimal point first, so the padding zeros read as
/// decimals.
pub fn fixed_ascii(value: f64, width: usize) -> String {
    let mut field = format!("{value}");
    if !field.contains('.') {
        field.push('.');
    }
    field.truncate(width);
    while field.len() < width {
        field.push('0');
    }
    field
}

pub fn encode_voltage(volts: f64) -> Vec<u8> {
    fixed_ascii(volts, VOLTAGE_WIDTH).into_bytes()
}

pub fn encode_capacity(percent: u8) -> Vec<u8> {
    format!("{percent}").into_bytes()
}

pub fn encode_cell_voltages(cells: &[f64]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(cells.len() * (VOLTAGE_WIDTH + 1));
    for &cell in cells {
        reply.extend_from_slice(fixed_ascii(cell, VOLTAGE_WIDTH).as_bytes());
        reply.push(b'\n');
    }
    reply
}

pub fn encode_temperatures(temps: &[f64]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(temps.len() * (TEMPERATURE_WIDTH + 1));
    for &temp in temps {
        reply.extend_from_slice(fixed_ascii(temp, TEMPERATURE_WIDTH).as_bytes());
        reply.push(b'\n');
    }
    reply
}

pub fn encode_status(shutdown: bool) -> Vec<u8> {
    if shutdown { b"1".to_vec() } else { b"0".to_vec() }
}

/// Parse a single numeric reply field (pack voltage, mean voltage).
pub fn decode_number(reply: &[u8]) -> Result<f64, ProtocolError> {
    if reply.is_empty() {
        return Err(ProtocolError::TruncatedReply(0));
    }
    let text = std::str::from_utf8(reply).map_err(|_| ProtocolError::MalformedText)?;
    text.trim()
        .parse::<f64>()
        .map_err(|_| ProtocolError::MalformedNumber(text.to_string()))
}

pub fn decode_capacity(reply: &[u8]) -> Result<u8, ProtocolError> {
    if reply.is_empty() {
        return Err(ProtocolError::TruncatedReply(0));
    }
    let text = std::str::from_utf8(reply).map_err(|_| ProtocolError::MalformedText)?;
    text.trim()
        .parse::<u8>()
        .map_err(|_| ProtocolError::MalformedNumber(text.to_string()))
}

/// Parse a newline-separated series reply (cell voltages, temperatures).
pub fn decode_series(reply: &[u8]) -> Result<Vec<f64>, ProtocolError> {
    let text = std::str::from_utf8(reply).map_err(|_| ProtocolError::MalformedText)?;
    text.split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .parse::<f64>()
                .map_err(|_| ProtocolError::MalformedNumber(line.to_string()))
        })
        .collect()
}

pub fn decode_status(reply: &[u8]) -> Result<bool, ProtocolError> {
    match reply.first() {
        Some(b'0') => Ok(false),
        Some(b'1') => Ok(true),
        Some(_) => Err(ProtocolError::MalformedText),
        None => Err(ProtocolError::TruncatedReply(0)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
