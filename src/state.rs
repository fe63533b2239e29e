//! Pack state types and the quantities derived from a cell sweep.

use crate::config::PackConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The operating mode of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Monitor only: measure, supervise limits, answer the serial port.
    Idle,
    /// Run the charge/balance cycle on top of monitoring.
    Balance,
    /// Latched safe state: charger open, drains off, ADCs asleep.
    Shutdown,
}

impl Mode {
    /// The protocol encoding, ASCII `'0'`/`'1'`/`'2'`.
    pub fn wire(self) -> u8 {
        match self {
            Mode::Idle => b'0',
            Mode::Balance => b'1',
            Mode::Shutdown => b'2',
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Idle => write!(f, "idle"),
            Mode::Balance => write!(f, "balance"),
            Mode::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// One cell picked out of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellReading {
    pub index: usize,
    /// The cell voltage in volts.
    pub voltage: f64,
}

/// Quantities derived from one full cell sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct PackReadings {
    /// The cell voltages in volts, in logical cell order.
    pub cells: Vec<f64>,
    /// The pack voltage in volts (sum of all cells).
    pub pack_voltage: f64,
    /// The mean cell voltage in volts.
    pub mean_voltage: f64,
    /// Remaining capacity in percent, from the pack voltage window.
    pub capacity_pct: u8,
    /// The lowest cell in the sweep.
    pub min_cell: CellReading,
    /// The highest cell in the sweep.
    pub max_cell: CellReading,
}

impl PackReadings {
    pub fn from_cells(cells: &[f64], pack: &PackConfig) -> Self {
        let pack_voltage: f64 = cells.iter().sum();
        let mean_voltage = if cells.is_empty() {
            0.0
        } else {
            pack_voltage / cells.len() as f64
        };
        let mut min_cell = CellReading { index: 0, voltage: f64::INFINITY };
        let mut max_cell = CellReading { index: 0, voltage: f64::NEG_INFINITY };
        for (index, &voltage) in cells.iter().enumerate() {
            if voltage < min_cell.voltage {
                min_cell = CellReading { index, voltage };
            }
            if voltage > max_cell.voltage {
                max_cell = CellReading { index, voltage };
            }
        }
        let floor = pack.capacity_floor_v * cells.len() as f64;
        let ceiling = pack.capacity_ceiling_v * cells.len() as f64;
        PackReadings {
            cells: cells.to_vec(),
            pack_voltage,
            mean_voltage,
            capacity_pct: capacity_pct(pack_voltage, floor, ceiling),
            min_cell,
            max_cell,
        }
    }

    /// Voltage difference between the highest and lowest cell.
    pub fn spread(&self) -> f64 {
        self.max_cell.voltage - self.min_cell.voltage
    }
}

/// Map a pack voltage onto 0..=100 % over the given window, saturating
/// outside of it. Halfway values round to the even percent.
pub fn capacity_pct(pack_voltage: f64, floor_v: f64, ceiling_v: f64) -> u8 {
    let scaled = 100.0 / (ceiling_v - floor_v) * (pack_voltage - floor_v);
    scaled.round_ties_even().clamp(0.0, 100.0) as u8
}

/// Capacity lamp gradient: full red at 0 %, full green at 100 %.
pub fn lamp_color(capacity_pct: u8) -> (u8, u8, u8) {
    let c = capacity_pct as f64;
    let r = (-255.0 / 100.0 * c + 255.0) as u8;
    let g = (255.0 / 100.0 * c) as u8;
    (r, g, 0)
}

/// The assembled view a host sees after polling every query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackSnapshot {
    /// The pack voltage in volts.
    pub pack_voltage: f64,
    /// Remaining capacity in percent.
    pub capacity_pct: u8,
    /// The mean cell voltage in volts.
    pub mean_cell_voltage: f64,
    /// The voltage of each cell in volts, in logical cell order.
    pub cell_voltages: Vec<f64>,
    /// Board temperatures in °C; the last entry is the die temperature.
    pub temperatures: Vec<f64>,
    /// True when the device has latched into shutdown.
    pub fault: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
