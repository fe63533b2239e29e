//! A simulated board: integrating pack model plus every peripheral trait.
//!
//! The model advances on every read, using the tokio clock so tests under
//! `tokio::time::pause` stay deterministic: charging raises all cells,
//! a closed drain pulls its cell down, resistor and charge heat warm the
//! board while the fan speeds cooling. Raw ADC channels come back through
//! the inverse harness map with a little uniform noise, so the
//! controller's `cell_map` is genuinely exercised.
//!
//! Construct it inside a tokio runtime (it samples the tokio clock).

use super::{
    pack_drain_bytes, CellSense, DrainBank, FaultMemory, Peripherals, StatusLamp, Switch,
    TempSense,
};
use crate::config::Config;
use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// Thermistor channels on the board (the die sensor comes on top).
pub const THERMISTOR_CHANNELS: usize = 4;

// Physical clamp on a simulated cell.
const CELL_FLOOR_V: f64 = 2.5;
const CELL_CEILING_V: f64 = 4.6;

// Thermal model constants.
const COOLING_PER_S: f64 = 0.02;
const FAN_COOLING_FACTOR: f64 = 5.0;
const DRAIN_HEAT_C_PER_S: f64 = 0.05;
const CHARGE_HEAT_C_PER_S: f64 = 0.04;
const DIE_OFFSET_C: f64 = 8.0;

struct SimState {
    cell_count: usize,
    cell_map: Vec<usize>,
    raw_channels: usize,
    charge_rate: f64,
    drain_rate: f64,
    noise: f64,
    ambient: f64,

    cells: Vec<f64>,
    node_temps: Vec<f64>,
    die_temp: f64,
    drains: Vec<bool>,
    expander_bytes: Vec<u8>,
    charger: bool,
    fan: bool,
    buzzer: bool,
    lamp: (u8, u8, u8),
    adc_awake: bool,
    fault: bool,

    beeps: u32,
    charge_engagements: u32,

    forced_cells: HashMap<usize, f64>,
    glitched_cell: Option<(usize, f64)>,
    forced_temp: Option<f64>,

    last_step: Instant,
    rng: StdRng,
}

impl SimState {
    /// Integrate the pack and thermal model over the time since the last
    /// step.
    fn step(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_step).as_secs_f64();
        self.last_step = now;
        if dt <= 0.0 {
            return;
        }

        for (i, cell) in self.cells.iter_mut().enumerate() {
            let mut dv = 0.0;
            if self.charger {
                dv += self.charge_rate;
            }
            if self.drains.get(i).copied().unwrap_or(false) {
                dv -= self.drain_rate;
            }
            *cell = (*cell + dv * dt).clamp(CELL_FLOOR_V, CELL_CEILING_V);
        }

        let active = self.drains.iter().filter(|&&on| on).count() as f64;
        let heat = active * DRAIN_HEAT_C_PER_S
            + if self.charger { CHARGE_HEAT_C_PER_S } else { 0.0 };
        let cooling = if self.fan {
            COOLING_PER_S * FAN_COOLING_FACTOR
        } else {
            COOLING_PER_S
        };
        let relax = (-cooling * dt).exp();
        for temp in self.node_temps.iter_mut() {
            *temp = self.ambient + (*temp - self.ambient) * relax + heat * dt;
        }
        let die_rest = self.ambient + DIE_OFFSET_C;
        self.die_temp = die_rest + (self.die_temp - die_rest) * relax + heat * 0.5 * dt;
    }

    fn measured_cell(&mut self, index: usize) -> f64 {
        let volts = self
            .forced_cells
            .get(&index)
            .copied()
            .unwrap_or(self.cells[index]);
        if self.noise > 0.0 {
            volts + self.rng.gen_range(-self.noise..=self.noise)
        } else {
            volts
        }
    }
}

/// Handle to the simulated board. Cloning shares the same board.
#[derive(Clone)]
pub struct SimBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimBoard {
    pub fn new(config: &Config) -> Self {
        let pack = &config.pack;
        let sim = &config.sim;
        let n = pack.cell_count;
        let cells: Vec<f64> = (0..n)
            .map(|i| {
                let offset = if n > 1 {
                    sim.spread * (i as f64 / (n - 1) as f64 - 0.5)
                } else {
                    0.0
                };
                sim.start_voltage + offset
            })
            .collect();
        let raw_channels = pack.cell_map.iter().copied().max().unwrap_or(0) + 1;
        let state = SimState {
            cell_count: n,
            cell_map: pack.cell_map.clone(),
            raw_channels,
            charge_rate: sim.charge_rate,
            drain_rate: sim.drain_rate,
            noise: sim.noise,
            ambient: sim.ambient_temp,
            cells,
            node_temps: vec![sim.ambient_temp; THERMISTOR_CHANNELS],
            die_temp: sim.ambient_temp + DIE_OFFSET_C,
            drains: vec![false; pack.drain_channels],
            expander_bytes: vec![0; pack.drain_channels / 8],
            charger: false,
            fan: false,
            buzzer: false,
            lamp: (0, 0, 0),
            adc_awake: false,
            fault: false,
            beeps: 0,
            charge_engagements: 0,
            forced_cells: HashMap::new(),
            glitched_cell: None,
            forced_temp: None,
            last_step: Instant::now(),
            rng: StdRng::seed_from_u64(sim.seed),
        };
        SimBoard {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// The peripheral bundle with the in-memory fault flag.
    pub fn peripherals(&self) -> Peripherals {
        self.peripherals_with_fault_flag(Box::new(SimFaultFlag(self.clone())))
    }

    /// The peripheral bundle with a caller-supplied fault flag (the
    /// `simulate` command passes a file-backed one).
    pub fn peripherals_with_fault_flag(
        &self,
        fault_flag: Box<dyn FaultMemory + Send>,
    ) -> Peripherals {
        Peripherals {
            cells: Box::new(SimCellSense(self.clone())),
            drains: Box::new(SimDrainBank(self.clone())),
            temps: Box::new(SimTempSense(self.clone())),
            fan: Box::new(SimSwitch::new(self.clone(), SwitchRole::Fan)),
            buzzer: Box::new(SimSwitch::new(self.clone(), SwitchRole::Buzzer)),
            charger: Box::new(SimSwitch::new(self.clone(), SwitchRole::Charger)),
            lamp: Box::new(SimLamp(self.clone())),
            fault_flag,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("sim board lock poisoned")
    }

    // ---- observers ----

    pub fn cells(&self) -> Vec<f64> {
        self.lock().cells.clone()
    }

    /// The bytes latched into the I/O expander bank.
    pub fn expander_bytes(&self) -> Vec<u8> {
        self.lock().expander_bytes.clone()
    }

    pub fn active_drains(&self) -> usize {
        self.lock().drains.iter().filter(|&&on| on).count()
    }

    pub fn charger_on(&self) -> bool {
        self.lock().charger
    }

    pub fn fan_on(&self) -> bool {
        self.lock().fan
    }

    pub fn buzzer_on(&self) -> bool {
        self.lock().buzzer
    }

    pub fn lamp(&self) -> (u8, u8, u8) {
        self.lock().lamp
    }

    /// Buzzer rising edges since boot.
    pub fn beeps(&self) -> u32 {
        self.lock().beeps
    }

    /// Charger relay rising edges since boot.
    pub fn charge_engagements(&self) -> u32 {
        self.lock().charge_engagements
    }

    pub fn adc_awake(&self) -> bool {
        self.lock().adc_awake
    }

    pub fn fault_flag(&self) -> bool {
        self.lock().fault
    }

    pub fn set_fault_flag(&self, fault: bool) {
        self.lock().fault = fault;
    }

    // ---- state and fault injection ----

    pub fn set_cell(&self, index: usize, volts: f64) {
        self.lock().cells[index] = volts;
    }

    /// Overwrite the model voltages, up to the cell count. A shorter slice
    /// sets a prefix and leaves the remaining cells alone.
    pub fn set_cells(&self, volts: &[f64]) {
        let mut state = self.lock();
        let n = state.cells.len().min(volts.len());
        state.cells[..n].copy_from_slice(&volts[..n]);
    }

    /// Pin what the ADC reports for one logical cell, regardless of the
    /// model. The model keeps evolving underneath.
    pub fn force_cell(&self, index: usize, volts: f64) {
        self.lock().forced_cells.insert(index, volts);
    }

    pub fn release_cell(&self, index: usize) {
        self.lock().forced_cells.remove(&index);
    }

    /// Corrupt the next raw sweep only: the given cell reads as `volts`
    /// once, then measurements come back clean.
    pub fn glitch_cell(&self, index: usize, volts: f64) {
        self.lock().glitched_cell = Some((index, volts));
    }

    /// Pin the first thermistor channel to a temperature.
    pub fn force_temperature(&self, celsius: f64) {
        self.lock().forced_temp = Some(celsius);
    }

    pub fn release_temperature(&self) {
        self.lock().forced_temp = None;
    }

    pub fn set_noise(&self, volts: f64) {
        self.lock().noise = volts;
    }
}

struct SimCellSense(SimBoard);

impl CellSense for SimCellSense {
    fn wake(&mut self) -> Result<()> {
        self.0.lock().adc_awake = true;
        Ok(())
    }

    fn calibrate(&mut self) -> Result<()> {
        // The model has no offset error to calibrate away.
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Vec<f64>> {
        let mut state = self.0.lock();
        if !state.adc_awake {
            return Err(anyhow!("cell ADC bank is asleep"));
        }
        state.step();
        let mut raw = vec![0.0; state.raw_channels];
        for i in 0..state.cell_count {
            let channel = state.cell_map[i];
            raw[channel] = state.measured_cell(i);
        }
        if let Some((index, volts)) = state.glitched_cell.take() {
            raw[state.cell_map[index]] = volts;
        }
        Ok(raw)
    }

    fn sleep(&mut self) -> Result<()> {
        self.0.lock().adc_awake = false;
        Ok(())
    }
}

struct SimDrainBank(SimBoard);

impl DrainBank for SimDrainBank {
    fn apply(&mut self, channels: &[bool]) -> Result<()> {
        let mut state = self.0.lock();
        state.step();
        let n = state.drains.len().min(channels.len());
        state.drains[..n].copy_from_slice(&channels[..n]);
        for extra in state.drains[n..].iter_mut() {
            *extra = false;
        }
        let bytes = pack_drain_bytes(&state.drains);
        state.expander_bytes = bytes;
        Ok(())
    }
}

struct SimTempSense(SimBoard);

impl TempSense for SimTempSense {
    fn read_counts(&mut self) -> Result<Vec<u16>> {
        let mut state = self.0.lock();
        state.step();
        let forced = state.forced_temp;
        Ok(state
            .node_temps
            .iter()
            .enumerate()
            .map(|(i, &temp)| {
                let celsius = match forced {
                    Some(f) if i == 0 => f,
                    _ => temp,
                };
                celsius_to_counts(celsius)
            })
            .collect())
    }

    fn die_celsius(&mut self) -> f64 {
        self.0.lock().die_temp
    }
}

/// Invert the thermistor frontend: °C back to raw 16-bit counts.
fn celsius_to_counts(celsius: f64) -> u16 {
    ((celsius / 100.0 + 0.5) * 65536.0 / 3.3)
        .round()
        .clamp(0.0, u16::MAX as f64) as u16
}

#[derive(Clone, Copy)]
enum SwitchRole {
    Fan,
    Buzzer,
    Charger,
}

struct SimSwitch {
    board: SimBoard,
    role: SwitchRole,
}

impl SimSwitch {
    fn new(board: SimBoard, role: SwitchRole) -> Self {
        SimSwitch { board, role }
    }
}

impl Switch for SimSwitch {
    fn set(&mut self, on: bool) -> Result<()> {
        let mut state = self.board.lock();
        state.step();
        match self.role {
            SwitchRole::Fan => state.fan = on,
            SwitchRole::Buzzer => {
                if on && !state.buzzer {
                    state.beeps += 1;
                }
                state.buzzer = on;
            }
            SwitchRole::Charger => {
                if on && !state.charger {
                    state.charge_engagements += 1;
                }
                state.charger = on;
            }
        }
        Ok(())
    }

    fn get(&self) -> bool {
        let state = self.board.lock();
        match self.role {
            SwitchRole::Fan => state.fan,
            SwitchRole::Buzzer => state.buzzer,
            SwitchRole::Charger => state.charger,
        }
    }
}

struct SimLamp(SimBoard);

impl StatusLamp for SimLamp {
    fn set_color(&mut self, r: u8, g: u8, b: u8) {
        self.0.lock().lamp = (r, g, b);
    }
}

struct SimFaultFlag(SimBoard);

impl FaultMemory for SimFaultFlag {
    fn load(&mut self) -> Result<bool> {
        Ok(self.0.lock().fault)
    }

    fn store(&mut self, fault: bool) -> Result<()> {
        self.0.lock().fault = fault;
        Ok(())
    }
}

/// A fault flag that survives process restarts: one ASCII byte in a file,
/// `'1'` latched, `'0'` or a missing file clear. The `simulate` command uses
/// this where the board kept the flag in MCU non-volatile memory.
pub struct FileFaultFlag {
    path: PathBuf,
}

impl FileFaultFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileFaultFlag { path: path.into() }
    }
}

impl FaultMemory for FileFaultFlag {
    fn load(&mut self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading fault flag {}", self.path.display()))?;
        Ok(text.trim().starts_with('1'))
    }

    fn store(&mut self, fault: bool) -> Result<()> {
        std::fs::write(&self.path, if fault { "1" } else { "0" })
            .with_context(|| format!("writing fault flag {}", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
