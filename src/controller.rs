//! The control loop that owns the board.
//!
//! One [`Controller`] owns every peripheral and runs a one-second tick:
//! sweep the cells, enforce the voltage and temperature limits, run the
//! charge/balance cycle when commanded, and answer one host request.
//! Serial sessions talk to it through an mpsc channel, so the loop never
//! races the protocol handlers over the hardware.

use crate::balance::{self, BalanceOutcome};
use crate::config::{Config, Limits, PackConfig};
use crate::hardware::{counts_to_celsius, round2, Peripherals};
use crate::protocol::{self, Command, Query, Setpoint};
use crate::state::{lamp_color, Mode, PackReadings};
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Seconds the cells rest after a drain change before they are measured.
const SETTLE_SECS: u64 = 5;
/// Sweeps tried before a measurement fault is declared.
const MEASURE_ATTEMPTS: u32 = 4;
/// Largest credible per-cell change between consecutive sweeps, in volts.
const FAULT_DELTA_V: f64 = 0.05;
/// Seconds between temperature checks while the drains dwell.
const SUPERVISION_PERIOD_SECS: u64 = 8;
/// Degrees above the temperature limit that force a shutdown.
const THERMAL_SHUTDOWN_HEADROOM_C: f64 = 20.0;
/// Quiet passes required before a charge/balance cycle is declared done.
const CONFIRMATION_PASSES: u32 = 4;
/// Pause between control ticks.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// One decoded host request and the slot its reply goes to.
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Reply>,
}

/// The controller's answer to a request.
#[derive(Debug)]
pub enum Reply {
    /// The setpoint write was applied.
    Ack,
    /// The encoded payload of a query reply.
    Data(Vec<u8>),
}

/// The control loop. Construct it with [`Controller::new`] and drive it
/// with [`Controller::run`].
pub struct Controller {
    hw: Peripherals,
    pack: PackConfig,
    limits: Limits,
    requests: mpsc::Receiver<Request>,
    mode: Mode,
    /// Wanted drain state, pushed to the expanders at the top of each tick.
    drains: Vec<bool>,
    readings: PackReadings,
    /// Baseline for the glitch check, from the last accepted sweep.
    last_cells: Vec<f64>,
    /// Thermistor temperatures plus the die temperature, in °C.
    temps: Vec<f64>,
    confirmations: u32,
    adc_awake: bool,
}

impl Controller {
    pub fn new(config: &Config, hw: Peripherals, requests: mpsc::Receiver<Request>) -> Self {
        let cells = vec![0.0; config.pack.cell_count];
        Controller {
            hw,
            pack: config.pack.clone(),
            limits: config.limits.clone(),
            requests,
            mode: Mode::Idle,
            drains: vec![false; config.pack.drain_channels],
            readings: PackReadings::from_cells(&cells, &config.pack),
            last_cells: cells,
            temps: Vec::new(),
            confirmations: 0,
            adc_awake: false,
        }
    }

    /// Bring the board to a known state and run the tick loop forever.
    pub async fn run(mut self) -> Result<()> {
        self.init()?;
        loop {
            self.tick().await?;
            sleep(TICK_PERIOD).await;
        }
    }

    fn init(&mut self) -> Result<()> {
        info!("calibrating cell ADCs");
        self.hw.cells.wake()?;
        self.hw.cells.calibrate()?;
        self.adc_awake = true;

        self.drains = vec![false; self.pack.drain_channels];
        self.hw.drains.apply(&self.drains)?;
        self.hw.lamp.set_color(0, 0, 0);

        if self.hw.fault_flag.load()? {
            warn!("a measurement or battery fault latched during previous operation");
            self.hw.fault_flag.store(false)?;
        }

        let cells = self.sweep()?;
        self.readings = PackReadings::from_cells(&cells, &self.pack);
        self.last_cells = cells;
        self.refresh_temps()?;
        Ok(())
    }

    /// One pass of the control loop.
    async fn tick(&mut self) -> Result<()> {
        if self.mode != Mode::Shutdown {
            self.hw.drains.apply(&self.drains)?;
            if self.mode == Mode::Balance {
                if self.limits.verbose {
                    debug!("allowing cells to settle");
                }
                sleep(Duration::from_secs(SETTLE_SECS)).await;
            }

            if self.measure()? {
                self.hw.buzzer.set(true)?;
                self.hw.fault_flag.store(true)?;
                self.mode = Mode::Shutdown;
                error!(
                    "cell voltage changed rapidly between measurements; \
                     shutting down to avoid possible damage"
                );
                return Ok(());
            }
            self.hw.buzzer.set(false)?;

            if self.limits.verbose {
                debug!(
                    volts = self.readings.pack_voltage,
                    capacity = self.readings.capacity_pct,
                    "pack measured"
                );
            }

            let mut tripped = false;
            for (cell, &volts) in self.readings.cells.iter().enumerate() {
                if volts > self.limits.max_cell_voltage {
                    error!(cell, volts, maximum = self.limits.max_cell_voltage, "cell above the maximum voltage");
                    tripped = true;
                } else if volts < self.limits.min_cell_voltage {
                    error!(cell, volts, minimum = self.limits.min_cell_voltage, "cell below the minimum voltage");
                    tripped = true;
                }
            }
            if tripped {
                self.mode = Mode::Shutdown;
                self.hw.buzzer.set(true)?;
                sleep(Duration::from_secs(1)).await;
                self.hw.buzzer.set(false)?;
                return Ok(());
            }

            let (r, g, b) = lamp_color(self.readings.capacity_pct);
            self.hw.lamp.set_color(r, g, b);

            if self.supervise_temps()? {
                return Ok(());
            }
        }

        match self.mode {
            Mode::Balance => {
                if self.max_temp() < self.limits.max_temperature {
                    self.balance_pass().await?;
                } else {
                    info!("unable to charge/balance due to high temperatures");
                }
            }
            Mode::Shutdown => {
                self.hw.buzzer.set(false)?;
                self.hw.charger.set(false)?;
                self.drains = vec![false; self.pack.drain_channels];
                self.hw.drains.apply(&self.drains)?;
                if self.adc_awake {
                    self.hw.cells.sleep()?;
                    self.adc_awake = false;
                }
            }
            Mode::Idle => {}
        }

        self.answer_one_request()
    }

    /// One raw sweep mapped into logical cell order.
    fn sweep(&mut self) -> Result<Vec<f64>> {
        if self.limits.verbose {
            debug!("checking cells");
        }
        let raw = self.hw.cells.read_raw()?;
        let mut cells = Vec::with_capacity(self.pack.cell_count);
        for cell in 0..self.pack.cell_count {
            let channel = self.pack.cell_map[cell];
            let volts = raw.get(channel).copied().ok_or_else(|| {
                anyhow!(
                    "ADC sweep returned {} channels but cell {cell} is wired to channel {channel}",
                    raw.len()
                )
            })?;
            cells.push(volts);
        }
        Ok(cells)
    }

    /// Sweep the cells into `readings`, retrying while the sweep disagrees
    /// with the last accepted one. Returns true when every attempt glitched.
    ///
    /// The glitch check only applies while balancing; at rest the first
    /// sweep is taken as-is.
    fn measure(&mut self) -> Result<bool> {
        for attempt in 1..=MEASURE_ATTEMPTS {
            let cells = self.sweep()?;
            if self.mode == Mode::Balance {
                let glitched = cells
                    .iter()
                    .zip(&self.last_cells)
                    .any(|(now, last)| (now - last).abs() > FAULT_DELTA_V);
                if glitched {
                    debug!(attempt, "cell sweep disagrees with the last one, measuring again");
                    continue;
                }
            }
            self.readings = PackReadings::from_cells(&cells, &self.pack);
            self.last_cells = cells;
            return Ok(false);
        }
        Ok(true)
    }

    fn refresh_temps(&mut self) -> Result<()> {
        let counts = self.hw.temps.read_counts()?;
        let mut temps: Vec<f64> = counts.iter().map(|&c| counts_to_celsius(c)).collect();
        temps.push(round2(self.hw.temps.die_celsius()));
        self.temps = temps;
        Ok(())
    }

    fn max_temp(&self) -> f64 {
        self.temps.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Refresh the temperatures, drive the fan, and latch a thermal
    /// shutdown when the board runs away past the limit. Returns true when
    /// the shutdown latched.
    fn supervise_temps(&mut self) -> Result<bool> {
        self.refresh_temps()?;
        if self.limits.verbose {
            debug!(temps = ?self.temps, "board temperatures");
        }
        let hottest = self.max_temp();
        self.hw.fan.set(hottest > self.limits.fan_trigger)?;
        if hottest > self.limits.max_temperature + THERMAL_SHUTDOWN_HEADROOM_C {
            error!(hottest, "thermal shutdown");
            self.hw.buzzer.set(true)?;
            self.mode = Mode::Shutdown;
            return Ok(true);
        }
        Ok(false)
    }

    /// One pass of the charge/balance cycle, including the drain dwell.
    async fn balance_pass(&mut self) -> Result<()> {
        match balance::plan(&self.readings, &self.limits, self.pack.drain_channels) {
            BalanceOutcome::Misconfigured => {
                error!(
                    target = self.limits.target_voltage,
                    "target voltage outside the permitted range, terminating charge/balance cycle"
                );
                self.hw.buzzer.set(true)?;
                self.hw.charger.set(false)?;
                self.drains = vec![false; self.pack.drain_channels];
                self.hw.drains.apply(&self.drains)?;
                self.mode = Mode::Idle;
                sleep(Duration::from_secs(1)).await;
            }
            BalanceOutcome::Settling { charge, drains } => {
                let draining = drains.iter().any(|&on| on);
                if draining {
                    self.confirmations = 0;
                }
                if charge {
                    if self.limits.verbose {
                        debug!(
                            deficit = self.limits.target_voltage - self.readings.mean_voltage,
                            "mean cell voltage is under the target"
                        );
                    }
                    info!("charging");
                }
                self.hw.charger.set(charge)?;
                if draining {
                    if self.readings.spread() > self.limits.balance_margin {
                        info!("balancing");
                    } else {
                        info!("discharging");
                    }
                    self.drains = drains;
                    self.hw.drains.apply(&self.drains)?;
                }

                for _ in 0..(self.limits.dwell_secs / SUPERVISION_PERIOD_SECS) {
                    let tripped = self.supervise_temps()?;
                    if tripped || self.max_temp() > self.limits.max_temperature {
                        info!("temperature exceeded the permitted maximum while balancing");
                        break;
                    }
                    sleep(Duration::from_secs(SUPERVISION_PERIOD_SECS)).await;
                }

                // The drains rest until the next tick pushes the cleared
                // state; the settle delay then precedes the next sweep.
                self.drains = vec![false; self.pack.drain_channels];
                self.hw.charger.set(false)?;
            }
            BalanceOutcome::Quiet => {
                if self.confirmations < CONFIRMATION_PASSES {
                    info!(pass = self.confirmations, "confirming successful charge/balance");
                    self.confirmations += 1;
                    sleep(Duration::from_secs(SUPERVISION_PERIOD_SECS)).await;
                } else {
                    info!(cells = ?self.readings.cells, "charge/balance complete");
                    for _ in 0..2 {
                        self.hw.buzzer.set(true)?;
                        sleep(Duration::from_millis(100)).await;
                        self.hw.buzzer.set(false)?;
                        sleep(Duration::from_millis(100)).await;
                    }
                    info!("switching to idle");
                    self.mode = Mode::Idle;
                    self.confirmations = 0;
                }
            }
        }
        Ok(())
    }

    /// Serve at most one queued host request.
    fn answer_one_request(&mut self) -> Result<()> {
        let request = match self.requests.try_recv() {
            Ok(request) => request,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
        };
        debug!(command = ?request.command, "host request");
        let reply = match &request.command {
            Command::Query(query) => Reply::Data(self.answer(*query)),
            Command::Set(setpoint) => {
                self.apply(setpoint.clone())?;
                Reply::Ack
            }
        };
        if request.reply.send(reply).is_err() {
            debug!("session hung up before the reply");
        }
        Ok(())
    }

    fn answer(&self, query: Query) -> Vec<u8> {
        match query {
            Query::PackVoltage => protocol::encode_voltage(self.readings.pack_voltage),
            Query::Capacity => protocol::encode_capacity(self.readings.capacity_pct),
            Query::MeanCellVoltage => protocol::encode_voltage(self.readings.mean_voltage),
            Query::CellVoltages => protocol::encode_cell_voltages(&self.readings.cells),
            Query::Temperatures => protocol::encode_temperatures(&self.temps),
            Query::Status => protocol::encode_status(self.mode == Mode::Shutdown),
        }
    }

    fn apply(&mut self, setpoint: Setpoint) -> Result<()> {
        if self.limits.verbose {
            debug!(?setpoint, "applying setpoint");
        }
        match setpoint {
            Setpoint::Mode(mode) => {
                if self.mode == Mode::Shutdown && mode != Mode::Shutdown && !self.adc_awake {
                    self.hw.cells.wake()?;
                    self.adc_awake = true;
                }
                self.mode = mode;
            }
            Setpoint::MaxTemperature(v) => self.limits.max_temperature = v,
            Setpoint::FanTrigger(v) => self.limits.fan_trigger = v,
            Setpoint::MinCellVoltage(v) => self.limits.min_cell_voltage = v,
            Setpoint::MaxCellVoltage(v) => self.limits.max_cell_voltage = v,
            Setpoint::TargetVoltage(v) => self.limits.target_voltage = v,
            Setpoint::BalanceMargin(v) => self.limits.balance_margin = v,
            Setpoint::DwellSecs(s) => self.limits.dwell_secs = s,
            Setpoint::Verbose(on) => self.limits.verbose = on,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
