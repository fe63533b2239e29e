//! Configuration: pack geometry, boot setpoints, serial timing and the
//! simulated board's parameters.
//!
//! Everything has a default matching the 20-cell board, so a config file is
//! optional and may override any subset of sections.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pack: PackConfig,
    pub limits: Limits,
    pub serial: SerialConfig,
    pub sim: SimConfig,
}

/// Fixed geometry of the pack and its measurement harness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackConfig {
    /// Number of series cells.
    pub cell_count: usize,
    /// Discharge channels on the I/O expander bank; a multiple of 8.
    pub drain_channels: usize,
    /// Harness map: logical cell index -> raw ADC channel index.
    pub cell_map: Vec<usize>,
    /// Per-cell voltage read as 0 % capacity.
    pub capacity_floor_v: f64,
    /// Per-cell voltage read as 100 % capacity.
    pub capacity_ceiling_v: f64,
}

impl Default for PackConfig {
    fn default() -> Self {
        PackConfig {
            cell_count: 20,
            drain_channels: 24,
            // The 20s board's harness order.
            cell_map: vec![
                18, 15, 12, 6, 3, 9, 0, 7, 16, 13, 10, 19, 1, 4, 20, 17, 11, 5, 2, 14,
            ],
            capacity_floor_v: 3.4,
            capacity_ceiling_v: 4.2,
        }
    }
}

/// Runtime-adjustable setpoints. These are the boot values; every field is
/// also writable over the serial protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// A cell below this voltage shuts the pack down.
    pub min_cell_voltage: f64,
    /// A cell above this voltage shuts the pack down.
    pub max_cell_voltage: f64,
    /// Per-cell voltage the charge/balance cycle steers toward.
    pub target_voltage: f64,
    /// Largest tolerated cell-to-cell voltage difference.
    pub balance_margin: f64,
    /// Charge/balance hold time between measurement passes, in seconds.
    pub dwell_secs: u64,
    /// Temperature above which charging/balancing stops, in °C. Shutdown
    /// latches 20 °C above it.
    pub max_temperature: f64,
    /// Temperature above which the fan runs, in °C.
    pub fan_trigger: f64,
    /// Emit per-pass measurement detail in the log.
    pub verbose: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            min_cell_voltage: 3.4,
            max_cell_voltage: 4.25,
            target_voltage: 3.85,
            balance_margin: 0.01,
            dwell_secs: 32,
            max_temperature: 80.0,
            fan_trigger: 50.0,
            verbose: false,
        }
    }
}

/// Serial framing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    /// Line-quiet gap that delimits a write payload, in milliseconds.
    pub frame_gap_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig { frame_gap_ms: 100 }
    }
}

/// Parameters of the simulated board.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Mean initial cell voltage.
    pub start_voltage: f64,
    /// Total initial cell-to-cell spread, lowest to highest.
    pub spread: f64,
    /// Ambient temperature the board relaxes toward, in °C.
    pub ambient_temp: f64,
    /// Uniform measurement noise amplitude, in volts.
    pub noise: f64,
    /// Cell voltage rise while the charger relay is closed, in V/s.
    pub charge_rate: f64,
    /// Cell voltage drop while its drain resistor conducts, in V/s.
    pub drain_rate: f64,
    /// Seed for the measurement-noise generator.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        // A dwell at these rates moves a cell by less than the default
        // balance margin, so the default cycle converges instead of
        // oscillating around the target.
        SimConfig {
            start_voltage: 3.8,
            spread: 0.04,
            ambient_temp: 22.0,
            noise: 0.0005,
            charge_rate: 0.0002,
            drain_rate: 0.0002,
            seed: 42,
        }
    }
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the given file, or fall back to the board defaults when no path
    /// is supplied.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => Config::load(path),
            None => Ok(Config::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |field: &str, message: String| {
            Err(ConfigError::ValidationError {
                field: field.to_string(),
                message,
            })
        };

        if self.pack.cell_count == 0 {
            return fail("pack.cell_count", "must be at least 1".into());
        }
        if self.pack.drain_channels < self.pack.cell_count {
            return fail(
                "pack.drain_channels",
                format!(
                    "must cover all {} cells, got {}",
                    self.pack.cell_count, self.pack.drain_channels
                ),
            );
        }
        if self.pack.drain_channels % 8 != 0 {
            return fail(
                "pack.drain_channels",
                "expander bank width must be a multiple of 8".into(),
            );
        }
        if self.pack.cell_map.len() != self.pack.cell_count {
            return fail(
                "pack.cell_map",
                format!(
                    "must have one entry per cell: expected {}, got {}",
                    self.pack.cell_count,
                    self.pack.cell_map.len()
                ),
            );
        }
        let distinct: HashSet<usize> = self.pack.cell_map.iter().copied().collect();
        if distinct.len() != self.pack.cell_map.len() {
            return fail("pack.cell_map", "ADC channels must be unique".into());
        }
        if self.pack.capacity_floor_v >= self.pack.capacity_ceiling_v {
            return fail(
                "pack.capacity_floor_v",
                "capacity window must have floor below ceiling".into(),
            );
        }
        if self.limits.min_cell_voltage >= self.limits.max_cell_voltage {
            return fail(
                "limits.min_cell_voltage",
                "minimum cell voltage must be below the maximum".into(),
            );
        }
        if self.limits.balance_margin <= 0.0 {
            return fail("limits.balance_margin", "must be positive".into());
        }
        if self.serial.frame_gap_ms == 0 {
            return fail("serial.frame_gap_ms", "must be at least 1 ms".into());
        }
        if self.sim.noise < 0.0 || self.sim.spread < 0.0 {
            return fail("sim", "noise and spread must be non-negative".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_twenty_cell_board() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pack.cell_count, 20);
        assert_eq!(config.pack.drain_channels, 24);
        assert_eq!(config.limits.target_voltage, 3.85);
        assert_eq!(config.limits.dwell_secs, 32);
    }

    #[test]
    fn partial_file_overrides_one_section() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            target_voltage = 3.7
            dwell_secs = 16
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.limits.target_voltage, 3.7);
        assert_eq!(config.limits.dwell_secs, 16);
        // Untouched sections keep the board defaults.
        assert_eq!(config.pack.cell_count, 20);
        assert_eq!(config.limits.max_temperature, 80.0);
    }

    #[test]
    fn rejects_duplicate_harness_channels() {
        let mut config = Config::default();
        config.pack.cell_map[1] = config.pack.cell_map[0];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { field, .. } if field == "pack.cell_map"));
    }

    #[test]
    fn rejects_narrow_drain_bank() {
        let mut config = Config::default();
        config.pack.drain_channels = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_voltage_window() {
        let mut config = Config::default();
        config.limits.min_cell_voltage = 4.3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
            [limits]
            target_volts = 3.7
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load(Path::new("/nonexistent/celltend.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
