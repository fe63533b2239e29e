//! Hardware seams.
//!
//! The control core drives the board through these traits: an ADC bank
//! for cell sensing, an I/O expander bank for the discharge resistors,
//! analog temperature channels, plain switches, the capacity lamp and one
//! persisted fault flag. Register-level behavior lives behind the
//! implementations and is out of scope here.

pub mod sim;

use anyhow::Result;

/// The cell-sensing ADC bank.
pub trait CellSense {
    /// Bring the converters out of sleep.
    fn wake(&mut self) -> Result<()>;
    /// Run the bank's self-offset calibration.
    fn calibrate(&mut self) -> Result<()>;
    /// Sweep every raw channel, in volts. The harness map picks cells out
    /// of this vector, so it must cover the highest mapped channel.
    fn read_raw(&mut self) -> Result<Vec<f64>>;
    /// Put the converters to sleep.
    fn sleep(&mut self) -> Result<()>;
}

/// The discharge-resistor switch bank.
pub trait DrainBank {
    /// Drive every channel; `true` closes the drain switch.
    fn apply(&mut self, channels: &[bool]) -> Result<()>;
}

/// Board temperature channels.
pub trait TempSense {
    /// Raw 16-bit counts from each thermistor channel.
    fn read_counts(&mut self) -> Result<Vec<u16>>;
    /// The microcontroller die temperature in °C.
    fn die_celsius(&mut self) -> f64;
}

/// A single on/off output: fan, buzzer, charger relay.
pub trait Switch {
    fn set(&mut self, on: bool) -> Result<()>;
    fn get(&self) -> bool;
}

/// The RGB capacity lamp.
pub trait StatusLamp {
    fn set_color(&mut self, r: u8, g: u8, b: u8);
}

/// One flag that survives power loss, for reporting a fault after reboot.
pub trait FaultMemory {
    fn load(&mut self) -> Result<bool>;
    fn store(&mut self, fault: bool) -> Result<()>;
}

/// Everything on the board the controller owns.
pub struct Peripherals {
    pub cells: Box<dyn CellSense + Send>,
    pub drains: Box<dyn DrainBank + Send>,
    pub temps: Box<dyn TempSense + Send>,
    pub fan: Box<dyn Switch + Send>,
    pub buzzer: Box<dyn Switch + Send>,
    pub charger: Box<dyn Switch + Send>,
    pub lamp: Box<dyn StatusLamp + Send>,
    pub fault_flag: Box<dyn FaultMemory + Send>,
}

/// Pack drain channels into expander bytes: bit `i` of byte `k` drives
/// channel `8k + i`.
pub fn pack_drain_bytes(channels: &[bool]) -> Vec<u8> {
    channels
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (bit, &on)| if on { byte | 1 << bit } else { byte })
        })
        .collect()
}

/// Convert a thermistor channel's raw counts to °C: 3.3 V full scale over
/// 16 bits, 500 mV offset, 10 mV/°C.
pub fn counts_to_celsius(counts: u16) -> f64 {
    round2((counts as f64 * 3.3 / 65536.0 - 0.5) * 100.0)
}

/// Round to two decimals, the resolution the temperature path reports.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_bytes_follow_expander_wiring() {
        let mut channels = vec![false; 24];
        channels[0] = true;
        channels[3] = true;
        channels[8] = true;
        channels[23] = true;
        assert_eq!(pack_drain_bytes(&channels), vec![0b0000_1001, 0b0000_0001, 0b1000_0000]);
    }

    #[test]
    fn drain_bytes_handle_a_short_tail() {
        // 10 channels still produce two bytes; the tail pads with zeros.
        let mut channels = vec![false; 10];
        channels[9] = true;
        assert_eq!(pack_drain_bytes(&channels), vec![0, 0b0000_0010]);
    }

    #[test]
    fn thermistor_conversion_matches_the_frontend() {
        // 0.5 V -> 0 °C
        let zero = (0.5f64 / 3.3 * 65536.0).round() as u16;
        assert!(counts_to_celsius(zero).abs() < 0.05);
        // 1.0 V -> 50 °C
        let fifty = (1.0f64 / 3.3 * 65536.0).round() as u16;
        assert!((counts_to_celsius(fifty) - 50.0).abs() < 0.05);
        // Full scale -> 280 °C
        assert!((counts_to_celsius(u16::MAX) - 280.0).abs() < 0.05);
    }

    #[test]
    fn round2_keeps_two_decimals() {
        assert_eq!(round2(23.4567), 23.46);
        assert_eq!(round2(-4.005), -4.0);
    }
}
