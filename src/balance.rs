//! Charge/balance planning.
//!
//! One pass of the charge/balance cycle is a pure decision over the latest
//! sweep: whether to close the charger relay and which drain resistors to
//! switch in. The controller owns the hardware and the dwell timing; this
//! module only picks the work.

use crate::config::Limits;
use crate::state::PackReadings;

/// Headroom kept below the maximum cell voltage while charging, in volts.
const CHARGE_HEADROOM_V: f64 = 0.05;

/// What one charge/balance pass should do.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceOutcome {
    /// The target voltage lies outside the permitted cell window; the cycle
    /// must abort.
    Misconfigured,
    /// Work remains: drive the charger relay and the drain bank as given.
    Settling {
        /// Close the charger relay for this pass.
        charge: bool,
        /// Drain switch per channel, sized to the expander bank.
        drains: Vec<bool>,
    },
    /// Neither charging nor draining is needed this pass.
    Quiet,
}

/// Decide one pass of the charge/balance cycle.
///
/// Charging runs while the lowest cell is under the minimum or the mean is
/// under the target, with headroom left below the maximum. Draining runs
/// while the cells are spread wider than the margin or the mean overshoots
/// the target, pulling the highest cells toward the lowest. Never more
/// than half the pack drains at once, and never a cell that is already at
/// the minimum.
pub fn plan(readings: &PackReadings, limits: &Limits, drain_channels: usize) -> BalanceOutcome {
    if limits.target_voltage < limits.min_cell_voltage
        || limits.target_voltage > limits.max_cell_voltage
    {
        return BalanceOutcome::Misconfigured;
    }

    let min = readings.min_cell.voltage;
    let max = readings.max_cell.voltage;
    let mean = readings.mean_voltage;
    let margin = limits.balance_margin;

    let charge = (min < limits.min_cell_voltage
        || mean < limits.target_voltage - margin / 2.0)
        && max < limits.max_cell_voltage - CHARGE_HEADROOM_V;

    let mut drains = vec![false; drain_channels];
    let mut draining = false;
    if (readings.spread() > margin || mean > limits.target_voltage + margin / 2.0)
        && min > limits.min_cell_voltage
    {
        draining = true;
        // Unbalanced cells chase the lowest cell; an overshot pack settles
        // back to the target.
        let local_target = if readings.spread() > margin {
            min + margin / 2.0
        } else {
            limits.target_voltage
        };
        let mut over: Vec<usize> = (0..readings.cells.len())
            .filter(|&i| readings.cells[i] > local_target)
            .collect();
        over.sort_by(|&a, &b| {
            readings.cells[b]
                .partial_cmp(&readings.cells[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for &cell in over.iter().take(readings.cells.len() / 2) {
            drains[cell] = true;
        }
    }

    if charge || draining {
        BalanceOutcome::Settling { charge, drains }
    } else {
        BalanceOutcome::Quiet
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackConfig;

    const DRAIN_CHANNELS: usize = 8;

    fn readings(cells: &[f64]) -> PackReadings {
        let pack = PackConfig {
            cell_count: cells.len(),
            drain_channels: DRAIN_CHANNELS,
            cell_map: (0..cells.len()).collect(),
            capacity_floor_v: 3.4,
            capacity_ceiling_v: 4.2,
        };
        PackReadings::from_cells(cells, &pack)
    }

    fn limits() -> Limits {
        Limits::default()
    }

    fn drains_of(outcome: BalanceOutcome) -> Vec<bool> {
        match outcome {
            BalanceOutcome::Settling { drains, .. } => drains,
            other => panic!("expected a settling pass, got {other:?}"),
        }
    }

    #[test]
    fn misconfigured_target_aborts() {
        let mut limits = limits();
        limits.target_voltage = 4.5;
        assert_eq!(
            plan(&readings(&[3.8; 4]), &limits, DRAIN_CHANNELS),
            BalanceOutcome::Misconfigured
        );
        limits.target_voltage = 3.0;
        assert_eq!(
            plan(&readings(&[3.8; 4]), &limits, DRAIN_CHANNELS),
            BalanceOutcome::Misconfigured
        );
    }

    #[test]
    fn low_mean_charges() {
        let outcome = plan(&readings(&[3.6, 3.6, 3.6, 3.6]), &limits(), DRAIN_CHANNELS);
        assert_eq!(
            outcome,
            BalanceOutcome::Settling {
                charge: true,
                drains: vec![false; DRAIN_CHANNELS],
            }
        );
    }

    #[test]
    fn charging_stops_near_the_maximum() {
        // Mean is low but one cell sits within the headroom of the maximum.
        let cells = [3.2, 3.2, 3.2, 4.21];
        let outcome = plan(&readings(&cells), &limits(), DRAIN_CHANNELS);
        // The low cells also sit below the minimum, so no draining either.
        assert_eq!(outcome, BalanceOutcome::Quiet);
    }

    #[test]
    fn spread_drains_the_highest_cells_toward_the_lowest() {
        let cells = [3.80, 3.86, 3.84, 3.82];
        let drains = drains_of(plan(&readings(&cells), &limits(), DRAIN_CHANNELS));
        // Half the pack at most: the two highest cells.
        assert_eq!(drains[..4], [false, true, true, false]);
        // Channels beyond the pack stay off.
        assert!(drains[4..].iter().all(|&on| !on));
    }

    #[test]
    fn drain_count_caps_at_half_the_pack() {
        // Every cell but one is above the local target.
        let cells = [3.80, 3.90, 3.91, 3.92, 3.93, 3.94];
        let drains = drains_of(plan(&readings(&cells), &limits(), DRAIN_CHANNELS));
        assert_eq!(drains.iter().filter(|&&on| on).count(), 3);
        // The highest cells go first.
        assert!(drains[5] && drains[4] && drains[3]);
        assert!(!drains[1]);
    }

    #[test]
    fn cells_below_the_local_target_are_never_drained() {
        let cells = [3.80, 3.803, 3.86, 3.84];
        let drains = drains_of(plan(&readings(&cells), &limits(), DRAIN_CHANNELS));
        // Local target is min + margin/2 = 3.805; cell 1 sits under it.
        assert!(!drains[0]);
        assert!(!drains[1]);
        assert!(drains[2] && drains[3]);
    }

    #[test]
    fn no_draining_while_the_lowest_cell_is_at_the_minimum() {
        // Wide spread, but pulling any cell down risks the low one.
        let cells = [3.39, 3.95, 3.95, 3.95];
        let outcome = plan(&readings(&cells), &limits(), DRAIN_CHANNELS);
        // Charging fires instead (min below minimum, max has headroom).
        assert_eq!(
            outcome,
            BalanceOutcome::Settling {
                charge: true,
                drains: vec![false; DRAIN_CHANNELS],
            }
        );
    }

    #[test]
    fn overshot_mean_discharges_to_the_target() {
        // Balanced within the margin but everything above target.
        let cells = [3.9, 3.902, 3.904, 3.906];
        let drains = drains_of(plan(&readings(&cells), &limits(), DRAIN_CHANNELS));
        // All four exceed the target; the cap keeps it to the top two.
        assert_eq!(drains[..4], [false, false, true, true]);
    }

    #[test]
    fn balanced_pack_at_target_is_quiet() {
        let cells = [3.848, 3.85, 3.852, 3.85];
        assert_eq!(
            plan(&readings(&cells), &limits(), DRAIN_CHANNELS),
            BalanceOutcome::Quiet
        );
    }
}
