//! Controller behavior against the simulated board, driven through the
//! same request channel the serial sessions use. Time is paused, so whole
//! charge/balance cycles run in milliseconds.

use celltend::config::Config;
use celltend::controller::{Controller, Reply, Request};
use celltend::hardware::sim::SimBoard;
use celltend::protocol::{decode_series, Command, Query, Setpoint};
use celltend::state::Mode;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

fn test_config() -> Config {
    let mut config = Config::default();
    config.sim.noise = 0.0;
    config.sim.spread = 0.03;
    config.sim.start_voltage = 3.85;
    config.sim.charge_rate = 0.0005;
    config.sim.drain_rate = 0.0005;
    config.limits.dwell_secs = 16;
    config
}

fn start(config: &Config) -> (SimBoard, mpsc::Sender<Request>, JoinHandle<anyhow::Result<()>>) {
    let board = SimBoard::new(config);
    let (tx, rx) = mpsc::channel(16);
    let controller = Controller::new(config, board.peripherals(), rx);
    let handle = tokio::spawn(controller.run());
    (board, tx, handle)
}

async fn send(tx: &mpsc::Sender<Request>, command: Command) -> Reply {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(Request {
        command,
        reply: reply_tx,
    })
    .await
    .expect("controller is gone");
    reply_rx.await.expect("controller dropped the request")
}

async fn set_mode(tx: &mpsc::Sender<Request>, mode: Mode) {
    match send(tx, Command::Set(Setpoint::Mode(mode))).await {
        Reply::Ack => {}
        other => panic!("expected an ack, got {other:?}"),
    }
}

async fn is_shut_down(tx: &mpsc::Sender<Request>) -> bool {
    match send(tx, Command::Query(Query::Status)).await {
        Reply::Data(bytes) => bytes == b"1",
        Reply::Ack => panic!("expected status data"),
    }
}

/// Poll a condition while the controller keeps ticking.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        sleep(Duration::from_secs(5)).await;
    }
    false
}

fn spread(cells: &[f64]) -> f64 {
    let min = cells.iter().copied().fold(f64::INFINITY, f64::min);
    let max = cells.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    max - min
}

#[tokio::test(start_paused = true)]
async fn a_balance_cycle_converges_and_returns_to_idle() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    assert!(spread(&board.cells()) > config.limits.balance_margin);
    set_mode(&tx, Mode::Balance).await;

    // The completion chirp is two beeps.
    assert!(eventually(|| board.beeps() >= 2).await, "cycle never completed");

    assert!(spread(&board.cells()) < 0.012);
    assert_eq!(board.active_drains(), 0);
    assert!(!board.charger_on());
    assert!(board.charge_engagements() >= 1);
    assert!(!is_shut_down(&tx).await);
}

#[tokio::test(start_paused = true)]
async fn an_already_even_pack_completes_without_charging() {
    let config = test_config();
    let board = SimBoard::new(&config);
    board.set_cells(&[3.85; 20]);
    let (tx, rx) = mpsc::channel(16);
    let controller = Controller::new(&config, board.peripherals(), rx);
    let _controller = tokio::spawn(controller.run());

    set_mode(&tx, Mode::Balance).await;
    assert!(eventually(|| board.beeps() >= 2).await, "cycle never completed");

    // The pack never needed charge or drain, only the confirmation chirp.
    assert_eq!(board.beeps(), 2);
    assert_eq!(board.charge_engagements(), 0);
    assert_eq!(board.active_drains(), 0);
    assert!(!is_shut_down(&tx).await);
}

#[tokio::test(start_paused = true)]
async fn an_overvoltage_cell_latches_shutdown() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    board.force_cell(2, 4.40);

    assert!(eventually(|| !board.adc_awake()).await, "never shut down");
    assert!(is_shut_down(&tx).await);
    assert!(!board.charger_on());
    assert_eq!(board.active_drains(), 0);
    assert!(board.beeps() >= 1);
}

#[tokio::test(start_paused = true)]
async fn an_undervoltage_cell_latches_shutdown() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    board.force_cell(2, 3.0);

    assert!(eventually(|| !board.adc_awake()).await, "never shut down");
    assert!(is_shut_down(&tx).await);
}

#[tokio::test(start_paused = true)]
async fn a_measurement_fault_latches_and_reports_after_reboot() {
    let config = test_config();
    let (board, tx, controller) = start(&config);

    set_mode(&tx, Mode::Balance).await;
    // A cell reading that jumps 0.1 V between sweeps never passes the
    // glitch check while balancing.
    board.force_cell(5, 3.95);

    assert!(
        eventually(|| board.fault_flag()).await,
        "fault never latched"
    );
    assert!(is_shut_down(&tx).await);

    // Power-cycle: a fresh controller on the same board reports the
    // latched flag and clears it.
    controller.abort();
    board.release_cell(5);
    let (tx, rx) = mpsc::channel(16);
    let rebooted = Controller::new(&config, board.peripherals(), rx);
    let _rebooted = tokio::spawn(rebooted.run());

    assert!(
        eventually(|| !board.fault_flag()).await,
        "flag never cleared"
    );
    assert!(!is_shut_down(&tx).await);
}

#[tokio::test(start_paused = true)]
async fn a_single_glitched_sweep_is_remeasured_without_a_fault() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    set_mode(&tx, Mode::Balance).await;
    // One corrupt reading, 0.1 V off the model, on the next sweep only.
    board.glitch_cell(5, 3.95);

    let cells = match send(&tx, Command::Query(Query::CellVoltages)).await {
        Reply::Data(bytes) => decode_series(&bytes).expect("parseable cell series"),
        Reply::Ack => panic!("expected cell data"),
    };
    assert!(
        (cells[5] - 3.95).abs() > 0.05,
        "corrupt sweep was published: {}",
        cells[5]
    );
    assert!(!board.fault_flag(), "one bad sweep latched a fault");
    assert!(!is_shut_down(&tx).await);
}

#[tokio::test(start_paused = true)]
async fn a_noisy_spell_in_idle_leaves_no_fault_behind() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    // Amplitude well past the 0.05 V sweep-to-sweep tolerance, still inside
    // the voltage limits.
    board.set_noise(0.2);
    sleep(Duration::from_secs(60)).await;
    assert!(!board.fault_flag(), "noise faulted the pack at rest");
    assert!(!is_shut_down(&tx).await);

    // Once the readings clean up, a charge/balance cycle starts normally.
    board.set_noise(0.0);
    set_mode(&tx, Mode::Balance).await;
    assert!(
        eventually(|| board.active_drains() > 0).await,
        "balancing never started"
    );
    assert!(!board.fault_flag());
    assert!(!is_shut_down(&tx).await);
}

#[tokio::test(start_paused = true)]
async fn runaway_heat_shuts_down_with_the_fan_running() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    board.force_temperature(105.0);

    assert!(eventually(|| !board.adc_awake()).await, "never shut down");
    assert!(is_shut_down(&tx).await);
    assert!(board.fan_on());
    assert!(board.beeps() >= 1);
}

#[tokio::test(start_paused = true)]
async fn the_fan_follows_its_trigger_temperature() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    board.force_temperature(60.0);
    assert!(eventually(|| board.fan_on()).await, "fan never started");
    assert!(!is_shut_down(&tx).await);

    board.release_temperature();
    assert!(eventually(|| !board.fan_on()).await, "fan never stopped");
}

#[tokio::test(start_paused = true)]
async fn commanded_shutdown_sleeps_the_adc_and_a_mode_command_wakes_it() {
    let config = test_config();
    let (board, tx, _controller) = start(&config);

    set_mode(&tx, Mode::Shutdown).await;
    assert!(eventually(|| !board.adc_awake()).await, "ADC never slept");
    assert!(is_shut_down(&tx).await);

    set_mode(&tx, Mode::Idle).await;
    assert!(board.adc_awake());
    assert!(!is_shut_down(&tx).await);
}
