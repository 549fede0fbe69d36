//! End-to-end wash sessions against the protocol simulator

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast::Receiver;
use tokio::time::{sleep, timeout, Instant};
use washlink_core::prelude::*;
use washlink_core::wash::SessionFault;

struct Bench {
    manager: WashManager,
    simulator: SimulatorHandle,
    updates: Receiver<StatusUpdate>,
}

async fn bench(profile: DeviceProfile, simulator: SimulatorConfig) -> Bench {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let manager = WashManager::new(DriverConfig::new("bay-1", "", profile)).unwrap();
    let mut updates = manager.subscribe();
    let (stream, simulator) = Simulator::spawn(simulator);
    manager.connect_with_stream(stream).await.unwrap();
    assert_eq!(updates.recv().await.unwrap().kind, UpdateKind::Connected);

    Bench {
        manager,
        simulator,
        updates,
    }
}

async fn fl30_bench() -> Bench {
    bench(DeviceProfile::fl30(), SimulatorConfig::fl30()).await
}

/// Wait for the next update of `kind`, failing after two simulated minutes
async fn next_of(updates: &mut Receiver<StatusUpdate>, kind: UpdateKind) -> StatusUpdate {
    timeout(Duration::from_secs(120), async {
        loop {
            let update = updates.recv().await.unwrap();
            if update.kind == kind {
                return update;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} update", kind))
}

/// Collect updates until the session returns to idle
async fn run_to_idle(updates: &mut Receiver<StatusUpdate>) -> Vec<StatusUpdate> {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(600), async {
        loop {
            let update = updates.recv().await.unwrap();
            let done = update.kind == UpdateKind::StateChanged && update.status.state == SessionState::Idle;
            seen.push(update);
            if done {
                return;
            }
        }
    })
    .await
    .expect("session did not return to idle");
    seen
}

#[tokio::test(start_paused = true)]
async fn test_mode1_runs_one_full_pass() {
    let mut bench = fl30_bench().await;

    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    let started = Instant::now();
    let updates = run_to_idle(&mut bench.updates).await;
    let elapsed = started.elapsed();

    let states: Vec<SessionState> = updates
        .iter()
        .filter(|u| u.kind == UpdateKind::StateChanged)
        .map(|u| u.status.state)
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Starting,
            SessionState::Washing,
            SessionState::Completed,
            SessionState::Idle
        ]
    );

    let steps: Vec<(u16, bool)> = updates
        .iter()
        .filter(|u| u.kind == UpdateKind::StepChanged)
        .map(|u| (u.status.current_step.step_code.raw(), u.status.current_step.is_washing))
        .collect();
    assert_eq!(
        steps,
        vec![
            (10, true),
            (2, true),
            (3, true),
            (6, true),
            (7, true),
            (4, true),
            (5, true),
            (1, false)
        ]
    );

    // Step 1 appears 35 s in; completion follows within one poll interval
    assert!(elapsed >= Duration::from_secs(35), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_secs(36), "{:?}", elapsed);

    let status = bench.manager.status().await;
    assert!(status.connected);
    assert_eq!(status.status.state, SessionState::Idle);
    assert!(status.status.error.is_none());
    assert!(status.last_status_received_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_status_follows_simulator_steps() {
    let bench = fl30_bench().await;
    bench.manager.start_wash(WashMode::Mode2).await.unwrap();

    sleep(Duration::from_millis(12_500)).await;
    let status = bench.manager.status().await;
    assert_eq!(status.status.state, SessionState::Washing);
    assert_eq!(status.status.mode, Some(WashMode::Mode2));
    assert_eq!(
        status.status.current_step.step_code,
        StepCode::from_raw(bench.simulator.step())
    );
    assert_eq!(status.status.current_step.step_code, StepCode::Foam);
    // Mode2 is estimated at 12 minutes
    assert_eq!(status.status.remaining_time, 707);
    assert_eq!(status.status.progress, 2);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["status"]["currentStep"]["stepCode"], 3);
    assert_eq!(json["machineInfo"]["machineId"], "bay-1");
}

#[tokio::test(start_paused = true)]
async fn test_start_while_starting_is_busy_without_writing() {
    let bench = fl30_bench().await;
    bench.simulator.set_muted(true);

    let manager = bench.manager.clone();
    let first = tokio::spawn(async move { manager.start_wash(WashMode::Mode1).await });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bench.manager.session_state().await, SessionState::Starting);

    let writes = bench.simulator.writes_received();
    assert!(matches!(
        bench.manager.start_wash(WashMode::Mode2).await,
        Err(WashError::SessionBusy)
    ));
    assert_eq!(bench.simulator.writes_received(), writes);

    // Stopping cancels the pending start
    bench.manager.stop_wash().await.unwrap();
    assert!(matches!(first.await.unwrap(), Err(WashError::Cancelled)));
    assert_eq!(bench.manager.session_state().await, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_washing_is_busy_without_writing() {
    let bench = fl30_bench().await;
    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    sleep(Duration::from_secs(3)).await;

    let writes = bench.simulator.writes_received();
    assert!(matches!(
        bench.manager.start_wash(WashMode::Mode1).await,
        Err(WashError::SessionBusy)
    ));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bench.simulator.writes_received(), writes);
    assert_eq!(bench.manager.session_state().await, SessionState::Washing);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_start_times_out_to_idle() {
    let mut profile = DeviceProfile::fl30();
    profile.timing.max_attempts = 3;
    let mut bench = bench(profile, SimulatorConfig::fl30()).await;
    bench.simulator.set_muted(true);

    let result = bench.manager.start_wash(WashMode::Mode1).await;
    assert!(matches!(result, Err(WashError::CommandTimeout { attempts: 3 })));
    assert_eq!(bench.simulator.writes_received(), 3);

    let status = bench.manager.status().await;
    assert_eq!(status.status.state, SessionState::Idle);
    assert!(status.status.error.is_none());

    let updates = run_to_idle(&mut bench.updates).await;
    assert_eq!(updates.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_wash_returns_to_idle() {
    let bench = fl30_bench().await;
    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    sleep(Duration::from_secs(7)).await;
    assert!(bench.simulator.is_running());

    bench.manager.stop_wash().await.unwrap();
    assert_eq!(bench.manager.session_state().await, SessionState::Idle);
    sleep(Duration::from_millis(100)).await;
    assert!(!bench.simulator.is_running());
    assert_eq!(bench.simulator.step(), 0);

    // A new session can start right away
    bench.manager.start_wash(WashMode::Mode2).await.unwrap();
    assert_eq!(bench.manager.session_state().await, SessionState::Washing);
}

#[tokio::test(start_paused = true)]
async fn test_missed_end_step_completes_on_idle_step() {
    let mut simulator = SimulatorConfig::fl30();
    simulator.programs.insert(0x012F, vec![10, 2, 3]);
    let mut bench = bench(DeviceProfile::fl30(), simulator).await;

    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    let updates = run_to_idle(&mut bench.updates).await;

    assert!(updates
        .iter()
        .any(|u| u.kind == UpdateKind::StateChanged && u.status.state == SessionState::Completed));
    let last_step = updates
        .iter()
        .filter(|u| u.kind == UpdateKind::StepChanged)
        .last()
        .unwrap();
    assert_eq!(last_step.status.current_step.step_code, StepCode::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_hard_timeout_forces_completion() {
    let mut profile = DeviceProfile::fl30();
    profile.timing.wash_timeout_secs = 60;
    let simulator = SimulatorConfig::fl30().with_step_interval(Duration::from_secs(600));
    let mut bench = bench(profile, simulator).await;

    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    let started = Instant::now();
    let updates = run_to_idle(&mut bench.updates).await;

    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(updates
        .iter()
        .any(|u| u.kind == UpdateKind::StateChanged && u.status.state == SessionState::Completed));
    assert!(bench.manager.status().await.status.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_flags_silence_and_recovers() {
    let simulator = SimulatorConfig::fl30().with_step_interval(Duration::from_secs(600));
    let mut bench = bench(DeviceProfile::fl30(), simulator).await;

    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    sleep(Duration::from_millis(2500)).await;
    bench.simulator.set_muted(true);
    let muted_at = Instant::now();

    let unhealthy = next_of(&mut bench.updates, UpdateKind::HealthChanged).await;
    assert!(!unhealthy.status.connection_healthy);
    let silence = muted_at.elapsed();
    assert!(silence >= Duration::from_secs(27), "{:?}", silence);
    assert!(silence <= Duration::from_secs(40), "{:?}", silence);
    assert!(!bench.manager.status().await.status.connection_healthy);
    // Still washing; the warning is soft
    assert_eq!(bench.manager.session_state().await, SessionState::Washing);

    bench.simulator.set_muted(false);
    let recovered = next_of(&mut bench.updates, UpdateKind::HealthChanged).await;
    assert!(recovered.status.connection_healthy);
    assert!(bench.manager.status().await.status.connection_healthy);
}

#[tokio::test(start_paused = true)]
async fn test_hardware_error_latches_until_reset() {
    let simulator = SimulatorConfig::fl30().with_step_interval(Duration::from_secs(600));
    let mut bench = bench(DeviceProfile::fl30(), simulator).await;

    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    bench.simulator.set_error_flag(true);

    let fault = next_of(&mut bench.updates, UpdateKind::Fault).await;
    assert_eq!(fault.status.error, Some(SessionFault::Hardware));

    bench.manager.stop_wash().await.unwrap();
    let status = bench.manager.status().await;
    assert_eq!(status.status.state, SessionState::Idle);
    assert_eq!(status.status.error, Some(SessionFault::Hardware));
    assert!(matches!(
        bench.manager.start_wash(WashMode::Mode1).await,
        Err(WashError::DeviceFault(SessionFault::Hardware))
    ));

    bench.manager.reset().await.unwrap();
    let cleared = next_of(&mut bench.updates, UpdateKind::FaultCleared).await;
    assert!(cleared.status.error.is_none());
    sleep(Duration::from_millis(100)).await;
    assert!(!bench.simulator.coil(0x0012));

    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sg90_mode3_completes() {
    let profile = DeviceProfile::sg90();
    let simulator = SimulatorConfig::for_profile(&profile);
    let mut bench = bench(profile, simulator).await;

    bench.manager.start_wash(WashMode::Mode3).await.unwrap();
    assert!(bench.simulator.coil(0x08D6));
    run_to_idle(&mut bench.updates).await;
    assert_eq!(bench.manager.session_state().await, SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_session() {
    let mut bench = fl30_bench().await;
    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    bench.manager.disconnect().await.unwrap();
    let update = next_of(&mut bench.updates, UpdateKind::Disconnected).await;
    assert_eq!(update.status.state, SessionState::Idle);

    let status = bench.manager.status().await;
    assert!(!status.connected);
    assert!(matches!(
        bench.manager.start_wash(WashMode::Mode1).await,
        Err(WashError::NotConnected)
    ));
}

/// Mute the device and leave a start retrying in the background
async fn pending_start(bench: &Bench) -> tokio::task::JoinHandle<Result<(), WashError>> {
    bench.simulator.set_muted(true);
    let manager = bench.manager.clone();
    let first = tokio::spawn(async move { manager.start_wash(WashMode::Mode1).await });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bench.manager.session_state().await, SessionState::Starting);
    bench.simulator.set_muted(false);
    first
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_start_allows_immediate_restart() {
    let bench = fl30_bench().await;
    let first = pending_start(&bench).await;

    bench.manager.stop_wash().await.unwrap();
    bench.manager.start_wash(WashMode::Mode2).await.unwrap();
    assert_eq!(bench.manager.session_state().await, SessionState::Washing);
    assert_eq!(bench.manager.status().await.status.mode, Some(WashMode::Mode2));
    assert!(matches!(first.await.unwrap(), Err(WashError::Cancelled)));

    sleep(Duration::from_millis(100)).await;
    assert!(bench.simulator.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_reset_during_start_allows_immediate_restart() {
    let bench = fl30_bench().await;
    let first = pending_start(&bench).await;

    bench.manager.reset().await.unwrap();
    bench.manager.start_wash(WashMode::Mode2).await.unwrap();
    assert_eq!(bench.manager.session_state().await, SessionState::Washing);
    assert!(matches!(first.await.unwrap(), Err(WashError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_sg90_pause_holds_cycle_until_resumed() {
    let profile = DeviceProfile::sg90();
    let simulator = SimulatorConfig::for_profile(&profile);
    let mut bench = bench(profile, simulator).await;

    bench.manager.start_wash(WashMode::Mode3).await.unwrap();
    sleep(Duration::from_secs(7)).await;

    bench.manager.pause().await.unwrap();
    let paused = next_of(&mut bench.updates, UpdateKind::Paused).await;
    assert!(paused.status.paused);
    sleep(Duration::from_millis(100)).await;
    assert!(bench.simulator.is_paused());
    assert!(bench.simulator.coil(0x0847));

    let held = bench.manager.status().await.status;
    let step = bench.simulator.step();
    sleep(Duration::from_secs(60)).await;
    let still = bench.manager.status().await.status;
    assert_eq!(bench.simulator.step(), step);
    assert_eq!(still.state, SessionState::Washing);
    assert_eq!(still.remaining_time, held.remaining_time);

    // Pausing twice changes nothing
    bench.manager.pause().await.unwrap();

    bench.manager.resume().await.unwrap();
    let resumed = next_of(&mut bench.updates, UpdateKind::Resumed).await;
    assert!(!resumed.status.paused);
    run_to_idle(&mut bench.updates).await;
    // The controller counts the wash once its last step runs out
    sleep(Duration::from_secs(6)).await;

    let counters = bench.manager.read_counters().await.unwrap();
    assert_eq!(counters, WashCounters { total: Some(1), daily: Some(1) });
}

#[tokio::test(start_paused = true)]
async fn test_pause_needs_a_washing_session() {
    let profile = DeviceProfile::sg90();
    let simulator = SimulatorConfig::for_profile(&profile);
    let bench = bench(profile, simulator).await;
    assert!(matches!(bench.manager.pause().await, Err(WashError::NotWashing)));
    assert!(matches!(bench.manager.resume().await, Err(WashError::NotWashing)));

    let fl30 = fl30_bench().await;
    fl30.manager.start_wash(WashMode::Mode1).await.unwrap();
    assert!(matches!(
        fl30.manager.pause().await,
        Err(WashError::UnsupportedCommand(_))
    ));
    let response = washlink_core::api::pause_wash(&fl30.manager).await;
    assert!(!response.success);
}

#[tokio::test(start_paused = true)]
async fn test_fl30_readiness_reads_homed_gantry() {
    let bench = fl30_bench().await;

    let readiness = bench.manager.read_readiness().await.unwrap();
    assert!(readiness.ready);
    assert_eq!(readiness.origin, Some(true));
    assert_eq!(readiness.at_origin, Some(true));
    assert_eq!(readiness.running, Some(false));
    assert_eq!(readiness.error, Some(false));
    assert_eq!(readiness.car_stopped, Some(false));
    assert_eq!(readiness.car_present, None);
    assert_eq!(readiness.car_in_position(), Some(false));

    bench.simulator.set_coil(0x0011, true);
    let readiness = bench.manager.read_readiness().await.unwrap();
    assert_eq!(readiness.car_in_position(), Some(true));

    bench.manager.start_wash(WashMode::Mode1).await.unwrap();
    assert!(matches!(
        bench.manager.read_readiness().await,
        Err(WashError::SessionBusy)
    ));
    assert!(washlink_core::api::get_readiness(&bench.manager).await.is_err());

    bench.manager.stop_wash().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(bench.manager.read_readiness().await.unwrap().ready);
}

#[tokio::test(start_paused = true)]
async fn test_counters_need_counter_registers() {
    let bench = fl30_bench().await;
    assert!(matches!(
        bench.manager.read_counters().await,
        Err(WashError::UnsupportedCommand(_))
    ));
    let message = washlink_core::api::get_wash_counts(&bench.manager)
        .await
        .unwrap_err();
    assert_eq!(message, "Wash counters is not supported by this controller");
}
