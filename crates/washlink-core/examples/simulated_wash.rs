//! Simulated Wash Demo
//!
//! Runs one complete wash against the built-in protocol simulator and prints
//! every status update.
//!
//! Usage:
//!   cargo run --example simulated_wash -- [MODE] [REVISION]
//!
//!   MODE        MODE1..MODE4 (default: MODE1)
//!   REVISION    FL30 or SG90 (default: FL30)
//!
//! Set RUST_LOG=washlink_core=debug to see frame-level logging.

use std::time::Duration;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;
use washlink_core::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mode: WashMode = serde_json::from_value(serde_json::Value::String(
        args.get(1).cloned().unwrap_or_else(|| "MODE1".to_string()),
    ))
    .context("MODE must be one of MODE1..MODE4")?;

    let profile = match args.get(2).map(String::as_str) {
        None | Some("FL30") => DeviceProfile::fl30(),
        Some("SG90") => DeviceProfile::sg90(),
        Some(other) => bail!("Unknown revision {}", other),
    };

    // Speed the demo up: one second per step, half-second polling
    let mut profile = profile;
    profile.timing.poll_interval_ms = 500;
    let sim_config = SimulatorConfig::for_profile(&profile).with_step_interval(Duration::from_secs(1));
    let (stream, simulator) = Simulator::spawn(sim_config);

    let manager = WashManager::new(DriverConfig::new("demo-bay", "", profile))?;
    let mut updates = manager.subscribe();
    manager.connect_with_stream(stream).await?;

    manager
        .start_wash(mode)
        .await
        .with_context(|| format!("Failed to start {}", mode))?;

    loop {
        let update = updates.recv().await?;
        println!(
            "[{}] {:?}: {:?} step={} remaining={}s progress={}%",
            update.timestamp.format("%H:%M:%S"),
            update.kind,
            update.status.state,
            update.status.current_step.description,
            update.status.remaining_time,
            update.status.progress,
        );
        if update.kind == UpdateKind::StateChanged && update.status.state == SessionState::Idle {
            break;
        }
    }

    println!("\nSimulator answered {} of {} frames", simulator.answered(), simulator.received());
    println!("{}", serde_json::to_string_pretty(&manager.status().await)?);
    manager.disconnect().await?;
    Ok(())
}
