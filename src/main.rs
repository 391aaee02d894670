//! inputhub - button input daemon
//!
//! Runs the input subsystem against the real evdev nodes and the rotary
//! shared-memory region, and logs what a UI would receive each tick.
//!
//! Usage: `inputhub [settings.toml]`

use anyhow::{Context, Result};
use inputhub::evdev_backend::EvdevBackend;
use inputhub::{DeviceNotice, InputSettings, InputSubsystem, LatchedKeys, LogicalEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Simulated UI frame period
const UI_TICK: Duration = Duration::from_millis(50);

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("inputhub starting...");

    let settings_path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => InputSettings::settings_path()?,
    };
    let settings = InputSettings::load_from(&settings_path)
        .with_context(|| format!("Failed to load settings from {:?}", settings_path))?;

    let backend = EvdevBackend::with_prefix(settings.node_prefix.clone());
    let mut input = InputSubsystem::start(
        backend,
        Arc::new(LatchedKeys::new()),
        settings,
        Some(settings_path),
    )
    .context("Failed to start input subsystem")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        shutdown_flag.store(true, Ordering::SeqCst);
    }) {
        error!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut long_press = false;
    while !shutdown.load(Ordering::SeqCst) {
        for notice in input.device_notices() {
            match notice {
                DeviceNotice::Added { slot, name } => info!("Device {} connected: '{}'", slot, name),
                DeviceNotice::Removed { slot, name } => {
                    info!("Device {} disconnected: '{}'", slot, name)
                }
            }
        }

        input.consume_queued_events();
        let report = input.poll_rotary_bridge();
        if report.primary.any() || report.secondary.any() {
            debug!("Rotary: {:?}", report);
        }

        let triggered = input.triggered();
        if !triggered.is_empty() {
            let buttons = triggered.buttons().iter().map(|b| format!("{:?}", b));
            info!(
                "Triggered {:#010x}: [{}]{}",
                input.triggered_bitmask(),
                buttons.collect::<Vec<_>>().join(", "),
                triggered
                    .last_unknown_key()
                    .map(|code| format!(" {}", LogicalEvent::UnknownKey(code)))
                    .unwrap_or_default()
            );
        }

        let held = input.is_extended_long_press_active();
        if held != long_press {
            info!("Extended long press {}", if held { "active" } else { "released" });
            long_press = held;
        }

        thread::sleep(UI_TICK);
    }

    input.shutdown();
    info!("inputhub shutting down");
    Ok(())
}
