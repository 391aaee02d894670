//! Hardware-dependent tests that need real evdev nodes
//!
//! These tests are ignored by default and can be run with:
//! `cargo test -- --ignored`
//!
//! They require:
//! - At least one keyboard (or IR remote) under /dev/input
//! - Read permission on /dev/input/event* (root or the `input` group)

use inputhub::device::{DeviceRegistry, InputBackend, MAX_INPUT_DEVICES};
use inputhub::evdev_backend::EvdevBackend;
use inputhub::{InputSettings, InputSubsystem, NoGpio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Test keyboard detection on the real input nodes
#[test]
#[ignore]
fn test_real_keyboard_scan() {
    let backend = EvdevBackend::new();
    assert!(
        backend.is_accessible(0),
        "/dev/input/event0 is not readable; run as root or join the input group"
    );

    let mut registry = DeviceRegistry::new(backend);
    let registered = registry.scan();
    println!("Registered {} keyboard(s)", registered);
    for (index, slot) in registry.slots().iter().enumerate() {
        if let Some(device) = slot.device() {
            println!("  event{}: '{}' {:?}", index, device.name, device.id);
        }
    }
    assert!(registered > 0, "No keyboard found in event0..event{}", MAX_INPUT_DEVICES - 1);

    // Nothing changed, so nothing is evicted.
    assert_eq!(registry.revalidate(), 0);
    registry.close_all();
    assert_eq!(registry.registered_count(), 0);
}

/// Test the full subsystem against real devices
#[test]
#[ignore]
fn test_real_subsystem_reports_devices() {
    let mut input = InputSubsystem::start(
        EvdevBackend::new(),
        Arc::new(NoGpio),
        InputSettings::default(),
        None,
    )
    .expect("Failed to start input subsystem");

    thread::sleep(Duration::from_secs(3));
    let notices = input.device_notices();
    println!("Device notices: {:?}", notices);
    assert!(!notices.is_empty(), "No devices registered after the first scan");

    input.shutdown();
}
