//! Integration tests for inputhub
//!
//! These tests drive the public API against the in-memory backend.
//! Tests that require hardware live in `hardware_tests.rs`.

use inputhub::device::DeviceRegistry;
use inputhub::keymap::KeyTable;
use inputhub::poller::{PollCycle, SCAN_SETTLE_DELAY};
use inputhub::queue::EventQueue;
use inputhub::rotary::{
    ROTARY_CANCEL, ROTARY_SELECT, RotaryBridge, RotarySnapshot, SNAPSHOT_LEN, SnapshotSource,
};
use inputhub::settings::RotaryFunction;
use inputhub::virtual_device::{VirtualBackend, VirtualDeviceSpec};
use inputhub::{
    Button, Buttons, DeviceNotice, GpioKeys, HardwareId, InputSettings, InputSubsystem,
    KeyOverride, LatchedKeys, LogicalEvent, NoGpio, RotaryReport, TriggeredEvents,
};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const KEYBOARD: HardwareId = HardwareId::new(3, 0x046d, 0xc31c, 0x0110);
const REMOTE: HardwareId = HardwareId::new(3, 1, 2, 1);

/// First tick at which the initial scan runs
const SCAN_DUE: Duration = SCAN_SETTLE_DELAY.saturating_add(Duration::from_millis(1));

fn remote_spec() -> VirtualDeviceSpec {
    VirtualDeviceSpec::new("Remote A", REMOTE, vec![32, 97, 28, 103, 108])
}

struct Harness {
    backend: VirtualBackend,
    cycle: PollCycle<VirtualBackend>,
    queue: Arc<EventQueue>,
    notices: Receiver<DeviceNotice>,
    start: Instant,
}

impl Harness {
    fn new() -> Self {
        let backend = VirtualBackend::new();
        let (sender, notices) = mpsc::channel();
        let queue = Arc::new(EventQueue::new());
        let start = Instant::now();
        let cycle = PollCycle::new(
            DeviceRegistry::new(backend.clone()).with_notices(sender),
            KeyTable::default(),
            queue.clone(),
            Arc::new(NoGpio),
            Arc::new(AtomicBool::new(false)),
            start,
        );
        Self {
            backend,
            cycle,
            queue,
            notices,
            start,
        }
    }

    fn tick_at(&mut self, after: Duration) {
        self.cycle.tick(self.start + after);
    }

    fn notices(&self) -> Vec<DeviceNotice> {
        self.notices.try_iter().collect()
    }
}

#[test]
fn test_device_registers_at_its_node_index() {
    let mut h = Harness::new();
    h.backend.plug(0, VirtualDeviceSpec::keyboard("Keyboard", KEYBOARD));
    h.backend.plug(3, remote_spec());

    h.tick_at(Duration::from_millis(100));
    assert_eq!(h.cycle.registry.registered_count(), 0, "scan waits for settle delay");

    h.tick_at(SCAN_DUE);
    let remote = h.cycle.registry.device(3).unwrap();
    assert_eq!(remote.name, "Remote A");
    assert_eq!(remote.id, REMOTE);
    assert_eq!(
        h.notices(),
        vec![
            DeviceNotice::Added { slot: 0, name: "Keyboard".into() },
            DeviceNotice::Added { slot: 3, name: "Remote A".into() },
        ]
    );
}

#[test]
fn test_key_presses_fold_into_triggered_set() {
    let mut h = Harness::new();
    h.backend.plug(0, remote_spec());
    h.tick_at(SCAN_DUE);

    h.backend.push_key(0, 28, 1);
    h.backend.push_key(0, 28, 0);
    h.backend.push_key(0, 69, 1);
    h.backend.push_key(0, 103, 1);
    h.backend.push_key(0, 103, 2);
    h.backend.push_key(0, 30, 1);
    h.tick_at(SCAN_DUE + Duration::from_millis(15));

    assert_eq!(h.queue.len(), 3);
    let mut triggered = TriggeredEvents::new();
    assert_eq!(triggered.consume_from(&h.queue), 3);
    assert_eq!(triggered.buttons(), Buttons::MENU | Buttons::PLUS);
    assert_eq!(triggered.last_unknown_key(), Some(30));
    assert_eq!(triggered.bits(), 0x01 | 0x04 | (30 << 16));
}

#[test]
fn test_same_hardware_on_two_nodes_registers_once() {
    let mut h = Harness::new();
    h.backend.plug(0, VirtualDeviceSpec::keyboard("Keyboard", KEYBOARD));
    h.backend.plug(4, remote_spec());
    h.backend.plug(6, remote_spec());

    h.tick_at(SCAN_DUE);
    assert!(h.cycle.registry.device(4).is_some());
    assert!(h.cycle.registry.device(6).is_none());
    assert_eq!(h.cycle.registry.registered_count(), 2);
}

#[test]
fn test_unplug_is_noticed_at_next_scan() {
    let mut h = Harness::new();
    h.backend.plug(0, VirtualDeviceSpec::keyboard("Keyboard", KEYBOARD));
    h.backend.plug(2, remote_spec());
    h.tick_at(SCAN_DUE);
    h.notices();

    h.backend.unplug(2);
    h.tick_at(SCAN_DUE * 2);
    assert!(h.cycle.registry.device(2).is_none());
    assert_eq!(
        h.notices(),
        vec![DeviceNotice::Removed { slot: 2, name: "Remote A".into() }]
    );
}

#[test]
fn test_queue_overflow_keeps_newest() {
    let mut h = Harness::new();
    h.backend.plug(0, remote_spec());
    h.tick_at(SCAN_DUE);

    for _ in 0..40 {
        h.backend.push_key(0, 28, 1);
    }
    for _ in 0..40 {
        h.backend.push_key(0, 108, 1);
    }
    h.tick_at(SCAN_DUE + Duration::from_millis(15));
    h.tick_at(SCAN_DUE + Duration::from_millis(30));

    assert_eq!(h.queue.len(), 63);
    let mut last = None;
    while let Some(event) = h.queue.dequeue() {
        last = Some(event);
    }
    assert_eq!(last, Some(LogicalEvent::Press(Button::Minus)));
}

/// GPIO source whose overrides stick until the test clears them
#[derive(Default)]
struct StickyKeys {
    pressed: AtomicU16,
}

impl GpioKeys for StickyKeys {
    fn is_pressed(&self, button: Button) -> bool {
        self.pressed.load(Ordering::SeqCst) & button.flag().bits() != 0
    }

    fn is_long_pressed(&self, _button: Button) -> bool {
        false
    }

    fn is_long_long_pressed(&self, _button: Button) -> bool {
        false
    }

    fn override_keys(&self, keys: KeyOverride) {
        self.pressed.fetch_or(keys.pressed().bits(), Ordering::SeqCst);
    }
}

fn publish(path: &Path, snapshot: &RotarySnapshot) {
    let mut file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.write_all(&snapshot.to_bytes()).unwrap();
    file.flush().unwrap();
}

fn rotary_event(index: u32, primary: u8) -> RotarySnapshot {
    RotarySnapshot {
        event_index: index,
        timestamp: index * 16,
        has_primary: true,
        primary_events: primary,
        ..RotarySnapshot::default()
    }
}

fn wait_for<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(value) = check() {
            return Some(value);
        }
        thread::sleep(Duration::from_millis(10));
    }
    None
}

#[test]
fn test_subsystem_delivers_evdev_presses() {
    let backend = VirtualBackend::new();
    backend.plug(0, remote_spec());
    let mut input = InputSubsystem::start(
        backend.clone(),
        Arc::new(NoGpio),
        InputSettings::default(),
        None,
    )
    .unwrap();

    let added = wait_for(Duration::from_secs(5), || {
        input.device_notices().into_iter().next()
    });
    assert_eq!(added, Some(DeviceNotice::Added { slot: 0, name: "Remote A".into() }));

    backend.push_key(0, 108, 1);
    let event = wait_for(Duration::from_secs(1), || input.poll_next_queued_event());
    assert_eq!(event, Some(LogicalEvent::Press(Button::Minus)));

    input.shutdown();
    assert!(!input.is_running());
    input.shutdown();
}

#[test]
fn test_rotary_navigation_reaches_triggered_set() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("rotary_encoder_events");
    fs::write(&region, rotary_event(1, ROTARY_SELECT).to_bytes()).unwrap();

    let settings = InputSettings {
        rotary_region: region.clone(),
        ..InputSettings::default()
    };
    let mut input = InputSubsystem::start(
        VirtualBackend::new(),
        Arc::new(StickyKeys::default()),
        settings,
        None,
    )
    .unwrap();

    input.consume_queued_events();
    let report = input.poll_rotary_bridge();
    assert!(report.navigation.select);
    assert_ne!(input.triggered_bitmask() & u32::from(Buttons::MENU.bits()), 0);

    // Nothing new published.
    assert_eq!(input.poll_rotary_bridge(), RotaryReport::default());
}

/// Writer that has a new select press ready on every read
#[derive(Default)]
struct SelectEveryRead {
    index: AtomicU32,
}

impl SnapshotSource for SelectEveryRead {
    fn copy_raw(&self) -> [u8; SNAPSHOT_LEN] {
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        rotary_event(index, ROTARY_SELECT).to_bytes()
    }
}

#[test]
fn test_rotary_select_survives_concurrent_gpio_refresh() {
    let gpio = Arc::new(LatchedKeys::new());
    let mut input = InputSubsystem::start(
        VirtualBackend::new(),
        gpio,
        InputSettings::default(),
        None,
    )
    .unwrap()
    .with_rotary_bridge(RotaryBridge::from_source(SelectEveryRead::default()));

    // Keep polling across many poll-thread ticks, each of which clears the
    // latched overrides.
    let deadline = Instant::now() + Duration::from_millis(300);
    let mut polls = 0;
    while Instant::now() < deadline {
        input.consume_queued_events();
        let report = input.poll_rotary_bridge();
        assert!(report.navigation.select);
        assert!(input.triggered().contains(Button::Menu), "lost after {} polls", polls);
        polls += 1;
    }
    assert!(polls > 0);
}

#[test]
fn test_long_rotary_cancel_restores_menu_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let region = dir.path().join("rotary_encoder_events");
    let settings_path = dir.path().join("input.toml");
    fs::write(&region, [0u8; 20]).unwrap();

    let mut settings = InputSettings {
        rotary_region: region.clone(),
        ..InputSettings::default()
    };
    settings.rotary.function = RotaryFunction::Camera;
    let mut input = InputSubsystem::start(
        VirtualBackend::new(),
        Arc::new(StickyKeys::default()),
        settings,
        Some(settings_path.clone()),
    )
    .unwrap();

    for i in 1..8 {
        publish(&region, &rotary_event(i, ROTARY_CANCEL));
        let report = input.poll_rotary_bridge();
        assert!(!report.primary.cancel, "camera function hides the encoder");
    }
    assert!(!settings_path.exists());

    publish(&region, &rotary_event(8, ROTARY_CANCEL));
    let report = input.poll_rotary_bridge();
    assert!(report.restore_navigation);
    assert!(report.navigation.cancel);
    assert_eq!(input.settings().rotary.function, RotaryFunction::Menu);
    assert!(input.triggered().contains(Button::Back));

    let saved = InputSettings::load_from(&settings_path).unwrap();
    assert_eq!(saved.rotary.function, RotaryFunction::Menu);
}

#[test]
fn test_injected_bits_survive_until_next_consume() {
    let mut input = InputSubsystem::start(
        VirtualBackend::new(),
        Arc::new(NoGpio),
        InputSettings::default(),
        None,
    )
    .unwrap();

    assert_eq!(input.inject_triggered(0x0100_0002), 0x0100_0002);
    assert_eq!(input.add_triggered_gpio_events(), 0x0100_0002);
    assert_eq!(input.consume_queued_events(), 0);
    assert_eq!(input.triggered_bitmask(), 0);
    assert!(!input.is_extended_long_press_active());
}
