//! inputhub - unified button input
//!
//! Merges evdev keyboards and remotes, GPIO push buttons and I2C rotary
//! encoders (published through shared memory) into one bounded stream of
//! button presses for a UI loop.

pub mod accumulator;
pub mod device;
pub mod evdev_backend;
pub mod event;
pub mod gpio;
pub mod keymap;
pub mod poller;
pub mod queue;
pub mod reader;
pub mod rotary;
pub mod settings;
pub mod virtual_device;

pub use accumulator::TriggeredEvents;
pub use device::{DeviceNotice, DeviceRegistry, HardwareId, InputBackend, InputNode};
pub use event::{Button, Buttons, LogicalEvent};
pub use gpio::{GpioKeys, KeyOverride, LatchedKeys, NoGpio};
pub use rotary::{RotaryBridge, RotaryReport};
pub use settings::InputSettings;

use keymap::KeyTable;
use poller::{InputPoller, PollCycle};
use queue::EventQueue;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::time::Instant;
use tracing::{info, warn};

/// The running input subsystem.
///
/// Owns the poll thread and everything the UI thread touches. Dropping it
/// stops the thread and closes every device.
pub struct InputSubsystem {
    queue: Arc<EventQueue>,
    long_press: Arc<AtomicBool>,
    gpio: Arc<dyn GpioKeys>,
    poller: Option<InputPoller>,
    triggered: TriggeredEvents,
    rotary: RotaryBridge,
    settings: InputSettings,
    settings_path: Option<PathBuf>,
    notices: Receiver<DeviceNotice>,
}

impl InputSubsystem {
    /// Start polling `backend` and `gpio`.
    ///
    /// `settings_path` is where a rotary function reset is persisted; with
    /// `None` the change only lives in memory.
    pub fn start<B>(
        backend: B,
        gpio: Arc<dyn GpioKeys>,
        settings: InputSettings,
        settings_path: Option<PathBuf>,
    ) -> io::Result<Self>
    where
        B: InputBackend + 'static,
    {
        let queue = Arc::new(EventQueue::new());
        let long_press = Arc::new(AtomicBool::new(false));
        let (sender, notices) = mpsc::channel();

        let registry = DeviceRegistry::new(backend).with_notices(sender);
        let cycle = PollCycle::new(
            registry,
            KeyTable::new(&settings.keymap),
            queue.clone(),
            gpio.clone(),
            long_press.clone(),
            Instant::now(),
        );
        let poller = InputPoller::start(cycle)?;
        info!("Input subsystem started");

        Ok(Self {
            queue,
            long_press,
            gpio,
            poller: Some(poller),
            triggered: TriggeredEvents::new(),
            rotary: RotaryBridge::new(settings.rotary_region.clone()),
            settings,
            settings_path,
            notices,
        })
    }

    /// Replace the rotary bridge (e.g. one over a non-file source)
    pub fn with_rotary_bridge(mut self, bridge: RotaryBridge) -> Self {
        self.rotary = bridge;
        self
    }

    pub fn settings(&self) -> &InputSettings {
        &self.settings
    }

    /// Take the oldest queued event without touching the triggered set
    pub fn poll_next_queued_event(&self) -> Option<LogicalEvent> {
        self.queue.dequeue()
    }

    /// Start a new UI tick: clear the triggered set and fold queued events
    /// into it. Returns how many events were consumed.
    pub fn consume_queued_events(&mut self) -> usize {
        self.triggered.consume_from(&self.queue)
    }

    pub fn triggered(&self) -> &TriggeredEvents {
        &self.triggered
    }

    /// Packed triggered set for this tick
    pub fn triggered_bitmask(&self) -> u32 {
        self.triggered.bits()
    }

    /// OR extra bits into this tick's triggered set
    pub fn inject_triggered(&mut self, bits: u32) -> u32 {
        self.triggered.inject(bits)
    }

    /// Sample GPIO now and add whatever is pressed to this tick
    pub fn add_triggered_gpio_events(&mut self) -> u32 {
        self.triggered.press(gpio::pressed_buttons(self.gpio.as_ref()));
        self.triggered.bits()
    }

    /// Whether menu, plus or minus was held past the long-long threshold at
    /// the last poll
    pub fn is_extended_long_press_active(&self) -> bool {
        self.long_press.load(Ordering::Acquire)
    }

    /// Poll the rotary encoders once.
    ///
    /// Menu navigation actions and extender buttons are added to this
    /// tick's triggered set and routed through the GPIO override. A long
    /// cancel on the primary encoder puts it back on menu navigation and
    /// persists that.
    pub fn poll_rotary_bridge(&mut self) -> RotaryReport {
        let Some(poll) = self.rotary.poll(self.gpio.as_ref()) else {
            return RotaryReport::default();
        };

        if poll.restore_navigation && self.settings.reset_primary_rotary() {
            self.persist_settings();
        }

        let report = RotaryReport::shape(&poll, &self.settings.rotary);
        let navigation = report.navigation.as_key_override();
        if !navigation.is_empty() {
            self.gpio.override_keys(navigation);
        }
        if !navigation.is_empty() || !poll.buttons.is_empty() {
            // The poll thread may refresh the GPIO source before the re-poll
            // below, so the decoded keys are folded in directly as well.
            self.triggered.press(navigation.pressed() | poll.buttons.pressed());
            self.add_triggered_gpio_events();
        }
        report
    }

    fn persist_settings(&self) {
        let Some(path) = &self.settings_path else {
            return;
        };
        if let Err(e) = self.settings.save_to(path) {
            warn!("Failed to persist rotary settings: {}", e);
        }
    }

    /// Drain pending device add/remove notices
    pub fn device_notices(&self) -> Vec<DeviceNotice> {
        self.notices.try_iter().collect()
    }

    pub fn is_running(&self) -> bool {
        self.poller.as_ref().is_some_and(InputPoller::is_running)
    }

    /// Stop the poll thread and close all devices. Safe to call twice.
    pub fn shutdown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
            info!("Input subsystem stopped");
        }
    }
}

impl Drop for InputSubsystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
