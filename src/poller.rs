//! Input poll thread
//!
//! One background thread owns GPIO polling, evdev hot-plug scanning and
//! evdev reading. Every step is non-blocking or bounded to well under a
//! millisecond, so the loop runs at a steady ~15 ms tick and notices a stop
//! request within one tick.

use crate::device::{DeviceRegistry, InputBackend};
use crate::event::{Button, LogicalEvent};
use crate::gpio::GpioKeys;
use crate::keymap::KeyTable;
use crate::queue::EventQueue;
use crate::reader::read_devices;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sleep between poll ticks
pub const POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Delay before the first scan and after a scan that found devices
pub const SCAN_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Backoff step per failed scan attempt
pub const SCAN_BACKOFF_STEP: Duration = Duration::from_secs(1);

/// Longest delay between scans
pub const SCAN_MAX_DELAY: Duration = Duration::from_secs(3);

/// Attempts after which the delay stays at [`SCAN_MAX_DELAY`]
pub const SCAN_BACKOFF_ATTEMPTS: u32 = 3;

/// Rescan delay after a device read failed
pub const SCAN_AFTER_READ_ERROR: Duration = Duration::from_millis(500);

/// When to look for new devices next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSchedule {
    next: Instant,
    attempts: u32,
}

impl ScanSchedule {
    pub fn new(now: Instant) -> Self {
        Self {
            next: now + SCAN_SETTLE_DELAY,
            attempts: 0,
        }
    }

    pub fn next_scan(&self) -> Instant {
        self.next
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a scan is due; when it is, the next slot is already booked
    /// with backoff applied.
    pub fn begin(&mut self, now: Instant) -> bool {
        if now <= self.next {
            return false;
        }
        self.attempts = self.attempts.saturating_add(1);
        self.next = if self.attempts < SCAN_BACKOFF_ATTEMPTS {
            now + SCAN_BACKOFF_STEP * self.attempts
        } else {
            now + SCAN_MAX_DELAY
        };
        true
    }

    /// Record the outcome of a scan started with [`ScanSchedule::begin`]
    pub fn finish(&mut self, now: Instant, registered: usize) {
        if registered > 0 {
            self.attempts = 0;
            self.next = now + SCAN_SETTLE_DELAY;
        }
    }

    /// A device read failed; look again soon regardless of backoff
    pub fn read_failed(&mut self, now: Instant) {
        self.next = now + SCAN_AFTER_READ_ERROR;
    }
}

/// State owned by the poll thread, advanced one tick at a time
pub struct PollCycle<B: InputBackend> {
    pub registry: DeviceRegistry<B>,
    pub schedule: ScanSchedule,
    table: KeyTable,
    queue: Arc<EventQueue>,
    gpio: Arc<dyn GpioKeys>,
    long_press: Arc<AtomicBool>,
}

impl<B: InputBackend> PollCycle<B> {
    pub fn new(
        registry: DeviceRegistry<B>,
        table: KeyTable,
        queue: Arc<EventQueue>,
        gpio: Arc<dyn GpioKeys>,
        long_press: Arc<AtomicBool>,
        now: Instant,
    ) -> Self {
        Self {
            registry,
            schedule: ScanSchedule::new(now),
            table,
            queue,
            gpio,
            long_press,
        }
    }

    /// Sample GPIO predicates and queue a press for each active key
    pub fn poll_gpio(&self) {
        let gpio = self.gpio.as_ref();
        gpio.refresh();

        for button in Button::ALL {
            if gpio.is_pressed(button) {
                self.queue.enqueue(LogicalEvent::Press(button));
            }
        }
        // Holding plus/minus keeps stepping.
        for button in [Button::Minus, Button::Plus] {
            if gpio.is_long_pressed(button) {
                self.queue.enqueue(LogicalEvent::Press(button));
            }
        }

        let held = [Button::Minus, Button::Plus, Button::Menu]
            .into_iter()
            .any(|b| gpio.is_long_long_pressed(b));
        self.long_press.store(held, Ordering::Release);
    }

    /// Revalidate and scan if the schedule says so
    pub fn maybe_scan(&mut self, now: Instant) {
        if !self.schedule.begin(now) {
            return;
        }
        self.registry.revalidate();
        let registered = self.registry.scan();
        self.schedule.finish(now, registered);
    }

    /// Read pending input; a failure pulls the next scan forward
    pub fn read_evdev(&mut self, now: Instant) {
        if let Err(e) = read_devices(&mut self.registry, &self.table, &self.queue) {
            debug!("Input read failed ({}), rescanning soon", e);
            self.schedule.read_failed(now);
        }
    }

    /// GPIO, scan and read, without the sleep
    pub fn tick(&mut self, now: Instant) {
        self.poll_gpio();
        self.maybe_scan(now);
        self.read_evdev(now);
    }
}

/// Background thread running [`PollCycle`] until stopped
pub struct InputPoller {
    running: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl InputPoller {
    /// Spawn the poll thread
    pub fn start<B>(cycle: PollCycle<B>) -> std::io::Result<Self>
    where
        B: InputBackend + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();

        let join = thread::Builder::new()
            .name("input-poll".into())
            .spawn(move || run_poll_loop(running_thread, cycle))?;

        Ok(Self {
            running,
            join: Some(join),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the poller and wait for it to close its devices
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.join.take() {
            if handle.join().is_err() {
                warn!("Input poll thread panicked");
            }
        }
    }
}

impl Drop for InputPoller {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_poll_loop<B: InputBackend>(running: Arc<AtomicBool>, mut cycle: PollCycle<B>) {
    info!("Input poll thread started");
    let is_running = || running.load(Ordering::Acquire);

    while is_running() {
        cycle.poll_gpio();
        if !is_running() {
            break;
        }
        let now = Instant::now();
        cycle.maybe_scan(now);
        cycle.read_evdev(now);
        if !is_running() {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    cycle.registry.close_all();
    info!("Input poll thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Buttons;
    use crate::gpio::{KeyOverride, LatchedKeys};
    use crate::virtual_device::VirtualBackend;

    type Fixture = (PollCycle<VirtualBackend>, Arc<EventQueue>, Arc<AtomicBool>);

    fn cycle_with(gpio: Arc<dyn GpioKeys>, now: Instant) -> Fixture {
        let queue = Arc::new(EventQueue::new());
        let flag = Arc::new(AtomicBool::new(false));
        let cycle = PollCycle::new(
            DeviceRegistry::new(VirtualBackend::new()),
            KeyTable::default(),
            queue.clone(),
            gpio,
            flag.clone(),
            now,
        );
        (cycle, queue, flag)
    }

    #[test]
    fn test_first_scan_waits_for_settle_delay() {
        let t0 = Instant::now();
        let mut schedule = ScanSchedule::new(t0);
        assert!(!schedule.begin(t0 + Duration::from_secs(1)));
        assert!(!schedule.begin(t0 + SCAN_SETTLE_DELAY));
        assert!(schedule.begin(t0 + SCAN_SETTLE_DELAY + Duration::from_millis(1)));
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let t0 = Instant::now();
        let mut schedule = ScanSchedule::new(t0);
        let mut now = t0 + Duration::from_secs(3);

        let mut delays = Vec::new();
        for _ in 0..5 {
            assert!(schedule.begin(now));
            schedule.finish(now, 0);
            delays.push(schedule.next_scan() - now);
            now = schedule.next_scan() + Duration::from_millis(1);
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
    }

    #[test]
    fn test_successful_scan_resets_backoff() {
        let t0 = Instant::now();
        let mut schedule = ScanSchedule::new(t0);
        let mut now = t0 + Duration::from_secs(3);
        for _ in 0..4 {
            assert!(schedule.begin(now));
            now = schedule.next_scan() + Duration::from_millis(1);
        }
        assert_eq!(schedule.attempts(), 4);

        assert!(schedule.begin(now));
        schedule.finish(now, 1);
        assert_eq!(schedule.attempts(), 0);
        assert_eq!(schedule.next_scan(), now + SCAN_SETTLE_DELAY);
    }

    #[test]
    fn test_read_error_overrides_backoff() {
        let t0 = Instant::now();
        let mut schedule = ScanSchedule::new(t0);
        let now = t0 + Duration::from_secs(5);
        schedule.begin(now);
        schedule.read_failed(now);
        assert_eq!(schedule.next_scan(), now + SCAN_AFTER_READ_ERROR);
    }

    /// Fixed predicate answers that survive refresh()
    #[derive(Default)]
    struct Scripted {
        pressed: Buttons,
        long: Buttons,
        long_long: Buttons,
    }

    impl GpioKeys for Scripted {
        fn is_pressed(&self, b: Button) -> bool {
            self.pressed.contains(b.flag())
        }
        fn is_long_pressed(&self, b: Button) -> bool {
            self.long.contains(b.flag())
        }
        fn is_long_long_pressed(&self, b: Button) -> bool {
            self.long_long.contains(b.flag())
        }
        fn override_keys(&self, _keys: KeyOverride) {}
    }

    #[test]
    fn test_gpio_presses_are_queued() {
        let gpio = Scripted {
            pressed: Buttons::BACK | Buttons::PLUS,
            long: Buttons::PLUS | Buttons::MENU,
            ..Default::default()
        };
        let (cycle, queue, flag) = cycle_with(Arc::new(gpio), Instant::now());
        cycle.poll_gpio();

        let queued: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(
            queued,
            vec![
                LogicalEvent::Press(Button::Back),
                LogicalEvent::Press(Button::Plus),
                LogicalEvent::Press(Button::Plus),
            ]
        );
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_long_long_press_flag_follows_predicates() {
        let gpio = Scripted {
            long_long: Buttons::MENU,
            ..Default::default()
        };
        let (cycle, _, flag) = cycle_with(Arc::new(gpio), Instant::now());
        cycle.poll_gpio();
        assert!(flag.load(Ordering::Acquire));

        let gpio = Scripted {
            long_long: Buttons::BACK,
            ..Default::default()
        };
        let (cycle, _, flag) = cycle_with(Arc::new(gpio), Instant::now());
        flag.store(true, Ordering::Release);
        cycle.poll_gpio();
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_latched_overrides_clear_at_tick_start() {
        let gpio = Arc::new(LatchedKeys::new());
        let (cycle, queue, _) = cycle_with(gpio.clone(), Instant::now());
        gpio.override_keys(KeyOverride::from_nibbles(0x1, 0));
        cycle.poll_gpio();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_poller_stops_promptly() {
        let (cycle, _, _) = cycle_with(Arc::new(crate::gpio::NoGpio), Instant::now());
        let poller = InputPoller::start(cycle).unwrap();
        assert!(poller.is_running());
        let started = Instant::now();
        poller.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
