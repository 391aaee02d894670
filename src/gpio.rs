//! GPIO key capability
//!
//! The press predicates live in a hardware layer outside this crate. They are
//! consumed through [`GpioKeys`] so that the poll thread and the rotary bridge
//! can share one source and tests can script it.

use crate::event::{Button, Buttons};
use std::sync::atomic::{AtomicU16, Ordering};

/// Source of GPIO button state.
///
/// Shared between the poll thread and the UI thread, so implementations use
/// interior mutability.
pub trait GpioKeys: Send + Sync {
    /// Sample the pins. Called once at the start of every poll tick.
    fn refresh(&self) {}

    fn is_pressed(&self, button: Button) -> bool;

    fn is_long_pressed(&self, button: Button) -> bool;

    fn is_long_long_pressed(&self, button: Button) -> bool;

    /// Simulate presses as if the pins had been driven
    fn override_keys(&self, keys: KeyOverride);
}

/// Simulated key states for [`GpioKeys::override_keys`].
///
/// Two independent groups of four: short presses and long presses of
/// menu/back/plus/minus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyOverride {
    pub menu: bool,
    pub back: bool,
    pub plus: bool,
    pub minus: bool,
    pub menu_long: bool,
    pub back_long: bool,
    pub plus_long: bool,
    pub minus_long: bool,
}

impl KeyOverride {
    /// Build from two 4-bit nibbles (bit 0 menu, 1 back, 2 plus, 3 minus)
    pub fn from_nibbles(short: u8, long: u8) -> Self {
        Self {
            menu: short & 0x01 != 0,
            back: short & 0x02 != 0,
            plus: short & 0x04 != 0,
            minus: short & 0x08 != 0,
            menu_long: long & 0x01 != 0,
            back_long: long & 0x02 != 0,
            plus_long: long & 0x04 != 0,
            minus_long: long & 0x08 != 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Buttons reported as pressed; a long press implies a press
    pub fn pressed(&self) -> Buttons {
        let mut buttons = self.long_pressed();
        buttons.set(Buttons::MENU, self.menu || self.menu_long);
        buttons.set(Buttons::BACK, self.back || self.back_long);
        buttons.set(Buttons::PLUS, self.plus || self.plus_long);
        buttons.set(Buttons::MINUS, self.minus || self.minus_long);
        buttons
    }

    pub fn long_pressed(&self) -> Buttons {
        let mut buttons = Buttons::empty();
        buttons.set(Buttons::MENU, self.menu_long);
        buttons.set(Buttons::BACK, self.back_long);
        buttons.set(Buttons::PLUS, self.plus_long);
        buttons.set(Buttons::MINUS, self.minus_long);
        buttons
    }
}

/// No GPIO hardware: nothing is ever pressed and overrides are dropped
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGpio;

impl GpioKeys for NoGpio {
    fn is_pressed(&self, _button: Button) -> bool {
        false
    }

    fn is_long_pressed(&self, _button: Button) -> bool {
        false
    }

    fn is_long_long_pressed(&self, _button: Button) -> bool {
        false
    }

    fn override_keys(&self, _keys: KeyOverride) {}
}

/// In-memory key source whose states are set by overrides.
///
/// Overridden states latch until the next [`GpioKeys::refresh`], which is the
/// poll thread's sampling point. Used when no GPIO pins are wired.
#[derive(Debug, Default)]
pub struct LatchedKeys {
    pressed: AtomicU16,
    long: AtomicU16,
    long_long: AtomicU16,
}

impl LatchedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold buttons in the long-long-pressed state until the next refresh
    pub fn hold(&self, buttons: Buttons) {
        self.pressed.fetch_or(buttons.bits(), Ordering::AcqRel);
        self.long.fetch_or(buttons.bits(), Ordering::AcqRel);
        self.long_long.fetch_or(buttons.bits(), Ordering::AcqRel);
    }

    fn test(cell: &AtomicU16, button: Button) -> bool {
        cell.load(Ordering::Acquire) & button.flag().bits() != 0
    }
}

impl GpioKeys for LatchedKeys {
    fn refresh(&self) {
        self.pressed.store(0, Ordering::Release);
        self.long.store(0, Ordering::Release);
        self.long_long.store(0, Ordering::Release);
    }

    fn is_pressed(&self, button: Button) -> bool {
        Self::test(&self.pressed, button)
    }

    fn is_long_pressed(&self, button: Button) -> bool {
        Self::test(&self.long, button)
    }

    fn is_long_long_pressed(&self, button: Button) -> bool {
        Self::test(&self.long_long, button)
    }

    fn override_keys(&self, keys: KeyOverride) {
        self.pressed.fetch_or(keys.pressed().bits(), Ordering::AcqRel);
        self.long.fetch_or(keys.long_pressed().bits(), Ordering::AcqRel);
    }
}

/// Buttons whose predicates currently report a press
pub fn pressed_buttons(gpio: &dyn GpioKeys) -> Buttons {
    Button::ALL
        .into_iter()
        .filter(|&b| gpio.is_pressed(b))
        .fold(Buttons::empty(), |acc, b| acc | b.flag())
}
