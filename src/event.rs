//! Logical input events
//!
//! Every input path (evdev keyboards, GPIO keys, rotary encoders) is reduced to
//! the same small vocabulary of button presses. At the UI boundary these are
//! packed into a `u32`:
//! - bits 0-15:  one bit per [`Button`]
//! - bits 16-23: raw scan code of a key that has no mapping

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Set of logical buttons, as carried in the low 16 bits of a packed event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u16 {
        const MENU = 0x01;
        const BACK = 0x02;
        const PLUS = 0x04;
        const MINUS = 0x08;
        const QA1 = 0x10;
        const QA2 = 0x20;
        const QA3 = 0x40;
    }
}

/// A single logical button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Menu,
    Back,
    Plus,
    Minus,
    Qa1,
    Qa2,
    Qa3,
}

impl Button {
    pub const ALL: [Button; 7] = [
        Button::Menu,
        Button::Back,
        Button::Plus,
        Button::Minus,
        Button::Qa1,
        Button::Qa2,
        Button::Qa3,
    ];

    pub fn flag(self) -> Buttons {
        match self {
            Button::Menu => Buttons::MENU,
            Button::Back => Buttons::BACK,
            Button::Plus => Buttons::PLUS,
            Button::Minus => Buttons::MINUS,
            Button::Qa1 => Buttons::QA1,
            Button::Qa2 => Buttons::QA2,
            Button::Qa3 => Buttons::QA3,
        }
    }
}

/// Shift applied to an unmapped scan code in the packed representation
pub const UNKNOWN_KEY_SHIFT: u32 = 16;

/// Mask of the unknown-key byte in the packed representation
pub const UNKNOWN_KEY_MASK: u32 = 0x00FF_0000;

/// A normalized input notification, independent of the device it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalEvent {
    Press(Button),
    /// A key with no entry in the key map; carries the raw scan code
    UnknownKey(u8),
}

impl LogicalEvent {
    /// Pack into the `u32` wire form used at the UI boundary
    pub fn to_bits(self) -> u32 {
        match self {
            LogicalEvent::Press(button) => u32::from(button.flag().bits()),
            LogicalEvent::UnknownKey(code) => u32::from(code) << UNKNOWN_KEY_SHIFT,
        }
    }

    /// Unpack a single event from its wire form.
    ///
    /// Returns `None` for zero, for values with more than one button bit, and
    /// for values mixing button bits with an unknown-key payload.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let code = ((bits & UNKNOWN_KEY_MASK) >> UNKNOWN_KEY_SHIFT) as u8;
        let low = (bits & 0xFFFF) as u16;
        if code != 0 {
            return (low == 0 && bits & !UNKNOWN_KEY_MASK == 0)
                .then_some(LogicalEvent::UnknownKey(code));
        }
        Button::ALL
            .into_iter()
            .find(|b| u32::from(b.flag().bits()) == bits)
            .map(LogicalEvent::Press)
    }
}

impl fmt::Display for LogicalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalEvent::Press(button) => write!(f, "press {button:?}"),
            LogicalEvent::UnknownKey(code) => write!(f, "unknown key {code}"),
        }
    }
}
