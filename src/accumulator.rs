//! Per-tick fold of queued events into a triggered-events set

use crate::event::{Button, Buttons, LogicalEvent, UNKNOWN_KEY_MASK, UNKNOWN_KEY_SHIFT};
use crate::queue::EventQueue;

/// Maximum number of events folded per consumption cycle
pub const MAX_EVENTS_PER_TICK: usize = 20;

/// Everything that was triggered during one UI tick.
///
/// Button flags are sticky: once set they stay set until the next
/// consumption cycle. Only the most recent unknown key is kept, and recording
/// it never touches the button flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggeredEvents {
    sticky: Buttons,
    /// Bits 0-15 as injected, including bits with no named button
    raw_low: u16,
    last_unknown_key: Option<u8>,
    /// Bits 24-31, only reachable through [`TriggeredEvents::inject`]
    high: u8,
}

impl TriggeredEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn buttons(&self) -> Buttons {
        self.sticky
    }

    pub fn contains(&self, button: Button) -> bool {
        self.sticky.contains(button.flag())
    }

    pub fn last_unknown_key(&self) -> Option<u8> {
        self.last_unknown_key
    }

    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }

    /// Fold one event in
    pub fn record(&mut self, event: LogicalEvent) {
        match event {
            LogicalEvent::Press(button) => {
                self.sticky |= button.flag();
                self.raw_low |= button.flag().bits();
            }
            LogicalEvent::UnknownKey(code) => self.last_unknown_key = Some(code),
        }
    }

    pub fn press(&mut self, buttons: Buttons) {
        self.sticky |= buttons;
        self.raw_low |= buttons.bits();
    }

    /// OR arbitrary packed bits into the current set and return the result
    pub fn inject(&mut self, bits: u32) -> u32 {
        let low = (bits & 0xFFFF) as u16;
        self.raw_low |= low;
        self.sticky |= Buttons::from_bits_truncate(low);

        let code = ((bits & UNKNOWN_KEY_MASK) >> UNKNOWN_KEY_SHIFT) as u8;
        if code != 0 {
            let merged = self.last_unknown_key.unwrap_or(0) | code;
            self.last_unknown_key = Some(merged);
        }
        self.high |= (bits >> 24) as u8;
        self.bits()
    }

    /// Packed `u32` form used at the UI boundary
    pub fn bits(&self) -> u32 {
        let unknown = self
            .last_unknown_key
            .map_or(0, |code| u32::from(code) << UNKNOWN_KEY_SHIFT);
        u32::from(self.raw_low) | unknown | (u32::from(self.high) << 24)
    }

    /// Start a new cycle and drain up to [`MAX_EVENTS_PER_TICK`] events.
    ///
    /// Returns the number of events consumed; anything left stays queued for
    /// the next call.
    pub fn consume_from(&mut self, queue: &EventQueue) -> usize {
        self.clear();
        let mut consumed = 0;
        while consumed < MAX_EVENTS_PER_TICK {
            let Some(event) = queue.dequeue() else {
                break;
            };
            self.record(event);
            consumed += 1;
        }
        consumed
    }
}
