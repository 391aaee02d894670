//! Scan code to logical event mapping
//!
//! Different remotes and keyboard layouts send different codes for the same
//! intent, so the table is many-to-one and loaded from the settings file
//! rather than hardcoded.

use crate::event::{Button, LogicalEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Scan codes assigned to each logical button, plus codes that are dropped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyMap {
    pub menu: Vec<u16>,
    pub back: Vec<u16>,
    pub plus: Vec<u16>,
    pub minus: Vec<u16>,
    pub qa1: Vec<u16>,
    pub qa2: Vec<u16>,
    pub qa3: Vec<u16>,
    /// Codes that never produce an event, on top of Num Lock (69)
    pub ignored: Vec<u16>,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            menu: vec![28, 57, 96],
            back: vec![14, 1],
            plus: vec![103, 22, 72, 75],
            minus: vec![108, 32, 80, 77],
            qa1: vec![2, 79],
            qa2: vec![3],
            qa3: vec![4, 81],
            ignored: vec![69],
        }
    }
}

/// Num Lock; never produces an event whatever the key map says
pub const ALWAYS_IGNORED_KEY: u16 = 69;

/// What a single key-down code resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Press(Button),
    Ignore,
}

/// Lookup table compiled from a [`KeyMap`]
#[derive(Debug, Clone)]
pub struct KeyTable {
    codes: HashMap<u16, Resolution>,
}

impl KeyTable {
    /// Build the lookup table. When a code is listed more than once, the
    /// ignore list wins, then the first button in menu..qa3 order.
    /// [`ALWAYS_IGNORED_KEY`] is ignored even if the map assigns it.
    pub fn new(map: &KeyMap) -> Self {
        let mut codes = HashMap::new();
        codes.insert(ALWAYS_IGNORED_KEY, Resolution::Ignore);
        for &code in &map.ignored {
            codes.insert(code, Resolution::Ignore);
        }
        let groups = [
            (Button::Menu, &map.menu),
            (Button::Back, &map.back),
            (Button::Plus, &map.plus),
            (Button::Minus, &map.minus),
            (Button::Qa1, &map.qa1),
            (Button::Qa2, &map.qa2),
            (Button::Qa3, &map.qa3),
        ];
        for (button, list) in groups {
            for &code in list {
                codes.entry(code).or_insert(Resolution::Press(button));
            }
        }
        Self { codes }
    }

    /// Resolve a key-down scan code.
    ///
    /// Unmapped codes become [`LogicalEvent::UnknownKey`]; codes that do not
    /// fit the unknown-key byte (0 and anything above 255) are dropped.
    pub fn resolve(&self, code: u16) -> Option<LogicalEvent> {
        match self.codes.get(&code) {
            Some(Resolution::Press(button)) => Some(LogicalEvent::Press(*button)),
            Some(Resolution::Ignore) => None,
            None => match u8::try_from(code) {
                Ok(raw) if raw != 0 => {
                    debug!("Pressed unknown key {}", code);
                    Some(LogicalEvent::UnknownKey(raw))
                }
                _ => {
                    debug!("Dropping key {} (no room in unknown-key byte)", code);
                    None
                }
            },
        }
    }
}

impl Default for KeyTable {
    fn default() -> Self {
        Self::new(&KeyMap::default())
    }
}
