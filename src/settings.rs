//! Input settings
//!
//! Key map, rotary encoder functions and device paths, stored as TOML.

use crate::evdev_backend::DEFAULT_NODE_PREFIX;
use crate::keymap::KeyMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Where the rotary writer publishes its record by default
pub const DEFAULT_ROTARY_REGION: &str = "/dev/shm/rotary_encoder_events";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not find config directory")]
    NoConfigDir,
    #[error("settings I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("could not serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// What a rotary encoder is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotaryFunction {
    None,
    #[default]
    Menu,
    Camera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotarySpeed {
    #[default]
    Normal,
    /// Fast rotations are reported as plain ones
    Slow,
}

/// Function and speed of the primary and secondary encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotarySettings {
    pub function: RotaryFunction,
    pub speed: RotarySpeed,
    pub function2: RotaryFunction,
    pub speed2: RotarySpeed,
}

impl Default for RotarySettings {
    fn default() -> Self {
        Self {
            function: RotaryFunction::Menu,
            speed: RotarySpeed::Normal,
            function2: RotaryFunction::Camera,
            speed2: RotarySpeed::Normal,
        }
    }
}

/// Everything the input subsystem reads from disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    /// Evdev node path without the index, e.g. `/dev/input/event`
    pub node_prefix: String,
    /// Shared-memory file the rotary writer publishes into
    pub rotary_region: PathBuf,
    pub rotary: RotarySettings,
    pub keymap: KeyMap,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            node_prefix: DEFAULT_NODE_PREFIX.to_string(),
            rotary_region: PathBuf::from(DEFAULT_ROTARY_REGION),
            rotary: RotarySettings::default(),
            keymap: KeyMap::default(),
        }
    }
}

impl InputSettings {
    /// Default settings file path (`~/.config/inputhub/input.toml`)
    pub fn settings_path() -> Result<PathBuf, SettingsError> {
        let config_dir = dirs::config_dir()
            .ok_or(SettingsError::NoConfigDir)?
            .join("inputhub");
        Ok(config_dir.join("input.toml"))
    }

    /// Load from the default path (or defaults if there is no file yet)
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::settings_path()?)
    }

    /// Load from `path`, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: InputSettings =
            toml::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Write to `path`, creating its directory if needed
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(io_err)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Put the primary encoder back on menu navigation.
    ///
    /// Returns whether anything changed.
    pub fn reset_primary_rotary(&mut self) -> bool {
        if self.rotary.function == RotaryFunction::Menu {
            return false;
        }
        info!(
            "Primary rotary function {:?} -> {:?}",
            self.rotary.function,
            RotaryFunction::Menu
        );
        self.rotary.function = RotaryFunction::Menu;
        true
    }
}
