//! Rotary encoder bridge
//!
//! A separate I2C process publishes rotary encoder and extender button events
//! into a small shared-memory record. The UI thread polls it once per tick.
//!
//! Record layout (little-endian, 20 bytes):
//! - `0..4`   event index, bumped by the writer on every update
//! - `4..8`   writer timestamp (ms)
//! - `8`      primary encoder present
//! - `9`      primary encoder event bits
//! - `10`     secondary encoder present
//! - `11`     secondary encoder event bits
//! - `12..16` extender buttons (short presses in bits 0-3, long in 16-19)
//! - `16..20` CRC-32 over bytes `0..16`
//!
//! The writer never coordinates with readers, so a copy can be torn; the CRC
//! catches that and the reader tries once more before giving up for the tick.

use crate::gpio::{GpioKeys, KeyOverride};
use crate::settings::{RotaryFunction, RotarySettings, RotarySpeed};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Size of the published record
pub const SNAPSHOT_LEN: usize = 20;

/// Bytes covered by the CRC
const CRC_COVERED: usize = SNAPSHOT_LEN - 4;

/// Pause before re-reading a record that failed its CRC
pub const CRC_RETRY_DELAY: Duration = Duration::from_micros(200);

/// Consecutive cancel polls on the primary encoder that restore menu
/// navigation when there is no secondary encoder
pub const LONG_CANCEL_THRESHOLD: u32 = 8;

/// Encoder event bits
pub const ROTARY_SELECT: u8 = 0x01;
pub const ROTARY_CANCEL: u8 = 0x02;
pub const ROTARY_CCW: u8 = 0x04;
pub const ROTARY_CW: u8 = 0x08;
pub const ROTARY_FAST_CCW: u8 = 0x10;
pub const ROTARY_FAST_CW: u8 = 0x20;

/// A verified copy of the shared record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotarySnapshot {
    pub event_index: u32,
    pub timestamp: u32,
    pub has_primary: bool,
    pub primary_events: u8,
    pub has_secondary: bool,
    pub secondary_events: u8,
    pub buttons: u32,
}

fn le_u32(bytes: &[u8; SNAPSHOT_LEN], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl RotarySnapshot {
    /// Serialize with a freshly computed CRC (the writer's side)
    pub fn to_bytes(&self) -> [u8; SNAPSHOT_LEN] {
        let mut bytes = [0u8; SNAPSHOT_LEN];
        bytes[0..4].copy_from_slice(&self.event_index.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[8] = u8::from(self.has_primary);
        bytes[9] = self.primary_events;
        bytes[10] = u8::from(self.has_secondary);
        bytes[11] = self.secondary_events;
        bytes[12..16].copy_from_slice(&self.buttons.to_le_bytes());
        let crc = crc32fast::hash(&bytes[..CRC_COVERED]);
        bytes[16..20].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Parse and verify a raw copy
    pub fn from_bytes(bytes: &[u8; SNAPSHOT_LEN]) -> Result<Self, IntegrityError> {
        let stored = le_u32(bytes, 16);
        let computed = crc32fast::hash(&bytes[..CRC_COVERED]);
        if stored != computed {
            return Err(IntegrityError { stored, computed });
        }
        Ok(Self {
            event_index: le_u32(bytes, 0),
            timestamp: le_u32(bytes, 4),
            has_primary: bytes[8] != 0,
            primary_events: bytes[9],
            has_secondary: bytes[10] != 0,
            secondary_events: bytes[11],
            buttons: le_u32(bytes, 12),
        })
    }

    fn stamp(&self) -> (u32, u32) {
        (self.event_index, self.timestamp)
    }
}

/// The record did not match its CRC (usually a copy racing the writer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rotary record CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
pub struct IntegrityError {
    pub stored: u32,
    pub computed: u32,
}

/// Something the raw record can be copied out of
pub trait SnapshotSource {
    fn copy_raw(&self) -> [u8; SNAPSHOT_LEN];
}

/// Read-only mapping of the shared-memory record.
///
/// Touching a mapped page past the end of a truncated file raises SIGBUS, so
/// the file length is checked before every copy. A region shorter than the
/// record reads as all zeroes, which never passes the CRC.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    file: File,
    path: PathBuf,
}

// The mapping is read-only and only ever copied out of with volatile reads.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Map the record published at `path` (e.g. a file under `/dev/shm`)
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < SNAPSHOT_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared region {path:?} is {len} bytes, need {SNAPSHOT_LEN}"),
            ));
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                SNAPSHOT_LEN,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;

        Ok(Self {
            ptr,
            len: SNAPSHOT_LEN,
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_complete(&self) -> bool {
        self.file
            .metadata()
            .is_ok_and(|m| m.len() >= SNAPSHOT_LEN as u64)
    }
}

impl SnapshotSource for SharedRegion {
    fn copy_raw(&self) -> [u8; SNAPSHOT_LEN] {
        let mut bytes = [0u8; SNAPSHOT_LEN];
        if !self.is_complete() {
            return bytes;
        }
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = unsafe { ptr::read_volatile(self.ptr.as_ptr().add(i)) };
        }
        bytes
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Copy and verify, retrying once after [`CRC_RETRY_DELAY`]
pub fn read_verified(source: &dyn SnapshotSource) -> Result<RotarySnapshot, IntegrityError> {
    verify_or_retry(&source.copy_raw(), source)
}

fn verify_or_retry(
    first: &[u8; SNAPSHOT_LEN],
    source: &dyn SnapshotSource,
) -> Result<RotarySnapshot, IntegrityError> {
    RotarySnapshot::from_bytes(first).or_else(|_| {
        thread::sleep(CRC_RETRY_DELAY);
        RotarySnapshot::from_bytes(&source.copy_raw())
    })
}

/// Decoded actions of one encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderActions {
    pub select: bool,
    pub cancel: bool,
    pub rotate_ccw: bool,
    pub rotate_cw: bool,
    pub fast_ccw: bool,
    pub fast_cw: bool,
}

impl EncoderActions {
    pub fn from_bits(bits: u8) -> Self {
        Self {
            select: bits & ROTARY_SELECT != 0,
            cancel: bits & ROTARY_CANCEL != 0,
            rotate_ccw: bits & ROTARY_CCW != 0,
            rotate_cw: bits & ROTARY_CW != 0,
            fast_ccw: bits & ROTARY_FAST_CCW != 0,
            fast_cw: bits & ROTARY_FAST_CW != 0,
        }
    }

    pub fn any(&self) -> bool {
        *self != Self::default()
    }

    /// Only select, cancel and the plain rotations
    pub fn basic(&self) -> Self {
        Self {
            fast_ccw: false,
            fast_cw: false,
            ..*self
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            select: self.select || other.select,
            cancel: self.cancel || other.cancel,
            rotate_ccw: self.rotate_ccw || other.rotate_ccw,
            rotate_cw: self.rotate_cw || other.rotate_cw,
            fast_ccw: self.fast_ccw || other.fast_ccw,
            fast_cw: self.fast_cw || other.fast_cw,
        }
    }

    /// Navigation keys these actions stand for
    pub fn as_key_override(&self) -> KeyOverride {
        KeyOverride {
            menu: self.select,
            back: self.cancel,
            plus: self.rotate_ccw,
            minus: self.rotate_cw,
            ..Default::default()
        }
    }
}

/// Raw decode of one fresh record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotaryPoll {
    pub primary: EncoderActions,
    pub secondary: EncoderActions,
    /// Extender buttons forwarded to the GPIO override
    pub buttons: KeyOverride,
    /// The primary cancel was held long enough to restore menu navigation
    pub restore_navigation: bool,
}

/// What the UI gets from one bridge poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotaryReport {
    pub primary: EncoderActions,
    pub secondary: EncoderActions,
    /// Union of the basic actions of every encoder assigned to menu navigation
    pub navigation: EncoderActions,
    pub restore_navigation: bool,
}

impl RotaryReport {
    /// Apply the user's function and speed settings to a raw decode
    pub fn shape(poll: &RotaryPoll, settings: &RotarySettings) -> Self {
        let shape_one = |actions: EncoderActions, function: RotaryFunction, speed: RotarySpeed| {
            if function != RotaryFunction::Menu {
                return EncoderActions::default();
            }
            if speed == RotarySpeed::Slow {
                actions.basic()
            } else {
                actions
            }
        };
        let primary = shape_one(poll.primary, settings.function, settings.speed);
        let secondary = shape_one(poll.secondary, settings.function2, settings.speed2);

        Self {
            primary,
            secondary,
            navigation: primary.basic().union(&secondary.basic()),
            restore_navigation: poll.restore_navigation,
        }
    }
}

enum Mapping {
    Unmapped(PathBuf),
    Mapped(Box<dyn SnapshotSource + Send>),
    Absent,
}

/// UI-side reader of the rotary record
pub struct RotaryBridge {
    mapping: Mapping,
    last_stamp: Option<(u32, u32)>,
    cancel_count: u32,
    cancel_count2: u32,
}

impl RotaryBridge {
    /// Bridge that maps `path` on first poll
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_mapping(Mapping::Unmapped(path.into()))
    }

    /// Bridge over an already open source
    pub fn from_source(source: impl SnapshotSource + Send + 'static) -> Self {
        Self::with_mapping(Mapping::Mapped(Box::new(source)))
    }

    fn with_mapping(mapping: Mapping) -> Self {
        Self {
            mapping,
            last_stamp: None,
            cancel_count: 0,
            cancel_count2: 0,
        }
    }

    /// Whether the record could not be mapped (no I2C hardware)
    pub fn is_absent(&self) -> bool {
        matches!(self.mapping, Mapping::Absent)
    }

    pub fn cancel_counts(&self) -> (u32, u32) {
        (self.cancel_count, self.cancel_count2)
    }

    fn source(&mut self) -> Option<&dyn SnapshotSource> {
        if let Mapping::Unmapped(path) = &self.mapping {
            let path = path.clone();
            self.mapping = match SharedRegion::open(&path) {
                Ok(region) => {
                    info!("Mapped rotary encoder events from {:?}", region.path());
                    Mapping::Mapped(Box::new(region))
                }
                Err(e) => {
                    info!("No rotary encoder events at {:?} ({}), rotary input disabled", path, e);
                    Mapping::Absent
                }
            };
        }
        match &self.mapping {
            Mapping::Mapped(source) => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Read the record and decode it if the writer published something new.
    ///
    /// Returns `None` when the region is absent, nothing changed, or the
    /// record failed its CRC twice. In the last case nothing is remembered,
    /// so the same update is picked up on the next poll. A non-zero extender
    /// button field is forwarded to `gpio` as simulated key presses.
    pub fn poll(&mut self, gpio: &dyn GpioKeys) -> Option<RotaryPoll> {
        let last_stamp = self.last_stamp;
        let source = self.source()?;

        let raw = source.copy_raw();
        // Cheap novelty check before paying for the CRC.
        let stamp = (le_u32(&raw, 0), le_u32(&raw, 4));
        if last_stamp == Some(stamp) {
            return None;
        }

        let snapshot = match verify_or_retry(&raw, source) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("Dropping rotary update: {}", e);
                return None;
            }
        };
        if last_stamp == Some(snapshot.stamp()) {
            return None;
        }
        self.last_stamp = Some(snapshot.stamp());

        let mut poll = self.decode(&snapshot);

        if snapshot.buttons != 0 {
            let short = (snapshot.buttons & 0x0F) as u8;
            let long = ((snapshot.buttons >> 16) & 0x0F) as u8;
            poll.buttons = KeyOverride::from_nibbles(short, long);
            gpio.override_keys(poll.buttons);
        }
        Some(poll)
    }

    fn decode(&mut self, snapshot: &RotarySnapshot) -> RotaryPoll {
        let primary = if snapshot.has_primary {
            EncoderActions::from_bits(snapshot.primary_events)
        } else {
            EncoderActions::default()
        };
        let secondary = if snapshot.has_secondary {
            EncoderActions::from_bits(snapshot.secondary_events)
        } else {
            EncoderActions::default()
        };

        let resets = |a: &EncoderActions| a.select || a.rotate_ccw || a.rotate_cw;
        if !snapshot.has_primary || resets(&primary) {
            self.cancel_count = 0;
        }
        if !snapshot.has_secondary || resets(&secondary) {
            self.cancel_count2 = 0;
        }

        let mut restore_navigation = false;
        if primary.cancel {
            self.cancel_count += 1;
            if !snapshot.has_secondary && self.cancel_count >= LONG_CANCEL_THRESHOLD {
                info!("Rotary cancel held, restoring menu navigation on the primary encoder");
                restore_navigation = true;
                self.cancel_count = 0;
            }
        }
        if secondary.cancel {
            self.cancel_count2 += 1;
        }

        if primary.any() {
            trace!("Primary rotary: {:?}", primary);
        }
        if secondary.any() {
            trace!("Secondary rotary: {:?}", secondary);
        }

        RotaryPoll {
            primary,
            secondary,
            buttons: KeyOverride::default(),
            restore_navigation,
        }
    }
}
