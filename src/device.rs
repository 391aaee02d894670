//! Input device registry: detection, hot-plug and revalidation
//!
//! Keyboards and IR/USB remotes show up as `/dev/input/eventN`. The registry
//! keeps one slot per node index (0-9); a slot's index never changes while the
//! device is registered, and duplicate rejection relies on "lower index wins".

use std::io;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of `/dev/input/eventN` nodes tracked
pub const MAX_INPUT_DEVICES: usize = 10;

/// Longest device name kept, in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Key codes a device must advertise to be treated as a keyboard.
/// Mice and touch panels carry neither.
pub const KEYBOARD_PROBE_KEYS: [u16; 2] = [b' ' as u16, b'a' as u16];

/// `EV_KEY` record type
pub const EV_KEY: u16 = 0x01;

/// Key record values
pub const KEY_UP: i32 = 0;
pub const KEY_DOWN: i32 = 1;
pub const KEY_AUTOREPEAT: i32 = 2;

/// Hardware identity as reported by `EVIOCGID`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HardwareId {
    pub bus: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

impl HardwareId {
    pub const fn new(bus: u16, vendor: u16, product: u16, version: u16) -> Self {
        Self {
            bus,
            vendor,
            product,
            version,
        }
    }
}

/// One `{type, code, value}` input record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl RawRecord {
    pub const fn key(code: u16, value: i32) -> Self {
        Self {
            kind: EV_KEY,
            code,
            value,
        }
    }
}

/// An open input node
pub trait InputNode: Send {
    /// Query the identity from the device (not a cached copy)
    fn identity(&self) -> io::Result<HardwareId>;

    /// Query the name from the device (not a cached copy)
    fn name(&self) -> io::Result<String>;

    /// Whether the key capability map contains `code`
    fn has_key(&self, code: u16) -> io::Result<bool>;

    /// Read at most `max` records without blocking.
    ///
    /// A short read (less than one record, or nothing pending) yields an empty
    /// vector. Errors mean the device is gone or broken.
    fn read_records(&mut self, max: usize) -> io::Result<Vec<RawRecord>>;
}

/// Where input nodes come from
pub trait InputBackend: Send {
    type Node: InputNode;

    fn node_path(&self, index: usize) -> PathBuf;

    /// Whether the node at `index` exists and is readable
    fn is_accessible(&self, index: usize) -> bool;

    /// Open the node at `index` read-only and non-blocking
    fn open(&self, index: usize) -> io::Result<Self::Node>;

    /// Wait up to `timeout` for any of `nodes` to become readable and return
    /// the slot indices that are.
    fn wait_readable(
        &self,
        nodes: &[(usize, &Self::Node)],
        timeout: Duration,
    ) -> io::Result<Vec<usize>>;
}

/// Hot-plug notification for the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNotice {
    Added { slot: usize, name: String },
    Removed { slot: usize, name: String },
}

/// A registered device
#[derive(Debug)]
pub struct OpenDevice<N> {
    pub node: N,
    pub id: HardwareId,
    pub name: String,
}

/// One registry slot
#[derive(Debug)]
pub struct InputDeviceSlot<N> {
    device: Option<OpenDevice<N>>,
    /// Never probe this node again. Kept for callers that want to blacklist
    /// a node; the scan flow itself does not set it.
    pub ignore: bool,
}

impl<N> Default for InputDeviceSlot<N> {
    fn default() -> Self {
        Self {
            device: None,
            ignore: false,
        }
    }
}

impl<N> InputDeviceSlot<N> {
    pub fn device(&self) -> Option<&OpenDevice<N>> {
        self.device.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.device.is_none()
    }
}

/// Why an occupied slot failed revalidation
#[derive(Debug)]
enum Stale {
    Missing,
    Identity(io::Result<HardwareId>),
    Name(io::Result<String>),
}

/// Truncate to at most [`MAX_NAME_LEN`] bytes on a char boundary
fn clamp_name(mut name: String) -> String {
    if name.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Table of open input devices, owned by the poll thread
pub struct DeviceRegistry<B: InputBackend> {
    backend: B,
    slots: Vec<InputDeviceSlot<B::Node>>,
    notices: Option<Sender<DeviceNotice>>,
}

impl<B: InputBackend> DeviceRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            slots: (0..MAX_INPUT_DEVICES).map(|_| InputDeviceSlot::default()).collect(),
            notices: None,
        }
    }

    /// Deliver add/remove notices to `sender`
    pub fn with_notices(mut self, sender: Sender<DeviceNotice>) -> Self {
        self.notices = Some(sender);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn slots(&self) -> &[InputDeviceSlot<B::Node>] {
        &self.slots
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut InputDeviceSlot<B::Node>> {
        self.slots.get_mut(index)
    }

    pub fn device(&self, index: usize) -> Option<&OpenDevice<B::Node>> {
        self.slots.get(index).and_then(InputDeviceSlot::device)
    }

    pub fn registered_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_empty()).count()
    }

    fn notify(&self, notice: DeviceNotice) {
        if let Some(sender) = &self.notices {
            // The UI side may already be gone during shutdown.
            let _ = sender.send(notice);
        }
    }

    /// Close the device in `index`, free the slot and raise a removal notice
    pub fn evict(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let Some(device) = slot.device.take() else {
            return;
        };
        slot.ignore = false;
        info!(
            "Input device index {} [{}] is no longer present or working, closed it",
            index, device.name
        );
        let name = device.name.clone();
        drop(device);
        self.notify(DeviceNotice::Removed { slot: index, name });
    }

    /// Close every open device without notifications (teardown)
    pub fn close_all(&mut self) {
        let mut closed = 0;
        for slot in &mut self.slots {
            if slot.device.take().is_some() {
                closed += 1;
            }
            slot.ignore = false;
        }
        if closed > 0 {
            debug!("Closed {} input device(s)", closed);
        }
    }

    fn check(&self, index: usize, device: &OpenDevice<B::Node>) -> Result<(), Stale> {
        if !self.backend.is_accessible(index) {
            return Err(Stale::Missing);
        }
        match device.node.identity() {
            Ok(id) if id == device.id => {}
            other => return Err(Stale::Identity(other)),
        }
        let name = device.node.name().or_else(|_| device.node.name());
        match name {
            Ok(name) if clamp_name(name.clone()) == device.name => Ok(()),
            other => Err(Stale::Name(other)),
        }
    }

    /// Evict every registered device whose node vanished or no longer
    /// reports the same identity and name. Returns the number evicted.
    pub fn revalidate(&mut self) -> usize {
        let stale: Vec<(usize, Stale)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let device = slot.device.as_ref()?;
                self.check(i, device).err().map(|why| (i, why))
            })
            .collect();

        for (index, why) in &stale {
            debug!("Input device index {} failed recheck: {:?}", index, why);
            self.evict(*index);
        }
        stale.len()
    }

    /// Open and vet the node at `index`
    fn probe(&self, index: usize) -> io::Result<Option<OpenDevice<B::Node>>> {
        let node = self.backend.open(index)?;

        for code in KEYBOARD_PROBE_KEYS {
            if !node.has_key(code)? {
                return Ok(None);
            }
        }

        let id = node.identity()?;
        let name = clamp_name(node.name()?);
        Ok(Some(OpenDevice { node, id, name }))
    }

    fn is_duplicate(&self, index: usize, id: HardwareId) -> bool {
        self.slots[..index]
            .iter()
            .filter_map(InputDeviceSlot::device)
            .any(|d| d.id == id)
    }

    /// Look for new keyboards in empty slots and register them.
    ///
    /// Returns the number of devices registered by this call. Devices that
    /// fail any check are closed and probed again on the next scan.
    pub fn scan(&mut self) -> usize {
        if !self.backend.is_accessible(0) {
            return 0;
        }

        let mut added = 0;
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if !slot.is_empty() || slot.ignore {
                continue;
            }
            if !self.backend.is_accessible(index) {
                continue;
            }

            let device = match self.probe(index) {
                Ok(Some(device)) => device,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        "Failed to probe input device {:?}: {}",
                        self.backend.node_path(index),
                        e
                    );
                    continue;
                }
            };

            if self.is_duplicate(index, device.id) {
                debug!(
                    "Input device index {} [{}] duplicates a lower index, skipped",
                    index, device.name
                );
                continue;
            }

            let HardwareId {
                bus,
                vendor,
                product,
                version,
            } = device.id;
            info!(
                "Found new input device ID: bus {:#x} vendor {:#x} product {:#x} version {:#x}",
                bus, vendor, product, version
            );
            info!("Registered input device [{}] at index {}", device.name, index);

            let name = device.name.clone();
            self.slots[index].device = Some(device);
            self.notify(DeviceNotice::Added { slot: index, name });
            added += 1;
        }
        added
    }

    /// Slot indices of all registered devices that currently have input
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<Vec<usize>> {
        let nodes: Vec<(usize, &B::Node)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.device.as_ref().map(|d| (i, &d.node)))
            .collect();
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        self.backend.wait_readable(&nodes, timeout)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut B::Node> {
        self.slots
            .get_mut(index)
            .and_then(|s| s.device.as_mut())
            .map(|d| &mut d.node)
    }
}

impl<B: InputBackend> Drop for DeviceRegistry<B> {
    fn drop(&mut self) {
        self.close_all();
    }
}
