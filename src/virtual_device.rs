//! In-memory input backend
//!
//! Behaves like `/dev/input/eventN` nodes that can be plugged, unplugged and
//! fed key records at runtime. The registry and poll thread run against it
//! unchanged, which makes hot-plug scenarios reproducible without hardware.

use crate::device::{HardwareId, InputBackend, InputNode, RawRecord};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Description of a virtual device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDeviceSpec {
    pub name: String,
    pub id: HardwareId,
    pub keys: Vec<u16>,
}

impl VirtualDeviceSpec {
    pub fn new(name: impl Into<String>, id: HardwareId, keys: Vec<u16>) -> Self {
        Self {
            name: name.into(),
            id,
            keys,
        }
    }

    /// A device with a full set of keyboard keys (codes 1-127)
    pub fn keyboard(name: impl Into<String>, id: HardwareId) -> Self {
        Self::new(name, id, (1..128).collect())
    }
}

#[derive(Debug)]
struct Plugged {
    spec: VirtualDeviceSpec,
    generation: u64,
    pending: VecDeque<RawRecord>,
    broken: bool,
}

#[derive(Debug, Default)]
struct Bus {
    devices: BTreeMap<usize, Plugged>,
    next_generation: u64,
    opens: BTreeMap<usize, usize>,
    fail_wait: bool,
}

/// Shared handle to a set of virtual nodes. Clones see the same devices.
#[derive(Debug, Clone, Default)]
pub struct VirtualBackend {
    bus: Arc<Mutex<Bus>>,
}

fn lock(bus: &Mutex<Bus>) -> MutexGuard<'_, Bus> {
    bus.lock().unwrap_or_else(PoisonError::into_inner)
}

fn gone() -> io::Error {
    io::Error::from_raw_os_error(libc::ENODEV)
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device at `index`, replacing whatever was there
    pub fn plug(&self, index: usize, spec: VirtualDeviceSpec) {
        let mut bus = lock(&self.bus);
        bus.next_generation += 1;
        let generation = bus.next_generation;
        bus.devices.insert(
            index,
            Plugged {
                spec,
                generation,
                pending: VecDeque::new(),
                broken: false,
            },
        );
    }

    pub fn unplug(&self, index: usize) {
        lock(&self.bus).devices.remove(&index);
    }

    /// Change the name the device reports, keeping open handles valid
    pub fn rename(&self, index: usize, name: &str) {
        if let Some(device) = lock(&self.bus).devices.get_mut(&index) {
            device.spec.name = name.to_string();
        }
    }

    /// Queue a key record on the device at `index`
    pub fn push_key(&self, index: usize, code: u16, value: i32) {
        self.push(index, RawRecord::key(code, value));
    }

    pub fn push(&self, index: usize, record: RawRecord) {
        if let Some(device) = lock(&self.bus).devices.get_mut(&index) {
            device.pending.push_back(record);
        }
    }

    /// Make every further read from `index` fail
    pub fn break_device(&self, index: usize) {
        if let Some(device) = lock(&self.bus).devices.get_mut(&index) {
            device.broken = true;
        }
    }

    /// Make the readiness wait fail (or succeed again)
    pub fn fail_wait(&self, fail: bool) {
        lock(&self.bus).fail_wait = fail;
    }

    /// How many times the node at `index` has been opened
    pub fn open_count(&self, index: usize) -> usize {
        lock(&self.bus).opens.get(&index).copied().unwrap_or(0)
    }

    pub fn pending(&self, index: usize) -> usize {
        lock(&self.bus)
            .devices
            .get(&index)
            .map_or(0, |d| d.pending.len())
    }
}

/// Open handle on a virtual node
#[derive(Debug)]
pub struct VirtualNode {
    bus: Arc<Mutex<Bus>>,
    index: usize,
    generation: u64,
}

impl VirtualNode {
    fn with_device<T>(&self, f: impl FnOnce(&mut Plugged) -> io::Result<T>) -> io::Result<T> {
        let mut bus = lock(&self.bus);
        match bus.devices.get_mut(&self.index) {
            Some(device) if device.generation == self.generation => f(device),
            _ => Err(gone()),
        }
    }
}

impl InputNode for VirtualNode {
    fn identity(&self) -> io::Result<HardwareId> {
        // Answers for whatever sits at the index now, so a replug shows up
        // as an identity mismatch on the old handle.
        let bus = lock(&self.bus);
        bus.devices
            .get(&self.index)
            .map(|d| d.spec.id)
            .ok_or_else(gone)
    }

    fn name(&self) -> io::Result<String> {
        let bus = lock(&self.bus);
        bus.devices
            .get(&self.index)
            .map(|d| d.spec.name.clone())
            .ok_or_else(gone)
    }

    fn has_key(&self, code: u16) -> io::Result<bool> {
        self.with_device(|d| Ok(d.spec.keys.contains(&code)))
    }

    fn read_records(&mut self, max: usize) -> io::Result<Vec<RawRecord>> {
        self.with_device(|d| {
            if d.broken {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            let take = d.pending.len().min(max);
            Ok(d.pending.drain(..take).collect())
        })
    }
}

impl InputBackend for VirtualBackend {
    type Node = VirtualNode;

    fn node_path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!("virtual://event{index}"))
    }

    fn is_accessible(&self, index: usize) -> bool {
        lock(&self.bus).devices.contains_key(&index)
    }

    fn open(&self, index: usize) -> io::Result<Self::Node> {
        let mut bus = lock(&self.bus);
        *bus.opens.entry(index).or_default() += 1;
        let generation = bus
            .devices
            .get(&index)
            .map(|d| d.generation)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        Ok(VirtualNode {
            bus: self.bus.clone(),
            index,
            generation,
        })
    }

    fn wait_readable(
        &self,
        nodes: &[(usize, &Self::Node)],
        _timeout: Duration,
    ) -> io::Result<Vec<usize>> {
        let bus = lock(&self.bus);
        if bus.fail_wait {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(nodes
            .iter()
            .filter(|(_, node)| match bus.devices.get(&node.index) {
                // Vanished and broken nodes poll readable, like a hung-up fd.
                Some(d) if d.generation == node.generation => !d.pending.is_empty() || d.broken,
                _ => true,
            })
            .map(|(slot, _)| *slot)
            .collect())
    }
}
