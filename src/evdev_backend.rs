//! Linux evdev backend (`/dev/input/eventN`)

use crate::device::{HardwareId, InputBackend, InputNode, RawRecord};
use evdev::{AttributeSet, Key};
use nix::unistd::{AccessFlags, access};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::Duration;
use tracing::trace;

/// Default node prefix; the slot index is appended
pub const DEFAULT_NODE_PREFIX: &str = "/dev/input/event";

/// Upper bound on the key bitmap (KEY_MAX = 0x2ff)
const KEY_BITMAP_LEN: usize = 0x300 / 8;

/// Buffer for EVIOCGNAME; one byte is left for the terminator
const NAME_BUF_LEN: usize = 256;

nix::ioctl_read!(eviocgid, b'E', 0x02, libc::input_id);
nix::ioctl_read_buf!(eviocgname, b'E', 0x06, u8);
nix::ioctl_read_buf!(eviocgbit_key, b'E', 0x21, u8);

/// Backend over real evdev nodes
#[derive(Debug, Clone)]
pub struct EvdevBackend {
    prefix: String,
}

impl EvdevBackend {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_NODE_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EvdevBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// An open evdev node
pub struct EvdevNode {
    file: File,
    keys: AttributeSet<Key>,
    path: PathBuf,
}

impl std::fmt::Debug for EvdevNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvdevNode")
            .field("path", &self.path)
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

impl EvdevNode {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Preserve existing flags; just OR in O_NONBLOCK.
    let current = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if current < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, current | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open a node for reading only; input nodes are never written to
fn open_read_only(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

/// Whether bit `code` is set in an EVIOCGBIT bitmap
fn bitmap_has(bits: &[u8], code: u16) -> bool {
    let code = usize::from(code);
    bits.get(code / 8).is_some_and(|b| b & (1 << (code % 8)) != 0)
}

fn key_set(bits: &[u8]) -> AttributeSet<Key> {
    (0..(bits.len() * 8) as u16)
        .filter(|&code| bitmap_has(bits, code))
        .map(Key::new)
        .collect()
}

/// Key capabilities of an open node
fn supported_keys(fd: RawFd) -> io::Result<AttributeSet<Key>> {
    let mut bits = [0u8; KEY_BITMAP_LEN];
    unsafe { eviocgbit_key(fd, &mut bits) }.map_err(io::Error::from)?;
    Ok(key_set(&bits))
}

impl InputNode for EvdevNode {
    fn identity(&self) -> io::Result<HardwareId> {
        let mut id: libc::input_id = unsafe { mem::zeroed() };
        unsafe { eviocgid(self.fd(), &mut id) }.map_err(io::Error::from)?;
        Ok(HardwareId::new(id.bustype, id.vendor, id.product, id.version))
    }

    fn name(&self) -> io::Result<String> {
        let mut buf = [0u8; NAME_BUF_LEN];
        unsafe { eviocgname(self.fd(), &mut buf[..NAME_BUF_LEN - 1]) }.map_err(io::Error::from)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    fn has_key(&self, code: u16) -> io::Result<bool> {
        Ok(usize::from(code) < KEY_BITMAP_LEN * 8 && self.keys.contains(Key::new(code)))
    }

    fn read_records(&mut self, max: usize) -> io::Result<Vec<RawRecord>> {
        let record_len = mem::size_of::<libc::input_event>();
        let mut buf: Vec<libc::input_event> = vec![unsafe { mem::zeroed() }; max];
        let rc = unsafe {
            libc::read(
                self.fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                record_len * max,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(Vec::new()),
                _ => Err(err),
            };
        }

        let count = rc as usize / record_len;
        trace!("Read {} record(s) from {:?}", count, self.path);
        Ok(buf[..count]
            .iter()
            .map(|ev| RawRecord {
                kind: ev.type_,
                code: ev.code,
                value: ev.value,
            })
            .collect())
    }
}

impl InputBackend for EvdevBackend {
    type Node = EvdevNode;

    fn node_path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, index))
    }

    fn is_accessible(&self, index: usize) -> bool {
        access(&self.node_path(index), AccessFlags::R_OK).is_ok()
    }

    fn open(&self, index: usize) -> io::Result<Self::Node> {
        let path = self.node_path(index);
        let file = open_read_only(&path)?;
        set_nonblocking(file.as_raw_fd())?;
        let keys = supported_keys(file.as_raw_fd())?;
        Ok(EvdevNode { file, keys, path })
    }

    fn wait_readable(
        &self,
        nodes: &[(usize, &Self::Node)],
        timeout: Duration,
    ) -> io::Result<Vec<usize>> {
        let watched: Vec<(usize, RawFd)> = nodes
            .iter()
            .map(|(slot, node)| (*slot, node.fd()))
            .filter(|(_, fd)| (0..libc::FD_SETSIZE as RawFd).contains(fd))
            .collect();
        let Some(max_fd) = watched.iter().map(|(_, fd)| *fd).max() else {
            return Ok(Vec::new());
        };

        let mut readset: libc::fd_set = unsafe { mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut readset) };
        for (_, fd) in &watched {
            unsafe { libc::FD_SET(*fd, &mut readset) };
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::select(
                max_fd + 1,
                &mut readset,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut tv,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            return Ok(Vec::new());
        }

        Ok(watched
            .into_iter()
            .filter(|(_, fd)| unsafe { libc::FD_ISSET(*fd, &readset) })
            .map(|(slot, _)| slot)
            .collect())
    }
}
