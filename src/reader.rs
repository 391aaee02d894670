//! Evdev event reader
//!
//! Multiplexed, non-blocking read over every registered device. Key-down
//! records are normalized through the key table and pushed to the queue.

use crate::device::{
    DeviceRegistry, EV_KEY, InputBackend, InputNode, KEY_AUTOREPEAT, KEY_DOWN, RawRecord,
};
use crate::event::LogicalEvent;
use crate::keymap::KeyTable;
use crate::queue::EventQueue;
use std::io;
use std::time::Duration;
use tracing::{debug, trace};

/// How long one read cycle waits for any device to become readable
pub const READ_WAIT: Duration = Duration::from_micros(100);

/// Records read from one device per cycle
pub const MAX_RECORDS_PER_READ: usize = 64;

/// Normalize one raw record. Only key-down transitions produce events.
pub fn decode_record(record: &RawRecord, table: &KeyTable) -> Option<LogicalEvent> {
    if record.kind != EV_KEY {
        return None;
    }
    match record.value {
        KEY_DOWN => table.resolve(record.code),
        KEY_AUTOREPEAT => {
            trace!("Autorepeat key {}", record.code);
            None
        }
        _ => None,
    }
}

/// Run one read cycle over the registry.
///
/// Returns the number of events queued. A failed readiness wait is returned
/// as is; a failed read evicts that device and returns its error without
/// visiting the remaining devices.
pub fn read_devices<B: InputBackend>(
    registry: &mut DeviceRegistry<B>,
    table: &KeyTable,
    queue: &EventQueue,
) -> io::Result<usize> {
    let ready = registry.wait_readable(READ_WAIT)?;

    let mut queued = 0;
    for index in ready {
        let Some(node) = registry.node_mut(index) else {
            continue;
        };
        let records = match node.read_records(MAX_RECORDS_PER_READ) {
            Ok(records) => records,
            Err(e) => {
                debug!("Read from input device index {} failed: {}", index, e);
                registry.evict(index);
                return Err(e);
            }
        };

        for event in records.iter().filter_map(|r| decode_record(r, table)) {
            queue.enqueue(event);
            queued += 1;
        }
    }
    Ok(queued)
}
