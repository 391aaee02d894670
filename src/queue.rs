//! Bounded event mailbox between the poll thread and the UI thread

use crate::event::LogicalEvent;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of slots; the queue holds at most one less
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Fixed-capacity FIFO that evicts the oldest entry on overflow.
///
/// Holds at most `capacity - 1` events. The newest event is always admitted.
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    events: Mutex<VecDeque<LogicalEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    /// Capacity is clamped to at least 2 so the queue can hold one event.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogicalEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, event: LogicalEvent) {
        let mut events = self.lock();
        if events.len() >= self.capacity - 1 {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn dequeue(&self) -> Option<LogicalEvent> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
