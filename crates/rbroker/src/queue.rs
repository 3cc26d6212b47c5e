//! FIFO buffer of admitted tasks waiting for a free session.

use std::collections::VecDeque;

use crate::task::TaskId;

/// Anything the queue can hold; the id is used for cancellation.
pub(crate) trait QueueEntry {
    fn task_id(&self) -> TaskId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue full (capacity {capacity})")]
pub(crate) struct QueueFull {
    pub capacity: usize,
}

/// Ordered buffer with optional capacity.
///
/// Not synchronized; the dispatcher owns it behind its admission lock, which
/// is the single ordering point for concurrent submitters.
pub(crate) struct TaskQueue<T> {
    entries: VecDeque<T>,
    capacity: Option<usize>,
}

impl<T: QueueEntry> TaskQueue<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.unwrap_or(0).min(1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append to the tail, or hand the entry back when full.
    pub fn push(&mut self, entry: T) -> Result<(), (T, QueueFull)> {
        if let Some(capacity) = self.capacity
            && self.entries.len() >= capacity
        {
            return Err((entry, QueueFull { capacity }));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    /// Remove one entry by id, keeping the relative order of the rest.
    pub fn remove(&mut self, id: &TaskId) -> Option<T> {
        let position = self.entries.iter().position(|e| e.task_id() == *id)?;
        self.entries.remove(position)
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }
}
