//! The per-subgroup outstanding-send record.
//!
//! Models the "one asynchronous parameter send in flight per subgroup"
//! constraint explicitly as a bounded queue of capacity one.
//! [`BoundedQueue`](crate::bounded_queue::BoundedQueue) already has the
//! right shape but silently evicts the oldest entry on overflow; here an
//! overflow means the cadence controller tried to start a second send
//! before the first was acknowledged, which is a bug in the controller, not
//! something to paper over. [`SendRecordSlot`] wraps the same one-slot queue
//! and turns that overflow into an [`Error::InternalInvariantViolation`].

use crate::bounded_queue::BoundedQueue;
use crate::error::{Error, Result};

/// Holds at most one outstanding send record for a subgroup.
pub struct SendRecordSlot<T> {
    queue: BoundedQueue<T, 1>,
}

impl<T> Default for SendRecordSlot<T> {
    fn default() -> Self {
        Self {
            queue: BoundedQueue::default(),
        }
    }
}

impl<T> SendRecordSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Records a newly-started send. Fails if a send record is already
    /// occupying the slot: the caller must drain it via [`Self::take`]
    /// (after waiting on the send) before starting another.
    pub fn occupy(&mut self, record: T) -> Result<()> {
        if !self.queue.is_empty() {
            return Err(Error::InternalInvariantViolation(
                "more than one outstanding send record for this subgroup".into(),
            ));
        }
        self.queue.push(record);
        Ok(())
    }

    /// Removes and returns the occupying record, if any.
    pub fn take(&mut self) -> Option<T> {
        std::mem::take(&mut self.queue).into_iter().next()
    }
}
