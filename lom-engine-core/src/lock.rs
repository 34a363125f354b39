//! Mutual-exclusion lock for anomaly mitigation. At most one anomaly holds
//! the lock at a time; others queue FIFO and are drained in arrival order as
//! the holder releases (§4.6, §4.6.2).

use crate::types::Timestamp;
use std::collections::VecDeque;

/// Result of an acquire attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// Caller now holds the lock.
    Acquired,
    /// Lock is held by someone else; caller was appended to the pending queue.
    Queued,
}

#[derive(Debug, Default)]
pub struct LockManager {
    holder: Option<String>,
    /// `0` means no expiry was set; advisory only, never auto-released (§4.6.2).
    expires_at: Timestamp,
    pending: VecDeque<String>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<&str> {
        self.holder.as_deref()
    }

    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    pub fn is_pending(&self, instance_id: &str) -> bool {
        self.pending.iter().any(|p| p == instance_id)
    }

    /// Attempts to acquire on behalf of `instance_id`. If the lock is free,
    /// takes it immediately and stamps `expires_at` (`0` for no expiry). If
    /// held, appends to the pending queue unless already queued.
    pub fn acquire(&mut self, instance_id: &str, expires_at: Timestamp) -> LockOutcome {
        if self.holder.is_none() {
            self.cancel_pending(instance_id);
            self.holder = Some(instance_id.to_string());
            self.expires_at = expires_at;
            return LockOutcome::Acquired;
        }
        if self.holder.as_deref() != Some(instance_id) && !self.is_pending(instance_id) {
            self.pending.push_back(instance_id.to_string());
        }
        LockOutcome::Queued
    }

    /// Releases the lock if held by `instance_id`, clearing the holder. The
    /// pending queue is left untouched: promoting the next holder is the
    /// caller's job, via [`LockManager::peek_pending`] and
    /// [`LockManager::acquire`] (see the main loop's `drain_pending_locks`).
    pub fn release(&mut self, instance_id: &str) {
        if self.holder.as_deref() != Some(instance_id) {
            return;
        }
        self.holder = None;
        self.expires_at = 0;
    }

    /// Removes `instance_id` from the pending queue without affecting the
    /// current holder. Used when a queued mitigation is abandoned.
    pub fn cancel_pending(&mut self, instance_id: &str) {
        self.pending.retain(|p| p != instance_id);
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The head of the pending queue, without removing it.
    pub fn peek_pending(&self) -> Option<String> {
        self.pending.front().cloned()
    }
}
