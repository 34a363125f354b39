//! Earliest-deadline timer registry. One deadline per action; registering a
//! new deadline for an action that already has one replaces it (§4.5).

use crate::types::Timestamp;
use std::collections::BTreeMap;
use std::time::Duration;

/// Tracks one deadline per action, kept sorted by `(deadline, action)` so the
/// next wakeup and the batch of due actions are both cheap to compute.
#[derive(Debug, Default)]
pub struct TimerSet {
    by_deadline: BTreeMap<(Timestamp, String), ()>,
    by_action: BTreeMap<String, Timestamp>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` to fire at `deadline`, replacing any existing entry.
    pub fn register_at(&mut self, action: &str, deadline: Timestamp) {
        self.deregister(action);
        self.by_deadline.insert((deadline, action.to_string()), ());
        self.by_action.insert(action.to_string(), deadline);
    }

    /// Cancels `action`'s deadline, if any.
    pub fn deregister(&mut self, action: &str) {
        if let Some(deadline) = self.by_action.remove(action) {
            self.by_deadline.remove(&(deadline, action.to_string()));
        }
    }

    pub fn deadline_of(&self, action: &str) -> Option<Timestamp> {
        self.by_action.get(action).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    /// The earliest registered deadline, if any.
    pub fn earliest(&self) -> Option<Timestamp> {
        self.by_deadline.keys().next().map(|(d, _)| *d)
    }

    /// Duration to sleep until the next deadline, relative to `now`. Returns
    /// `None` when nothing is registered; a past deadline yields `Duration::ZERO`
    /// so the caller fires immediately rather than sleeping negative time.
    pub fn next_wait(&self, now: Timestamp) -> Option<Duration> {
        self.earliest().map(|deadline| {
            if deadline <= now {
                Duration::ZERO
            } else {
                Duration::from_secs((deadline - now) as u64)
            }
        })
    }

    /// Removes and returns every action whose deadline is `<= now`, in deadline
    /// order (ties broken by action name for determinism).
    pub fn fire_due(&mut self, now: Timestamp) -> Vec<String> {
        let due: Vec<(Timestamp, String)> = self
            .by_deadline
            .keys()
            .filter(|(d, _)| *d <= now)
            .cloned()
            .collect();
        let mut actions = Vec::with_capacity(due.len());
        for (deadline, action) in due {
            self.by_deadline.remove(&(deadline, action.clone()));
            self.by_action.remove(&action);
            actions.push(action);
        }
        actions
    }
}
