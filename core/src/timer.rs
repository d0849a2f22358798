/// Cancellable deadlines keyed by operation or session identity
///
/// The event loop asks for the earliest deadline, sleeps until it, and hands
/// the expired keys back to the dispatcher. Cancelling is just removing the key,
/// so a timer that was cancelled can never fire late.

use crate::types::{OperationId, PeripheralId, ScanSessionId};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Connect(PeripheralId),
    Discovery(PeripheralId),
    Disconnect(PeripheralId),
    Operation(PeripheralId, OperationId),
    ScanDeadline(ScanSessionId),
}

#[derive(Debug, Default)]
pub struct Timers {
    // (deadline, arm sequence) keeps expiry order stable for equal deadlines
    by_deadline: BTreeMap<(Instant, u64), TimerKey>,
    by_key: HashMap<TimerKey, (Instant, u64)>,
    seq: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key`, replacing any deadline it already had
    pub fn arm(&mut self, key: TimerKey, deadline: Instant) {
        self.cancel(&key);
        self.seq += 1;
        let slot = (deadline, self.seq);
        self.by_deadline.insert(slot, key.clone());
        self.by_key.insert(key, slot);
    }

    /// Arm `key` to fire `after` from `now`. A deadline past the end of the
    /// clock is never reached, so the key is left unarmed.
    pub fn arm_after(&mut self, key: TimerKey, now: Instant, after: Duration) -> bool {
        match now.checked_add(after) {
            Some(deadline) => {
                self.arm(key, deadline);
                true
            }
            None => {
                warn!("Not arming {:?}: {:?} overflows the clock", key, after);
                self.cancel(&key);
                false
            }
        }
    }

    /// Returns whether the key was armed
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.by_key.remove(key) {
            Some(slot) => {
                self.by_deadline.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Cancel every timer belonging to one peripheral
    pub fn cancel_peripheral(&mut self, id: &PeripheralId) {
        let keys: Vec<TimerKey> = self
            .by_key
            .keys()
            .filter(|key| match key {
                TimerKey::Connect(p)
                | TimerKey::Discovery(p)
                | TimerKey::Disconnect(p)
                | TimerKey::Operation(p, _) => p == id,
                TimerKey::ScanDeadline(_) => false,
            })
            .cloned()
            .collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first
    pub fn expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut fired = Vec::new();
        loop {
            let slot = match self.by_deadline.keys().next() {
                Some(&slot) if slot.0 <= now => slot,
                _ => break,
            };
            if let Some(key) = self.by_deadline.remove(&slot) {
                self.by_key.remove(&key);
                fired.push(key);
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.by_key.clear();
    }
}
