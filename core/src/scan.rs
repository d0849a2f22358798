/// Scan coordinator
///
/// Owns the lifecycle of the (single) discovery session: start, stop, deadline,
/// and the per-session duplicate filter applied to advertisements.

use crate::error::BridgeError;
use crate::registry::Peripheral;
use crate::types::{DuplicatePolicy, PeripheralId, ScanFilter, ScanRequest, ScanSessionId};
use std::collections::HashSet;
use tokio::time::Instant;

/// An active discovery window
#[derive(Debug, Clone)]
pub struct ScanSession {
    pub id: ScanSessionId,
    pub filter: ScanFilter,
    pub duplicate_policy: DuplicatePolicy,
    pub started_at: Instant,
    pub deadline: Option<Instant>,
    seen: HashSet<PeripheralId>,
    reported: u64,
}

impl ScanSession {
    /// Number of discovery notifications produced so far
    pub fn reported(&self) -> u64 {
        self.reported
    }

    /// Distinct identifiers reported in this session
    pub fn distinct_devices(&self) -> usize {
        self.seen.len()
    }
}

pub struct ScanCoordinator {
    active: Option<ScanSession>,
    next_id: u64,
    default_policy: DuplicatePolicy,
}

impl ScanCoordinator {
    pub fn new(default_policy: DuplicatePolicy) -> Self {
        Self {
            active: None,
            next_id: 1,
            default_policy,
        }
    }

    /// Open a session. Only one session is modeled; a second start is rejected,
    /// never merged.
    pub fn start(&mut self, request: ScanRequest, now: Instant) -> Result<&ScanSession, BridgeError> {
        if let Some(active) = &self.active {
            return Err(BridgeError::AlreadyScanning(active.id));
        }
        let deadline = match request.duration {
            Some(d) if d.is_zero() => {
                return Err(BridgeError::InvalidCommand(
                    "scan duration must be > 0".to_string(),
                ))
            }
            Some(d) => Some(now.checked_add(d).ok_or_else(|| {
                BridgeError::InvalidCommand(format!("scan duration {:?} is too long", d))
            })?),
            None => None,
        };

        let id = ScanSessionId(self.next_id);
        self.next_id += 1;

        let session = ScanSession {
            id,
            filter: request.filter,
            duplicate_policy: request.duplicate_policy.unwrap_or(self.default_policy),
            started_at: now,
            deadline,
            seen: HashSet::new(),
            reported: 0,
        };
        Ok(self.active.insert(session))
    }

    /// Stop the session the caller owns
    pub fn stop(&mut self, session: ScanSessionId) -> Result<ScanSession, BridgeError> {
        match self.active.take() {
            Some(active) if active.id == session => Ok(active),
            other => {
                self.active = other;
                Err(BridgeError::NotFound(format!("scan session {}", session)))
            }
        }
    }

    /// End whatever session is active (deadline, platform failure, shutdown)
    pub fn end(&mut self) -> Option<ScanSession> {
        self.active.take()
    }

    pub fn active(&self) -> Option<&ScanSession> {
        self.active.as_ref()
    }

    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    /// Decide whether a (merged) peripheral record should be reported to the
    /// application for the active session.
    pub fn admit(&mut self, peripheral: &Peripheral) -> Option<ScanSessionId> {
        let session = self.active.as_mut()?;
        if !session.filter.matches(peripheral) {
            return None;
        }
        let first_time = session.seen.insert(peripheral.id.clone());
        if !first_time && session.duplicate_policy == DuplicatePolicy::FirstSeenOnly {
            return None;
        }
        session.reported += 1;
        Some(session.id)
    }
}
