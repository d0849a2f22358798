/// Per-device GATT operation queue
///
/// Strict FIFO with exactly one operation in flight. Only the head is ever
/// handed to the radio, so a hardware result either matches the head or is a
/// stray; queued entries are never resolved out of order. Also tracks the
/// standing notification subscriptions of the device.

use crate::error::BridgeError;
use crate::pending::Responder;
use crate::types::{GattOpKind, GattTarget, GattValue, OperationId, PeripheralId};
use std::collections::{BTreeSet, VecDeque};
use tokio::time::Instant;
use uuid::Uuid;

/// What to do on the target characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    Read,
    Write { value: Vec<u8>, with_response: bool },
    SetNotify { enable: bool },
    ReadDescriptor { descriptor: Uuid },
    WriteDescriptor { descriptor: Uuid, value: Vec<u8> },
}

impl GattRequest {
    pub fn kind(&self) -> GattOpKind {
        match self {
            GattRequest::Read => GattOpKind::Read,
            GattRequest::Write {
                with_response: true,
                ..
            } => GattOpKind::Write,
            GattRequest::Write {
                with_response: false,
                ..
            } => GattOpKind::WriteWithoutResponse,
            GattRequest::SetNotify { enable: true } => GattOpKind::Subscribe,
            GattRequest::SetNotify { enable: false } => GattOpKind::Unsubscribe,
            GattRequest::ReadDescriptor { .. } => GattOpKind::ReadDescriptor,
            GattRequest::WriteDescriptor { .. } => GattOpKind::WriteDescriptor,
        }
    }

    pub fn descriptor(&self) -> Option<Uuid> {
        match self {
            GattRequest::ReadDescriptor { descriptor }
            | GattRequest::WriteDescriptor { descriptor, .. } => Some(*descriptor),
            _ => None,
        }
    }

    /// Write payload, if any
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            GattRequest::Write { value, .. } | GattRequest::WriteDescriptor { value, .. } => {
                Some(value.as_slice())
            }
            _ => None,
        }
    }
}

/// Identity a hardware result is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionKey {
    pub target: GattTarget,
    pub descriptor: Option<Uuid>,
    pub kind: GattOpKind,
}

impl CompletionKey {
    pub fn characteristic(target: GattTarget, kind: GattOpKind) -> Self {
        Self {
            target,
            descriptor: None,
            kind,
        }
    }

    pub fn descriptor(target: GattTarget, descriptor: Uuid, kind: GattOpKind) -> Self {
        Self {
            target,
            descriptor: Some(descriptor),
            kind,
        }
    }
}

/// An accepted request waiting for (or holding) the radio
#[derive(Debug)]
pub struct GattOperation {
    pub id: OperationId,
    pub target: GattTarget,
    pub request: GattRequest,
    pub enqueued_at: Instant,
    responder: Responder<GattValue>,
}

impl GattOperation {
    pub fn new(
        id: OperationId,
        target: GattTarget,
        request: GattRequest,
        responder: Responder<GattValue>,
        enqueued_at: Instant,
    ) -> Self {
        Self {
            id,
            target,
            request,
            enqueued_at,
            responder,
        }
    }

    pub fn kind(&self) -> GattOpKind {
        self.request.kind()
    }

    pub fn completion_key(&self) -> CompletionKey {
        CompletionKey {
            target: self.target,
            descriptor: self.request.descriptor(),
            kind: self.kind(),
        }
    }

    /// Deliver the terminal outcome and destroy the operation
    pub fn resolve(self, result: Result<GattValue, BridgeError>) {
        self.responder.resolve(result);
    }
}

pub struct OperationQueue {
    id: PeripheralId,
    pending: VecDeque<GattOperation>,
    in_flight: Option<GattOperation>,
    capacity: usize,
    subscriptions: BTreeSet<GattTarget>,
}

impl OperationQueue {
    pub fn new(id: PeripheralId, capacity: usize) -> Self {
        Self {
            id,
            pending: VecDeque::new(),
            in_flight: None,
            capacity: capacity.max(1),
            subscriptions: BTreeSet::new(),
        }
    }

    /// In flight plus queued
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Append to the tail. The operation is dropped (and its handle closed)
    /// when the bound is reached.
    pub fn enqueue(&mut self, op: GattOperation) -> Result<(), BridgeError> {
        if self.is_full() {
            return Err(BridgeError::QueueFull {
                id: self.id.clone(),
                capacity: self.capacity,
            });
        }
        self.pending.push_back(op);
        Ok(())
    }

    pub fn in_flight(&self) -> Option<&GattOperation> {
        self.in_flight.as_ref()
    }

    /// Promote the next queued operation when nothing is in flight
    pub fn start_next(&mut self) -> Option<&GattOperation> {
        if self.in_flight.is_none() {
            self.in_flight = self.pending.pop_front();
            return self.in_flight.as_ref();
        }
        None
    }

    /// Take the in-flight operation if `key` identifies it
    pub fn complete(&mut self, key: &CompletionKey) -> Option<GattOperation> {
        match &self.in_flight {
            Some(op) if op.completion_key() == *key => self.in_flight.take(),
            _ => None,
        }
    }

    /// Take the in-flight operation by id (timeouts, radio refusals)
    pub fn take_in_flight(&mut self, op_id: OperationId) -> Option<GattOperation> {
        match &self.in_flight {
            Some(op) if op.id == op_id => self.in_flight.take(),
            _ => None,
        }
    }

    /// Remove everything, in enqueue order
    pub fn drain(&mut self) -> Vec<GattOperation> {
        let mut all = Vec::with_capacity(self.len());
        all.extend(self.in_flight.take());
        all.extend(self.pending.drain(..));
        all
    }

    pub fn subscribe(&mut self, target: GattTarget) -> bool {
        self.subscriptions.insert(target)
    }

    pub fn unsubscribe(&mut self, target: &GattTarget) -> bool {
        self.subscriptions.remove(target)
    }

    pub fn is_subscribed(&self, target: &GattTarget) -> bool {
        self.subscriptions.contains(target)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &GattTarget> {
        self.subscriptions.iter()
    }

    pub fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }
}
