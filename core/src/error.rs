//! Error taxonomy for the bridge
//!
//! Structural errors (`InvalidState`, `NotFound`, `InvalidCommand`, `QueueFull`,
//! `AlreadyScanning`) are returned synchronously when a command is rejected.
//! Radio and timing errors are delivered asynchronously through the pending
//! handle of the command they belong to, or through the notification stream.

use crate::config::ConfigError;
use crate::types::{GattOpKind, GattStatus, PeripheralId, ScanSessionId};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to the host application.
///
/// `Clone` because coalesced callers (two connects to the same device, for
/// instance) share a single outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Invalid state for {operation}: {detail}")]
    InvalidState {
        operation: &'static str,
        detail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connect to {id} failed: {reason}")]
    ConnectFailure { id: PeripheralId, reason: String },

    #[error("Service discovery on {id} failed: {reason}")]
    DiscoveryFailure { id: PeripheralId, reason: String },

    #[error("{kind} on {id} (characteristic {characteristic}) timed out")]
    OperationTimeout {
        id: PeripheralId,
        kind: GattOpKind,
        characteristic: Uuid,
    },

    #[error("Link to {id} lost")]
    LinkLost { id: PeripheralId },

    #[error("Operation queue for {id} is full ({capacity} pending)")]
    QueueFull { id: PeripheralId, capacity: usize },

    #[error("Scan session {0} is already active")]
    AlreadyScanning(ScanSessionId),

    #[error("{kind} on {id} (characteristic {characteristic}) failed with GATT status {status}")]
    OperationFailed {
        id: PeripheralId,
        kind: GattOpKind,
        characteristic: Uuid,
        status: GattStatus,
    },

    #[error("Radio refused request: {0}")]
    Radio(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bridge closed")]
    Closed,
}

impl BridgeError {
    /// Device the error refers to, when there is one
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            BridgeError::ConnectFailure { id, .. }
            | BridgeError::DiscoveryFailure { id, .. }
            | BridgeError::OperationTimeout { id, .. }
            | BridgeError::LinkLost { id }
            | BridgeError::QueueFull { id, .. }
            | BridgeError::OperationFailed { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Whether the failure came from the radio path rather than from a
    /// rejected command. Callers decide on retry based on this.
    pub fn is_radio_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectFailure { .. }
                | BridgeError::DiscoveryFailure { .. }
                | BridgeError::OperationTimeout { .. }
                | BridgeError::LinkLost { .. }
                | BridgeError::OperationFailed { .. }
                | BridgeError::Radio(_)
        )
    }
}

/// Errors returned by a [`RadioAdapter`](crate::radio::RadioAdapter) when it
/// refuses to issue a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Bluetooth adapter unavailable")]
    Unavailable,
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralId),
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl From<RadioError> for BridgeError {
    fn from(err: RadioError) -> Self {
        BridgeError::Radio(err.to_string())
    }
}
