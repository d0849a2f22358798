// BLE Bridge Core: central-role Bluetooth Low Energy bridge
#![allow(clippy::empty_line_after_doc_comments)]
//
// Turns a slow, lossy, callback-driven radio into an ordered command API:
// scan, connect, discover, read, write, subscribe. Everything runs on one
// serialized event loop; every command gets exactly one outcome.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod pending;
pub mod queue;
pub mod radio;
pub mod registry;
pub mod scan;
pub mod timer;
pub mod types;

// ============================================================================
// PUBLIC API
// ============================================================================

pub use bridge::{BleBridge, NotificationStream, RadioEventSink};
pub use config::{BridgeConfig, ConfigError, MAX_TIMEOUT_MS};
pub use connection::ConnectionStatus;
pub use error::{BridgeError, RadioError};
pub use pending::PendingHandle;
pub use radio::RadioAdapter;
pub use registry::Peripheral;

// ============================================================================
// PLATFORM BINDING TYPES
// ============================================================================

pub use event::{normalize, parse_uuid, NormalizeError, PlatformCallback, RawCharacteristic, RawService};

// ============================================================================
// VALUE TYPES
// ============================================================================

pub use types::{
    uuid_from_short, ConnectionInfo, ConnectionPhase, DiscoveredCharacteristic,
    DiscoveredService, DuplicatePolicy, GattOpKind, GattStatus, GattTarget, GattValue,
    Notification, OperationId, PeripheralId, ScanFilter, ScanRequest, ScanSessionId,
    ScanStopReason, ServiceMap, WriteType, DEFAULT_ATT_MTU, MAX_ATTRIBUTE_SIZE,
};

/// Crate version, as reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
