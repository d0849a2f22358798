/// Shared identifiers and value types
///
/// Everything here is plain data: identifiers, GATT addressing, scan filters and
/// the notifications pushed to the host application.

use crate::error::BridgeError;
use crate::registry::Peripheral;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Bluetooth base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// ATT MTU every link starts with before negotiation
pub const DEFAULT_ATT_MTU: u16 = 23;

/// ATT header bytes subtracted from the MTU for a single write
pub const ATT_WRITE_OVERHEAD: u16 = 3;

/// Maximum length of an attribute value (protocol limitation)
pub const MAX_ATTRIBUTE_SIZE: usize = 512;

/// Expand a 16-bit or 32-bit assigned number into a full UUID.
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Stable identifier of a peripheral across scan sessions.
///
/// Platforms hand out either a MAC address (Android) or an opaque UUID (iOS);
/// both compare case-insensitively, so the identifier is stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Identity of one scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanSessionId(pub u64);

impl fmt::Display for ScanSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan#{}", self.0)
    }
}

/// Identity of one queued GATT operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A characteristic addressed by its service and its own UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GattTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl GattTarget {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for GattTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// GATT status code as reported by the platform (0 = success)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    /// `Ok(())` for success, `Err(self)` otherwise
    pub fn into_result(self) -> Result<(), GattStatus> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Kind of GATT operation, used for matching hardware results and in errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattOpKind {
    Read,
    Write,
    WriteWithoutResponse,
    Subscribe,
    Unsubscribe,
    ReadDescriptor,
    WriteDescriptor,
}

impl GattOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GattOpKind::Read => "Read",
            GattOpKind::Write => "Write",
            GattOpKind::WriteWithoutResponse => "WriteWithoutResponse",
            GattOpKind::Subscribe => "Subscribe",
            GattOpKind::Unsubscribe => "Unsubscribe",
            GattOpKind::ReadDescriptor => "ReadDescriptor",
            GattOpKind::WriteDescriptor => "WriteDescriptor",
        }
    }
}

impl fmt::Display for GattOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Successful GATT outcome: bytes for reads, nothing for writes and toggles
pub type GattValue = Option<Vec<u8>>;

/// How repeat advertisements are reported during a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Report each identifier at most once per session
    #[default]
    FirstSeenOnly,
    /// Forward every advertisement with its updated signal strength
    All,
}

/// Allow-lists applied to advertisements. Empty lists accept everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Advertised service UUIDs (or service data keys) to accept
    pub services: Vec<Uuid>,
    /// Manufacturer company identifiers to accept
    pub company_ids: Vec<u16>,
}

impl ScanFilter {
    pub fn services(services: Vec<Uuid>) -> Self {
        Self {
            services,
            company_ids: Vec::new(),
        }
    }

    pub fn company_ids(company_ids: Vec<u16>) -> Self {
        Self {
            services: Vec::new(),
            company_ids,
        }
    }

    pub fn matches(&self, peripheral: &Peripheral) -> bool {
        let service_ok = self.services.is_empty()
            || self.services.iter().any(|uuid| {
                peripheral.service_uuids.contains(uuid) || peripheral.service_data.contains_key(uuid)
            });
        let company_ok = self.company_ids.is_empty()
            || self
                .company_ids
                .iter()
                .any(|company| peripheral.manufacturer_data.contains_key(company));
        service_ok && company_ok
    }
}

/// Parameters of a scan-start command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    pub filter: ScanFilter,
    /// Falls back to the configured default when `None`
    pub duplicate_policy: Option<DuplicatePolicy>,
    /// Session auto-stops after this long when set
    pub duration: Option<Duration>,
}

impl ScanRequest {
    pub fn with_filter(mut self, filter: ScanFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = Some(policy);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// One normalized advertisement report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub service_uuids: Vec<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl Advertisement {
    pub fn new(id: PeripheralId, rssi: i16) -> Self {
        Self {
            id,
            local_name: None,
            rssi,
            service_uuids: Vec::new(),
            service_data: BTreeMap::new(),
            manufacturer_data: BTreeMap::new(),
        }
    }
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

/// A service found during service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Service UUID → characteristics in discovery order
pub type ServiceMap = BTreeMap<Uuid, Vec<DiscoveredCharacteristic>>;

/// What a successful connect resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: PeripheralId,
    pub mtu: u16,
    pub services: ServiceMap,
}

/// Externally visible lifecycle phase of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    Disconnecting,
}

impl ConnectionPhase {
    pub fn is_terminal(&self) -> bool {
        *self == ConnectionPhase::Disconnected
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionPhase::Disconnected => write!(f, "disconnected"),
            ConnectionPhase::Connecting => write!(f, "connecting"),
            ConnectionPhase::Connected => write!(f, "connected"),
            ConnectionPhase::DiscoveringServices => write!(f, "discovering_services"),
            ConnectionPhase::Ready => write!(f, "ready"),
            ConnectionPhase::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Why a scan session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStopReason {
    Requested,
    DeadlineReached,
    /// Platform scan failure with its error code
    Failed(i32),
    AdapterOff,
    Shutdown,
}

/// Unsolicited events pushed to the host application
#[derive(Debug, Clone)]
pub enum Notification {
    /// An advertisement passed the active session's filter and duplicate policy
    DeviceDiscovered {
        session: ScanSessionId,
        peripheral: Peripheral,
    },
    ScanStopped {
        session: ScanSessionId,
        reason: ScanStopReason,
    },
    ConnectionStateChanged {
        id: PeripheralId,
        phase: ConnectionPhase,
    },
    /// Value pushed by the peripheral on a subscribed characteristic
    ValueChanged {
        id: PeripheralId,
        target: GattTarget,
        value: Vec<u8>,
    },
    MtuChanged {
        id: PeripheralId,
        mtu: u16,
    },
    /// The link dropped without the application asking for it
    UnexpectedDisconnect {
        id: PeripheralId,
        error: BridgeError,
    },
    AdapterStateChanged {
        powered_on: bool,
    },
}
