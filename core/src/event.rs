/// Event normalizer
///
/// Platform stacks report results as loosely typed callbacks: string
/// identifiers, string UUIDs (full or 16/32-bit short form) and integer GATT
/// status codes. This module turns them into [`HardwareEvent`]s with parsed
/// identifiers and `Result`-shaped outcomes. It holds no state and applies no
/// policy.

use crate::types::{
    uuid_from_short, Advertisement, DiscoveredCharacteristic, DiscoveredService, GattStatus,
    GattTarget, PeripheralId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
    #[error("Callback without peripheral identifier")]
    EmptyIdentifier,
}

/// Raw characteristic entry of a services-discovered callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCharacteristic {
    pub uuid: String,
    #[serde(default)]
    pub descriptors: Vec<String>,
}

/// Raw service entry of a services-discovered callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawService {
    pub uuid: String,
    #[serde(default)]
    pub characteristics: Vec<RawCharacteristic>,
}

/// Callbacks as a platform binding hands them over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformCallback {
    DeviceDiscovered {
        identifier: String,
        name: Option<String>,
        rssi: i16,
        #[serde(default)]
        service_uuids: Vec<String>,
        #[serde(default)]
        service_data: Vec<(String, Vec<u8>)>,
        #[serde(default)]
        manufacturer_data: Vec<(u16, Vec<u8>)>,
    },
    /// Android-style `onConnectionStateChange(status, newState)`
    ConnectionStateChanged {
        identifier: String,
        status: i32,
        connected: bool,
    },
    ServicesDiscovered {
        identifier: String,
        status: i32,
        #[serde(default)]
        services: Vec<RawService>,
    },
    CharacteristicRead {
        identifier: String,
        service: String,
        characteristic: String,
        status: i32,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        identifier: String,
        service: String,
        characteristic: String,
        value: Vec<u8>,
    },
    /// CoreBluetooth-style `didUpdateValueFor`, shared by reads and notifications
    ValueUpdated {
        identifier: String,
        service: String,
        characteristic: String,
        value: Vec<u8>,
        error: Option<i32>,
    },
    CharacteristicWrite {
        identifier: String,
        service: String,
        characteristic: String,
        status: i32,
    },
    NotificationStateChanged {
        identifier: String,
        service: String,
        characteristic: String,
        enabled: bool,
        status: i32,
    },
    DescriptorRead {
        identifier: String,
        service: String,
        characteristic: String,
        descriptor: String,
        status: i32,
        value: Vec<u8>,
    },
    DescriptorWrite {
        identifier: String,
        service: String,
        characteristic: String,
        descriptor: String,
        status: i32,
    },
    MtuChanged {
        identifier: String,
        mtu: u16,
        status: i32,
    },
    ScanFailed {
        error_code: i32,
    },
    AdapterStateChanged {
        powered_on: bool,
    },
}

/// Where a characteristic value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrigin {
    ReadResponse,
    Notification,
    /// Combined callback: a read response if a read is in flight, otherwise a
    /// notification
    Unspecified,
}

/// Uniform internal event consumed by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    Advertisement(Advertisement),
    /// Link came up (or the attempt failed with a status)
    ConnectResult {
        id: PeripheralId,
        result: Result<(), GattStatus>,
    },
    /// Platform reports the link as down
    LinkDown {
        id: PeripheralId,
        status: GattStatus,
    },
    ServicesDiscovered {
        id: PeripheralId,
        result: Result<Vec<DiscoveredService>, GattStatus>,
    },
    CharacteristicValue {
        id: PeripheralId,
        target: GattTarget,
        origin: ValueOrigin,
        result: Result<Vec<u8>, GattStatus>,
    },
    WriteResult {
        id: PeripheralId,
        target: GattTarget,
        status: GattStatus,
    },
    NotifyStateChanged {
        id: PeripheralId,
        target: GattTarget,
        enabled: bool,
        status: GattStatus,
    },
    DescriptorRead {
        id: PeripheralId,
        target: GattTarget,
        descriptor: Uuid,
        result: Result<Vec<u8>, GattStatus>,
    },
    DescriptorWrite {
        id: PeripheralId,
        target: GattTarget,
        descriptor: Uuid,
        status: GattStatus,
    },
    MtuChanged {
        id: PeripheralId,
        mtu: u16,
        status: GattStatus,
    },
    ScanFailed {
        code: i32,
    },
    AdapterState {
        powered_on: bool,
    },
}

impl HardwareEvent {
    /// Peripheral the event belongs to, if any
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            HardwareEvent::Advertisement(adv) => Some(&adv.id),
            HardwareEvent::ConnectResult { id, .. }
            | HardwareEvent::LinkDown { id, .. }
            | HardwareEvent::ServicesDiscovered { id, .. }
            | HardwareEvent::CharacteristicValue { id, .. }
            | HardwareEvent::WriteResult { id, .. }
            | HardwareEvent::NotifyStateChanged { id, .. }
            | HardwareEvent::DescriptorRead { id, .. }
            | HardwareEvent::DescriptorWrite { id, .. }
            | HardwareEvent::MtuChanged { id, .. } => Some(id),
            HardwareEvent::ScanFailed { .. } | HardwareEvent::AdapterState { .. } => None,
        }
    }
}

/// Parse a UUID string, expanding 16-bit ("180D") and 32-bit ("0000180D")
/// short forms against the Bluetooth base UUID.
pub fn parse_uuid(raw: &str) -> Result<Uuid, NormalizeError> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if (hex.len() == 4 || hex.len() == 8) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return u32::from_str_radix(hex, 16)
            .map(uuid_from_short)
            .map_err(|_| NormalizeError::InvalidUuid(raw.to_string()));
    }

    Uuid::parse_str(trimmed).map_err(|_| NormalizeError::InvalidUuid(raw.to_string()))
}

fn parse_id(raw: &str) -> Result<PeripheralId, NormalizeError> {
    if raw.trim().is_empty() {
        return Err(NormalizeError::EmptyIdentifier);
    }
    Ok(PeripheralId::new(raw))
}

fn parse_target(service: &str, characteristic: &str) -> Result<GattTarget, NormalizeError> {
    Ok(GattTarget::new(parse_uuid(service)?, parse_uuid(characteristic)?))
}

fn status_result<T>(status: i32, value: T) -> Result<T, GattStatus> {
    GattStatus(status).into_result().map(|_| value)
}

/// Convert one platform callback into a [`HardwareEvent`]
pub fn normalize(callback: PlatformCallback) -> Result<HardwareEvent, NormalizeError> {
    let event = match callback {
        PlatformCallback::DeviceDiscovered {
            identifier,
            name,
            rssi,
            service_uuids,
            service_data,
            manufacturer_data,
        } => {
            let mut adv = Advertisement::new(parse_id(&identifier)?, rssi);
            adv.local_name = name.filter(|n| !n.is_empty());
            for uuid in service_uuids {
                adv.service_uuids.push(parse_uuid(&uuid)?);
            }
            for (uuid, data) in service_data {
                adv.service_data.insert(parse_uuid(&uuid)?, data);
            }
            adv.manufacturer_data.extend(manufacturer_data);
            HardwareEvent::Advertisement(adv)
        }

        PlatformCallback::ConnectionStateChanged {
            identifier,
            status,
            connected,
        } => {
            let id = parse_id(&identifier)?;
            if connected {
                HardwareEvent::ConnectResult {
                    id,
                    result: GattStatus(status).into_result(),
                }
            } else {
                HardwareEvent::LinkDown {
                    id,
                    status: GattStatus(status),
                }
            }
        }

        PlatformCallback::ServicesDiscovered {
            identifier,
            status,
            services,
        } => {
            let id = parse_id(&identifier)?;
            let mut parsed = Vec::with_capacity(services.len());
            for service in services {
                let mut characteristics = Vec::with_capacity(service.characteristics.len());
                for characteristic in service.characteristics {
                    let descriptors = characteristic
                        .descriptors
                        .iter()
                        .map(|d| parse_uuid(d))
                        .collect::<Result<Vec<_>, _>>()?;
                    characteristics.push(DiscoveredCharacteristic {
                        uuid: parse_uuid(&characteristic.uuid)?,
                        descriptors,
                    });
                }
                parsed.push(DiscoveredService {
                    uuid: parse_uuid(&service.uuid)?,
                    characteristics,
                });
            }
            HardwareEvent::ServicesDiscovered {
                id,
                result: status_result(status, parsed),
            }
        }

        PlatformCallback::CharacteristicRead {
            identifier,
            service,
            characteristic,
            status,
            value,
        } => HardwareEvent::CharacteristicValue {
            id: parse_id(&identifier)?,
            target: parse_target(&service, &characteristic)?,
            origin: ValueOrigin::ReadResponse,
            result: status_result(status, value),
        },

        PlatformCallback::CharacteristicChanged {
            identifier,
            service,
            characteristic,
            value,
        } => HardwareEvent::CharacteristicValue {
            id: parse_id(&identifier)?,
            target: parse_target(&service, &characteristic)?,
            origin: ValueOrigin::Notification,
            result: Ok(value),
        },

        PlatformCallback::ValueUpdated {
            identifier,
            service,
            characteristic,
            value,
            error,
        } => HardwareEvent::CharacteristicValue {
            id: parse_id(&identifier)?,
            target: parse_target(&service, &characteristic)?,
            origin: ValueOrigin::Unspecified,
            result: match error {
                Some(code) if code != 0 => Err(GattStatus(code)),
                _ => Ok(value),
            },
        },

        PlatformCallback::CharacteristicWrite {
            identifier,
            service,
            characteristic,
            status,
        } => HardwareEvent::WriteResult {
            id: parse_id(&identifier)?,
            target: parse_target(&service, &characteristic)?,
            status: GattStatus(status),
        },

        PlatformCallback::NotificationStateChanged {
            identifier,
            service,
            characteristic,
            enabled,
            status,
        } => HardwareEvent::NotifyStateChanged {
            id: parse_id(&identifier)?,
            target: parse_target(&service, &characteristic)?,
            enabled,
            status: GattStatus(status),
        },

        PlatformCallback::DescriptorRead {
            identifier,
            service,
            characteristic,
            descriptor,
            status,
            value,
        } => HardwareEvent::DescriptorRead {
            id: parse_id(&identifier)?,
            target: parse_target(&service, &characteristic)?,
            descriptor: parse_uuid(&descriptor)?,
            result: status_result(status, value),
        },

        PlatformCallback::DescriptorWrite {
            identifier,
            service,
            characteristic,
            descriptor,
            status,
        } => HardwareEvent::DescriptorWrite {
            id: parse_id(&identifier)?,
            target: parse_target(&service, &characteristic)?,
            descriptor: parse_uuid(&descriptor)?,
            status: GattStatus(status),
        },

        PlatformCallback::MtuChanged {
            identifier,
            mtu,
            status,
        } => HardwareEvent::MtuChanged {
            id: parse_id(&identifier)?,
            mtu,
            status: GattStatus(status),
        },

        PlatformCallback::ScanFailed { error_code } => HardwareEvent::ScanFailed { code: error_code },

        PlatformCallback::AdapterStateChanged { powered_on } => {
            HardwareEvent::AdapterState { powered_on }
        }
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEART_RATE: &str = "0000180d-0000-1000-8000-00805f9b34fb";

    #[test]
    fn test_parse_short_uuids() {
        let full = Uuid::parse_str(HEART_RATE).expect("valid");
        assert_eq!(parse_uuid("180D").expect("16-bit"), full);
        assert_eq!(parse_uuid("0x180d").expect("prefixed"), full);
        assert_eq!(parse_uuid("0000180D").expect("32-bit"), full);
        assert_eq!(parse_uuid(HEART_RATE).expect("128-bit"), full);
        assert_eq!(
            parse_uuid("not-a-uuid"),
            Err(NormalizeError::InvalidUuid("not-a-uuid".into()))
        );
    }

    #[test]
    fn test_connection_state_split() {
        let up = normalize(PlatformCallback::ConnectionStateChanged {
            identifier: "aa:bb".into(),
            status: 0,
            connected: true,
        })
        .expect("normalize");
        assert_eq!(
            up,
            HardwareEvent::ConnectResult {
                id: PeripheralId::new("AA:BB"),
                result: Ok(()),
            }
        );

        let down = normalize(PlatformCallback::ConnectionStateChanged {
            identifier: "aa:bb".into(),
            status: 133,
            connected: false,
        })
        .expect("normalize");
        assert_eq!(
            down,
            HardwareEvent::LinkDown {
                id: PeripheralId::new("AA:BB"),
                status: GattStatus(133),
            }
        );
    }

    #[test]
    fn test_device_discovered_parses_advertisement() {
        let event = normalize(PlatformCallback::DeviceDiscovered {
            identifier: "dev-1".into(),
            name: Some(String::new()),
            rssi: -61,
            service_uuids: vec!["180D".into()],
            service_data: vec![("FEAA".into(), vec![0x10, 0x00])],
            manufacturer_data: vec![(0x004C, vec![0x02, 0x15])],
        })
        .expect("normalize");

        let HardwareEvent::Advertisement(adv) = event else {
            panic!("expected advertisement");
        };
        assert_eq!(adv.local_name, None);
        assert_eq!(adv.rssi, -61);
        assert_eq!(adv.service_uuids, vec![uuid_from_short(0x180D)]);
        assert_eq!(adv.service_data.get(&uuid_from_short(0xFEAA)), Some(&vec![0x10, 0x00]));
        assert_eq!(adv.manufacturer_data.get(&0x004C), Some(&vec![0x02, 0x15]));
    }

    #[test]
    fn test_value_updated_with_error() {
        let event = normalize(PlatformCallback::ValueUpdated {
            identifier: "dev-1".into(),
            service: "180D".into(),
            characteristic: "2A37".into(),
            value: vec![],
            error: Some(5),
        })
        .expect("normalize");

        match event {
            HardwareEvent::CharacteristicValue { origin, result, .. } => {
                assert_eq!(origin, ValueOrigin::Unspecified);
                assert_eq!(result, Err(GattStatus(5)));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_services_discovered_with_descriptors() {
        let event = normalize(PlatformCallback::ServicesDiscovered {
            identifier: "dev-1".into(),
            status: 0,
            services: vec![RawService {
                uuid: "180D".into(),
                characteristics: vec![RawCharacteristic {
                    uuid: "2A37".into(),
                    descriptors: vec!["2902".into()],
                }],
            }],
        })
        .expect("normalize");

        let HardwareEvent::ServicesDiscovered { result: Ok(services), .. } = event else {
            panic!("expected discovered services");
        };
        assert_eq!(services[0].uuid, uuid_from_short(0x180D));
        assert_eq!(services[0].characteristics[0].descriptors, vec![uuid_from_short(0x2902)]);
    }

    #[test]
    fn test_malformed_callbacks_rejected() {
        let empty = normalize(PlatformCallback::MtuChanged {
            identifier: "  ".into(),
            mtu: 185,
            status: 0,
        });
        assert_eq!(empty, Err(NormalizeError::EmptyIdentifier));

        let bad_uuid = normalize(PlatformCallback::CharacteristicWrite {
            identifier: "dev-1".into(),
            service: "zz".into(),
            characteristic: "2A37".into(),
            status: 0,
        });
        assert!(matches!(bad_uuid, Err(NormalizeError::InvalidUuid(_))));
    }

    #[test]
    fn test_callback_json_shape() {
        let json = r#"{ "type": "scan_failed", "error_code": 2 }"#;
        let callback: PlatformCallback = serde_json::from_str(json).expect("deserialize");
        assert_eq!(
            normalize(callback).expect("normalize"),
            HardwareEvent::ScanFailed { code: 2 }
        );
    }

    #[test]
    fn test_event_peripheral() {
        let write = normalize(PlatformCallback::CharacteristicWrite {
            identifier: "aa:bb".into(),
            service: "180D".into(),
            characteristic: "2A39".into(),
            status: 0,
        })
        .expect("normalize");
        assert_eq!(write.peripheral(), Some(&PeripheralId::new("AA:BB")));

        let adapter = HardwareEvent::AdapterState { powered_on: false };
        assert_eq!(adapter.peripheral(), None);
    }
}
