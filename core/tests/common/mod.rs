// Shared helpers for the integration tests: a radio that records every request
// and a harness that plays the platform side through the event sink.

#![allow(dead_code)]

use blebridge_core::{
    BleBridge, BridgeConfig, ConnectionInfo, GattTarget, Notification, NotificationStream,
    PeripheralId, PlatformCallback, RadioAdapter, RadioError, RadioEventSink, RawCharacteristic,
    RawService, ScanFilter, WriteType,
};
use blebridge_core::uuid_from_short;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

pub const HEART_RATE_SERVICE: &str = "180D";
pub const HEART_RATE_MEASUREMENT: &str = "2A37";
pub const BODY_SENSOR_LOCATION: &str = "2A38";
pub const CONTROL_POINT: &str = "2A39";
pub const CCC_DESCRIPTOR: &str = "2902";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan(ScanFilter),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    Read(PeripheralId, GattTarget),
    Write(PeripheralId, GattTarget, Vec<u8>, WriteType),
    SetNotify(PeripheralId, GattTarget, bool),
    ReadDescriptor(PeripheralId, GattTarget, Uuid),
    WriteDescriptor(PeripheralId, GattTarget, Uuid, Vec<u8>),
}

/// Accepts every request and remembers it
#[derive(Debug, Clone, Default)]
pub struct RecordingRadio {
    calls: Arc<Mutex<Vec<RadioCall>>>,
}

impl RecordingRadio {
    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: RadioCall) -> Result<(), RadioError> {
        self.calls.lock().push(call);
        Ok(())
    }
}

impl RadioAdapter for RecordingRadio {
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), RadioError> {
        self.record(RadioCall::StartScan(filter.clone()))
    }

    fn stop_scan(&mut self) -> Result<(), RadioError> {
        self.record(RadioCall::StopScan)
    }

    fn connect(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        self.record(RadioCall::Connect(id.clone()))
    }

    fn disconnect(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        self.record(RadioCall::Disconnect(id.clone()))
    }

    fn discover_services(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        self.record(RadioCall::DiscoverServices(id.clone()))
    }

    fn read_characteristic(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
    ) -> Result<(), RadioError> {
        self.record(RadioCall::Read(id.clone(), *target))
    }

    fn write_characteristic(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        self.record(RadioCall::Write(id.clone(), *target, value.to_vec(), write_type))
    }

    fn set_notify(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        enable: bool,
    ) -> Result<(), RadioError> {
        self.record(RadioCall::SetNotify(id.clone(), *target, enable))
    }

    fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
    ) -> Result<(), RadioError> {
        self.record(RadioCall::ReadDescriptor(id.clone(), *target, *descriptor))
    }

    fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.record(RadioCall::WriteDescriptor(
            id.clone(),
            *target,
            *descriptor,
            value.to_vec(),
        ))
    }
}

pub fn target(characteristic: &str) -> GattTarget {
    GattTarget::new(
        blebridge_core::parse_uuid(HEART_RATE_SERVICE).expect("service uuid"),
        blebridge_core::parse_uuid(characteristic).expect("characteristic uuid"),
    )
}

pub fn ccc() -> Uuid {
    uuid_from_short(0x2902)
}

/// A running bridge plus the platform side of it
pub struct Harness {
    pub bridge: BleBridge,
    pub notifications: NotificationStream,
    pub sink: RadioEventSink,
    pub radio: RecordingRadio,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        // RUST_LOG=blebridge_core=debug shows the loop's decisions
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let radio = RecordingRadio::default();
        let recorder = radio.clone();
        let mut sink = None;
        let (bridge, notifications) = BleBridge::spawn(config, |s| {
            sink = Some(s);
            recorder
        })
        .expect("Failed to spawn bridge");

        Self {
            bridge,
            notifications,
            sink: sink.expect("sink handed to radio"),
            radio,
        }
    }

    pub fn deliver(&self, callback: PlatformCallback) {
        self.sink.deliver(callback).expect("bridge loop running");
    }

    /// Round-trip through the loop so every earlier input has been processed
    pub async fn sync(&self) {
        self.bridge.is_scanning().await.expect("bridge loop running");
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }

    pub fn advertise(&self, id: &str, rssi: i16) {
        self.deliver(PlatformCallback::DeviceDiscovered {
            identifier: id.to_string(),
            name: Some(format!("HRM {}", id)),
            rssi,
            service_uuids: vec![HEART_RATE_SERVICE.to_string()],
            service_data: vec![],
            manufacturer_data: vec![(0x0059, vec![0x01])],
        });
    }

    pub fn link_up(&self, id: &str) {
        self.deliver(PlatformCallback::ConnectionStateChanged {
            identifier: id.to_string(),
            status: 0,
            connected: true,
        });
    }

    pub fn link_down(&self, id: &str, status: i32) {
        self.deliver(PlatformCallback::ConnectionStateChanged {
            identifier: id.to_string(),
            status,
            connected: false,
        });
    }

    pub fn services_discovered(&self, id: &str) {
        let characteristic = |uuid: &str, descriptors: &[&str]| RawCharacteristic {
            uuid: uuid.to_string(),
            descriptors: descriptors.iter().map(|d| d.to_string()).collect(),
        };
        self.deliver(PlatformCallback::ServicesDiscovered {
            identifier: id.to_string(),
            status: 0,
            services: vec![RawService {
                uuid: HEART_RATE_SERVICE.to_string(),
                characteristics: vec![
                    characteristic(HEART_RATE_MEASUREMENT, &[CCC_DESCRIPTOR]),
                    characteristic(BODY_SENSOR_LOCATION, &[]),
                    characteristic(CONTROL_POINT, &[]),
                ],
            }],
        });
    }

    pub fn read_response(&self, id: &str, characteristic: &str, value: Vec<u8>) {
        self.deliver(PlatformCallback::CharacteristicRead {
            identifier: id.to_string(),
            service: HEART_RATE_SERVICE.to_string(),
            characteristic: characteristic.to_string(),
            status: 0,
            value,
        });
    }

    pub fn write_response(&self, id: &str, characteristic: &str, status: i32) {
        self.deliver(PlatformCallback::CharacteristicWrite {
            identifier: id.to_string(),
            service: HEART_RATE_SERVICE.to_string(),
            characteristic: characteristic.to_string(),
            status,
        });
    }

    pub fn notify_state(&self, id: &str, characteristic: &str, enabled: bool) {
        self.deliver(PlatformCallback::NotificationStateChanged {
            identifier: id.to_string(),
            service: HEART_RATE_SERVICE.to_string(),
            characteristic: characteristic.to_string(),
            enabled,
            status: 0,
        });
    }

    pub fn value_changed(&self, id: &str, characteristic: &str, value: Vec<u8>) {
        self.deliver(PlatformCallback::CharacteristicChanged {
            identifier: id.to_string(),
            service: HEART_RATE_SERVICE.to_string(),
            characteristic: characteristic.to_string(),
            value,
        });
    }

    /// Advertise, connect and walk the link up to ready
    pub async fn connect_ready(&self, id: &str) -> ConnectionInfo {
        self.advertise(id, -55);
        let handle = self
            .bridge
            .connect(&PeripheralId::new(id))
            .await
            .expect("connect accepted");
        self.link_up(id);
        self.services_discovered(id);
        handle.await.expect("connection ready")
    }
}
