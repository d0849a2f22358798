// Simulated radio
//
// Stands in for a platform binding: every accepted request is answered a little
// later through the event sink, the way an OS Bluetooth stack calls back. The
// simulated peripherals are heart-rate monitors with a battery service.

use crate::config::SimulatorConfig;
use blebridge_core::{
    uuid_from_short, GattTarget, PeripheralId, PlatformCallback, RadioAdapter, RadioError,
    RadioEventSink, RawCharacteristic, RawService, ScanFilter, WriteType,
};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

pub const HEART_RATE_SERVICE: u16 = 0x180D;
pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
pub const BODY_SENSOR_LOCATION: u16 = 0x2A38;
pub const HEART_RATE_CONTROL_POINT: u16 = 0x2A39;
pub const BATTERY_SERVICE: u16 = 0x180F;
pub const BATTERY_LEVEL: u16 = 0x2A19;
const CCC_DESCRIPTOR: u16 = 0x2902;
const NORDIC_COMPANY_ID: u16 = 0x0059;

/// GATT_ERROR as reported by Android
const GATT_ERROR: i32 = 133;

#[derive(Debug, Clone)]
struct SimDevice {
    identifier: String,
    name: String,
    rssi: i16,
    battery: u8,
}

pub fn device_identifier(index: usize) -> String {
    format!("5E:11:00:00:00:{:02X}", index)
}

pub struct SimulatedRadio {
    sink: RadioEventSink,
    config: SimulatorConfig,
    devices: Vec<SimDevice>,
    advertiser: Option<JoinHandle<()>>,
    notifiers: HashMap<PeripheralId, JoinHandle<()>>,
    connected: HashSet<PeripheralId>,
    /// Last value written per (device, characteristic)
    written: HashMap<(PeripheralId, Uuid), Vec<u8>>,
}

impl SimulatedRadio {
    pub fn new(sink: RadioEventSink, config: SimulatorConfig) -> Self {
        let mut rng = rand::thread_rng();
        let devices = (0..config.devices)
            .map(|i| SimDevice {
                identifier: device_identifier(i),
                name: format!("SIM-HRM-{}", i),
                rssi: rng.gen_range(-85..-40),
                battery: rng.gen_range(20..=100),
            })
            .collect();

        Self {
            sink,
            config,
            devices,
            advertiser: None,
            notifiers: HashMap::new(),
            connected: HashSet::new(),
            written: HashMap::new(),
        }
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.config.callback_latency_ms)
    }

    fn device(&self, id: &PeripheralId) -> Result<&SimDevice, RadioError> {
        self.devices
            .iter()
            .find(|d| PeripheralId::new(&d.identifier) == *id)
            .ok_or_else(|| RadioError::UnknownPeripheral(id.clone()))
    }

    fn ensure_connected(&self, id: &PeripheralId) -> Result<(), RadioError> {
        self.device(id)?;
        if !self.connected.contains(id) {
            return Err(RadioError::Rejected(format!("{} is not connected", id)));
        }
        Ok(())
    }

    /// Deliver `callback` after the configured latency
    fn reply_later(&self, callback: PlatformCallback) {
        let sink = self.sink.clone();
        let latency = self.latency();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if sink.deliver(callback).is_err() {
                trace!("Bridge gone, simulated callback dropped");
            }
        });
    }

    fn stop_notifier(&mut self, id: &PeripheralId) {
        if let Some(task) = self.notifiers.remove(id) {
            task.abort();
        }
    }

    fn gatt_table() -> Vec<RawService> {
        let characteristic = |uuid: u16, descriptors: &[u16]| RawCharacteristic {
            uuid: format!("{:04X}", uuid),
            descriptors: descriptors.iter().map(|d| format!("{:04X}", d)).collect(),
        };
        vec![
            RawService {
                uuid: format!("{:04X}", HEART_RATE_SERVICE),
                characteristics: vec![
                    characteristic(HEART_RATE_MEASUREMENT, &[CCC_DESCRIPTOR]),
                    characteristic(BODY_SENSOR_LOCATION, &[]),
                    characteristic(HEART_RATE_CONTROL_POINT, &[]),
                ],
            },
            RawService {
                uuid: format!("{:04X}", BATTERY_SERVICE),
                characteristics: vec![characteristic(BATTERY_LEVEL, &[CCC_DESCRIPTOR])],
            },
        ]
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        if let Some(task) = self.advertiser.take() {
            task.abort();
        }
        for (_, task) in self.notifiers.drain() {
            task.abort();
        }
    }
}

impl RadioAdapter for SimulatedRadio {
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), RadioError> {
        if self.advertiser.is_some() {
            return Err(RadioError::Rejected("scan already running".to_string()));
        }
        debug!("Simulated scan started with {:?}", filter);

        let sink = self.sink.clone();
        let devices = self.devices.clone();
        let interval = Duration::from_millis(self.config.advertising_interval_ms.max(1));
        self.advertiser = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for device in &devices {
                    let jitter: i16 = rand::thread_rng().gen_range(-4..=4);
                    let callback = PlatformCallback::DeviceDiscovered {
                        identifier: device.identifier.clone(),
                        name: Some(device.name.clone()),
                        rssi: device.rssi + jitter,
                        service_uuids: vec![format!("{:04X}", HEART_RATE_SERVICE)],
                        service_data: vec![(format!("{:04X}", BATTERY_SERVICE), vec![device.battery])],
                        manufacturer_data: vec![(NORDIC_COMPANY_ID, vec![0x01, 0x02])],
                    };
                    if sink.deliver(callback).is_err() {
                        return;
                    }
                }
            }
        }));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), RadioError> {
        if let Some(task) = self.advertiser.take() {
            task.abort();
            debug!("Simulated scan stopped");
        }
        Ok(())
    }

    fn connect(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        let identifier = self.device(id)?.identifier.clone();
        let fails = rand::thread_rng().gen_bool(self.config.connect_failure_rate.clamp(0.0, 1.0));
        if !fails {
            self.connected.insert(id.clone());
        }
        self.reply_later(PlatformCallback::ConnectionStateChanged {
            identifier,
            status: if fails { GATT_ERROR } else { 0 },
            connected: !fails,
        });
        Ok(())
    }

    fn disconnect(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        let identifier = self.device(id)?.identifier.clone();
        self.stop_notifier(id);
        self.connected.remove(id);
        self.reply_later(PlatformCallback::ConnectionStateChanged {
            identifier,
            status: 0,
            connected: false,
        });
        Ok(())
    }

    fn discover_services(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        self.ensure_connected(id)?;
        let identifier = self.device(id)?.identifier.clone();
        self.reply_later(PlatformCallback::ServicesDiscovered {
            identifier,
            status: 0,
            services: Self::gatt_table(),
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
    ) -> Result<(), RadioError> {
        self.ensure_connected(id)?;
        let device = self.device(id)?;
        let (status, value) = if target.characteristic == uuid_from_short(BODY_SENSOR_LOCATION.into()) {
            // 0x01: chest
            (0, vec![0x01])
        } else if target.characteristic == uuid_from_short(BATTERY_LEVEL.into()) {
            (0, vec![device.battery])
        } else if let Some(value) = self.written.get(&(id.clone(), target.characteristic)) {
            (0, value.clone())
        } else {
            // Read not permitted
            (0x02, Vec::new())
        };
        self.reply_later(PlatformCallback::CharacteristicRead {
            identifier: device.identifier.clone(),
            service: target.service.to_string(),
            characteristic: target.characteristic.to_string(),
            status,
            value,
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        self.ensure_connected(id)?;
        let identifier = self.device(id)?.identifier.clone();
        self.written
            .insert((id.clone(), target.characteristic), value.to_vec());
        if write_type == WriteType::WithResponse {
            self.reply_later(PlatformCallback::CharacteristicWrite {
                identifier,
                service: target.service.to_string(),
                characteristic: target.characteristic.to_string(),
                status: 0,
            });
        }
        Ok(())
    }

    fn set_notify(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        enable: bool,
    ) -> Result<(), RadioError> {
        self.ensure_connected(id)?;
        let identifier = self.device(id)?.identifier.clone();
        self.reply_later(PlatformCallback::NotificationStateChanged {
            identifier: identifier.clone(),
            service: target.service.to_string(),
            characteristic: target.characteristic.to_string(),
            enabled: enable,
            status: 0,
        });

        self.stop_notifier(id);
        if enable && target.characteristic == uuid_from_short(HEART_RATE_MEASUREMENT.into()) {
            let sink = self.sink.clone();
            let target = *target;
            // First measurement lands after the state change
            let start = self.latency() * 2;
            let task = tokio::spawn(async move {
                tokio::time::sleep(start).await;
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let bpm: u8 = rand::thread_rng().gen_range(58..=110);
                    let callback = PlatformCallback::CharacteristicChanged {
                        identifier: identifier.clone(),
                        service: target.service.to_string(),
                        characteristic: target.characteristic.to_string(),
                        // Flags 0x00: uint8 heart rate value
                        value: vec![0x00, bpm],
                    };
                    if sink.deliver(callback).is_err() {
                        return;
                    }
                }
            });
            self.notifiers.insert(id.clone(), task);
        }
        Ok(())
    }

    fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
    ) -> Result<(), RadioError> {
        self.ensure_connected(id)?;
        let identifier = self.device(id)?.identifier.clone();
        let enabled = self.notifiers.contains_key(id)
            && target.characteristic == uuid_from_short(HEART_RATE_MEASUREMENT.into());
        self.reply_later(PlatformCallback::DescriptorRead {
            identifier,
            service: target.service.to_string(),
            characteristic: target.characteristic.to_string(),
            descriptor: descriptor.to_string(),
            status: 0,
            value: vec![u8::from(enabled), 0x00],
        });
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
        _value: &[u8],
    ) -> Result<(), RadioError> {
        self.ensure_connected(id)?;
        let identifier = self.device(id)?.identifier.clone();
        self.reply_later(PlatformCallback::DescriptorWrite {
            identifier,
            service: target.service.to_string(),
            characteristic: target.characteristic.to_string(),
            descriptor: descriptor.to_string(),
            status: 0,
        });
        Ok(())
    }
}
