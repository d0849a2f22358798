/// Radio adapter
///
/// The imperative half of a platform binding. Every call only *issues* a
/// request; outcomes come back later as [`PlatformCallback`]s pushed through a
/// [`RadioEventSink`]. An `Err` means the stack refused the request outright
/// and no callback will follow.
///
/// [`PlatformCallback`]: crate::event::PlatformCallback
/// [`RadioEventSink`]: crate::bridge::RadioEventSink

use crate::error::RadioError;
use crate::types::{GattTarget, PeripheralId, ScanFilter, WriteType};
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
pub trait RadioAdapter: Send {
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), RadioError>;

    fn stop_scan(&mut self) -> Result<(), RadioError>;

    fn connect(&mut self, id: &PeripheralId) -> Result<(), RadioError>;

    /// Also used to cancel a pending connect attempt
    fn disconnect(&mut self, id: &PeripheralId) -> Result<(), RadioError>;

    fn discover_services(&mut self, id: &PeripheralId) -> Result<(), RadioError>;

    fn read_characteristic(&mut self, id: &PeripheralId, target: &GattTarget)
        -> Result<(), RadioError>;

    fn write_characteristic(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError>;

    /// Toggle notifications (including the CCC descriptor write)
    fn set_notify(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        enable: bool,
    ) -> Result<(), RadioError>;

    fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
    ) -> Result<(), RadioError>;

    fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<(), RadioError>;
}

impl<R: RadioAdapter + ?Sized> RadioAdapter for Box<R> {
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), RadioError> {
        (**self).start_scan(filter)
    }

    fn stop_scan(&mut self) -> Result<(), RadioError> {
        (**self).stop_scan()
    }

    fn connect(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        (**self).connect(id)
    }

    fn disconnect(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        (**self).disconnect(id)
    }

    fn discover_services(&mut self, id: &PeripheralId) -> Result<(), RadioError> {
        (**self).discover_services(id)
    }

    fn read_characteristic(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
    ) -> Result<(), RadioError> {
        (**self).read_characteristic(id, target)
    }

    fn write_characteristic(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        (**self).write_characteristic(id, target, value, write_type)
    }

    fn set_notify(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        enable: bool,
    ) -> Result<(), RadioError> {
        (**self).set_notify(id, target, enable)
    }

    fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
    ) -> Result<(), RadioError> {
        (**self).read_descriptor(id, target, descriptor)
    }

    fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        target: &GattTarget,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        (**self).write_descriptor(id, target, descriptor, value)
    }
}
