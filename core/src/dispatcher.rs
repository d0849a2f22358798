//! Command dispatcher
//!
//! Owns every piece of bridge state (registry, connections, queues, scan
//! session, timers) and the radio. All methods are synchronous and take the
//! current instant explicitly: commands are validated and either rejected
//! right away or answered through a [`PendingHandle`]; hardware events and
//! timer expiries drive those handles to completion. The bridge event loop is
//! the only caller in production, which gives the single serialized context
//! the state relies on.

use crate::config::BridgeConfig;
use crate::connection::{Connection, ConnectionStatus, LinkInput, Transition};
use crate::error::{BridgeError, RadioError};
use crate::event::{HardwareEvent, ValueOrigin};
use crate::pending::{pending, PendingHandle};
use crate::queue::{CompletionKey, GattOperation, GattRequest, OperationQueue};
use crate::radio::RadioAdapter;
use crate::registry::{DeviceRegistry, Peripheral};
use crate::scan::ScanCoordinator;
use crate::timer::{TimerKey, Timers};
use crate::types::{
    Advertisement, ConnectionInfo, ConnectionPhase, DiscoveredService, GattOpKind, GattStatus,
    GattTarget, GattValue, Notification, OperationId, PeripheralId, ScanRequest, ScanSessionId,
    ScanStopReason, ServiceMap, WriteType, ATT_WRITE_OVERHEAD, MAX_ATTRIBUTE_SIZE,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub struct Dispatcher<R: RadioAdapter> {
    config: BridgeConfig,
    radio: R,
    registry: DeviceRegistry,
    connections: HashMap<PeripheralId, Connection>,
    queues: HashMap<PeripheralId, OperationQueue>,
    scanner: ScanCoordinator,
    timers: Timers,
    notifications: mpsc::UnboundedSender<Notification>,
    next_operation: u64,
    adapter_powered: bool,
}

impl<R: RadioAdapter> Dispatcher<R> {
    pub fn new(
        config: BridgeConfig,
        radio: R,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            registry: DeviceRegistry::new(config.registry_capacity),
            scanner: ScanCoordinator::new(config.duplicate_policy),
            config,
            radio,
            connections: HashMap::new(),
            queues: HashMap::new(),
            timers: Timers::new(),
            notifications,
            next_operation: 1,
            adapter_powered: true,
        }
    }

    // ========================================================================
    // SCAN COMMANDS
    // ========================================================================

    pub fn start_scan(
        &mut self,
        request: ScanRequest,
        now: Instant,
    ) -> Result<ScanSessionId, BridgeError> {
        self.ensure_powered()?;
        let session = self.scanner.start(request, now)?;
        let (id, filter, deadline) = (session.id, session.filter.clone(), session.deadline);

        if let Err(e) = self.radio.start_scan(&filter) {
            self.scanner.end();
            warn!("Radio refused scan start: {}", e);
            return Err(e.into());
        }
        if let Some(deadline) = deadline {
            self.timers.arm(TimerKey::ScanDeadline(id), deadline);
        }
        info!("Scan session {} started", id);
        Ok(id)
    }

    pub fn stop_scan(&mut self, session: ScanSessionId) -> Result<(), BridgeError> {
        self.scanner.stop(session)?;
        self.finish_scan(session, ScanStopReason::Requested, true);
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    fn finish_scan(&mut self, session: ScanSessionId, reason: ScanStopReason, stop_radio: bool) {
        self.timers.cancel(&TimerKey::ScanDeadline(session));
        if stop_radio {
            if let Err(e) = self.radio.stop_scan() {
                warn!("Radio refused scan stop: {}", e);
            }
        }
        info!("Scan session {} stopped ({:?})", session, reason);
        self.notify(Notification::ScanStopped { session, reason });
    }

    // ========================================================================
    // CONNECTION COMMANDS
    // ========================================================================

    /// Start (or join) a connection attempt. Resolves once services are
    /// discovered and the link is ready for GATT operations.
    pub fn connect(
        &mut self,
        id: &PeripheralId,
        now: Instant,
    ) -> Result<PendingHandle<ConnectionInfo>, BridgeError> {
        self.registry.get(id)?;
        self.ensure_powered()?;

        let transition = self
            .connections
            .entry(id.clone())
            .or_insert_with(|| Connection::new(id.clone()))
            .apply(LinkInput::ConnectRequested, now)?;

        let (responder, handle) = pending();
        if let Some(conn) = self.connections.get_mut(id) {
            conn.add_connect_waiter(responder);
        }

        if !transition.changed() {
            debug!("Connect to {} joined the attempt in progress", id);
            return Ok(handle);
        }

        self.registry.pin(id);
        self.queues.insert(
            id.clone(),
            OperationQueue::new(id.clone(), self.config.max_queued_operations),
        );
        self.announce(id, transition);

        match self.radio.connect(id) {
            Ok(()) => {
                self.timers
                    .arm_after(TimerKey::Connect(id.clone()), now, self.config.connect_timeout());
            }
            Err(e) => {
                warn!("Radio refused connect to {}: {}", id, e);
                self.fail_connect(id, LinkInput::ConnectFailed(e.to_string()), now);
            }
        }
        Ok(handle)
    }

    pub fn disconnect(
        &mut self,
        id: &PeripheralId,
        now: Instant,
    ) -> Result<PendingHandle<()>, BridgeError> {
        let conn = self.connection_mut(id)?;
        let before = conn.phase();
        let transition = conn.apply(LinkInput::DisconnectRequested, now)?;

        let (responder, handle) = pending();
        conn.add_disconnect_waiter(responder);
        if !transition.changed() {
            return Ok(handle);
        }

        self.fail_operations(id, BridgeError::LinkLost { id: id.clone() });
        if before != ConnectionPhase::Ready {
            let reason = "disconnect requested".to_string();
            if let Some(conn) = self.connections.get_mut(id) {
                conn.resolve_connect(Err(BridgeError::ConnectFailure {
                    id: id.clone(),
                    reason: reason.clone(),
                }));
                conn.resolve_discovery(Err(BridgeError::DiscoveryFailure {
                    id: id.clone(),
                    reason,
                }));
            }
        }
        self.timers.cancel(&TimerKey::Connect(id.clone()));
        self.timers.cancel(&TimerKey::Discovery(id.clone()));
        self.announce(id, transition);
        self.request_disconnect(id, now);
        Ok(handle)
    }

    /// Cached services when ready; otherwise joins the discovery in progress
    pub fn discover_services(
        &mut self,
        id: &PeripheralId,
    ) -> Result<PendingHandle<ServiceMap>, BridgeError> {
        let conn = self.connection_mut(id)?;
        let (responder, handle) = pending();
        match conn.phase() {
            ConnectionPhase::Ready => responder.resolve(Ok(conn.services().clone())),
            ConnectionPhase::Connecting
            | ConnectionPhase::Connected
            | ConnectionPhase::DiscoveringServices => conn.add_discovery_waiter(responder),
            phase => {
                return Err(BridgeError::InvalidState {
                    operation: "discover_services",
                    detail: format!("{} is {}", id, phase),
                })
            }
        }
        Ok(handle)
    }

    pub fn connection_phase(&self, id: &PeripheralId) -> Result<ConnectionPhase, BridgeError> {
        match self.connections.get(id) {
            Some(conn) => Ok(conn.phase()),
            None if self.registry.contains(id) => Ok(ConnectionPhase::Disconnected),
            None => Err(BridgeError::NotFound(format!("peripheral {}", id))),
        }
    }

    /// Phase, MTU and last failure of a peripheral's connection record
    pub fn connection_status(&self, id: &PeripheralId) -> Result<ConnectionStatus, BridgeError> {
        match self.connections.get(id) {
            Some(conn) => Ok(conn.status()),
            None if self.registry.contains(id) => Ok(ConnectionStatus::idle(id.clone())),
            None => Err(BridgeError::NotFound(format!("peripheral {}", id))),
        }
    }

    /// Negotiated MTU of a live link
    pub fn mtu(&self, id: &PeripheralId) -> Result<u16, BridgeError> {
        self.connections
            .get(id)
            .map(Connection::mtu)
            .ok_or_else(|| BridgeError::NotFound(format!("connection {}", id)))
    }

    // ========================================================================
    // GATT COMMANDS
    // ========================================================================

    pub fn read(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.submit(id, target, GattRequest::Read, now)
    }

    pub fn write(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        value: Vec<u8>,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        let request = GattRequest::Write {
            value,
            with_response: true,
        };
        self.submit(id, target, request, now)
    }

    /// Resolves as soon as the radio accepts the write
    pub fn write_without_response(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        value: Vec<u8>,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        let request = GattRequest::Write {
            value,
            with_response: false,
        };
        self.submit(id, target, request, now)
    }

    pub fn subscribe(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.submit(id, target, GattRequest::SetNotify { enable: true }, now)
    }

    pub fn unsubscribe(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.submit(id, target, GattRequest::SetNotify { enable: false }, now)
    }

    pub fn read_descriptor(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        descriptor: Uuid,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.submit(id, target, GattRequest::ReadDescriptor { descriptor }, now)
    }

    pub fn write_descriptor(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        descriptor: Uuid,
        value: Vec<u8>,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.submit(
            id,
            target,
            GattRequest::WriteDescriptor { descriptor, value },
            now,
        )
    }

    /// Validate and enqueue one GATT operation, then kick the queue
    pub fn submit(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        request: GattRequest,
        now: Instant,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        let kind = request.kind();
        let conn = self.connection_mut(id)?;
        if !conn.is_ready() {
            return Err(BridgeError::InvalidState {
                operation: kind.as_str(),
                detail: format!("{} is {}, not ready", id, conn.phase()),
            });
        }

        let characteristic = conn.find_characteristic(&target).ok_or_else(|| {
            BridgeError::NotFound(format!("characteristic {} on {}", target, id))
        })?;
        if let Some(descriptor) = request.descriptor() {
            if !characteristic.descriptors.contains(&descriptor) {
                return Err(BridgeError::NotFound(format!(
                    "descriptor {} of {} on {}",
                    descriptor, target, id
                )));
            }
        }

        if let Some(payload) = request.payload() {
            if payload.len() > MAX_ATTRIBUTE_SIZE {
                return Err(BridgeError::InvalidCommand(format!(
                    "payload of {} bytes exceeds {} byte attribute limit",
                    payload.len(),
                    MAX_ATTRIBUTE_SIZE
                )));
            }
            let unacknowledged_limit = usize::from(conn.mtu().saturating_sub(ATT_WRITE_OVERHEAD));
            if kind == GattOpKind::WriteWithoutResponse && payload.len() > unacknowledged_limit {
                return Err(BridgeError::InvalidCommand(format!(
                    "payload of {} bytes exceeds MTU limit of {} bytes",
                    payload.len(),
                    unacknowledged_limit
                )));
            }
        }

        let queue = self
            .queues
            .get_mut(id)
            .ok_or_else(|| BridgeError::NotFound(format!("connection {}", id)))?;
        let op_id = OperationId(self.next_operation);
        let (responder, handle) = pending();
        queue.enqueue(GattOperation::new(op_id, target, request, responder, now))?;
        self.next_operation += 1;

        debug!("Queued {} {} for {} on {}", kind, op_id, target, id);
        self.pump(id, now);
        Ok(handle)
    }

    /// Dispatch queued operations until one is left waiting on the radio
    fn pump(&mut self, id: &PeripheralId, now: Instant) {
        loop {
            let Some(queue) = self.queues.get_mut(id) else {
                return;
            };
            let Some(head) = queue.start_next() else {
                return;
            };
            let (op_id, target, request) = (head.id, head.target, head.request.clone());

            let issued = match &request {
                GattRequest::Read => self.radio.read_characteristic(id, &target),
                GattRequest::Write {
                    value,
                    with_response,
                } => {
                    let write_type = if *with_response {
                        WriteType::WithResponse
                    } else {
                        WriteType::WithoutResponse
                    };
                    self.radio.write_characteristic(id, &target, value, write_type)
                }
                GattRequest::SetNotify { enable } => self.radio.set_notify(id, &target, *enable),
                GattRequest::ReadDescriptor { descriptor } => {
                    self.radio.read_descriptor(id, &target, descriptor)
                }
                GattRequest::WriteDescriptor { descriptor, value } => {
                    self.radio.write_descriptor(id, &target, descriptor, value)
                }
            };

            match issued {
                Ok(()) if request.kind() == GattOpKind::WriteWithoutResponse => {
                    trace!("{} accepted by radio", op_id);
                    self.resolve_in_flight(id, op_id, Ok(None));
                }
                Ok(()) => {
                    self.timers.arm_after(
                        TimerKey::Operation(id.clone(), op_id),
                        now,
                        self.config.operation_timeout(),
                    );
                    return;
                }
                Err(e) => {
                    warn!("Radio refused {} on {}: {}", op_id, id, e);
                    self.resolve_in_flight(id, op_id, Err(e.into()));
                }
            }
        }
    }

    fn resolve_in_flight(
        &mut self,
        id: &PeripheralId,
        op_id: OperationId,
        result: Result<GattValue, BridgeError>,
    ) {
        if let Some(op) = self
            .queues
            .get_mut(id)
            .and_then(|queue| queue.take_in_flight(op_id))
        {
            op.resolve(result);
        }
    }

    /// Match a hardware result against the in-flight head. Mismatches are strays.
    fn take_completed(&mut self, id: &PeripheralId, key: CompletionKey) -> Option<GattOperation> {
        let completed = self.queues.get_mut(id).and_then(|queue| queue.complete(&key));
        match &completed {
            Some(op) => {
                self.timers.cancel(&TimerKey::Operation(id.clone(), op.id));
            }
            None => warn!(
                "Dropping stray {} result for {} on {}",
                key.kind, key.target, id
            ),
        }
        completed
    }

    fn finish_operation(
        &mut self,
        id: &PeripheralId,
        op: GattOperation,
        outcome: Result<GattValue, GattStatus>,
        now: Instant,
    ) {
        let (kind, characteristic) = (op.kind(), op.target.characteristic);
        let result = outcome.map_err(|status| BridgeError::OperationFailed {
            id: id.clone(),
            kind,
            characteristic,
            status,
        });
        debug!("{} {} on {} completed (ok: {})", kind, op.id, id, result.is_ok());
        op.resolve(result);
        self.pump(id, now);
    }

    fn complete_operation(
        &mut self,
        id: &PeripheralId,
        key: CompletionKey,
        outcome: Result<GattValue, GattStatus>,
        now: Instant,
    ) {
        if let Some(op) = self.take_completed(id, key) {
            self.finish_operation(id, op, outcome, now);
        }
    }

    /// Fail every queued and in-flight operation of a device, in enqueue order
    fn fail_operations(&mut self, id: &PeripheralId, error: BridgeError) {
        let Some(queue) = self.queues.get_mut(id) else {
            return;
        };
        let drained = queue.drain();
        if !drained.is_empty() {
            debug!("Failing {} pending operations on {}: {}", drained.len(), id, error);
        }
        for op in drained {
            self.timers.cancel(&TimerKey::Operation(id.clone(), op.id));
            op.resolve(Err(error.clone()));
        }
    }

    // ========================================================================
    // REGISTRY COMMANDS
    // ========================================================================

    pub fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, BridgeError> {
        self.registry.get(id).cloned()
    }

    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.registry.peripherals()
    }

    pub fn evict(&mut self, id: &PeripheralId) -> Result<Peripheral, BridgeError> {
        let evicted = self.registry.evict(id)?;
        self.forget(id);
        Ok(evicted)
    }

    pub fn evict_stale(&mut self, max_age: Duration, now: Instant) -> Vec<PeripheralId> {
        let evicted = self.registry.evict_stale(max_age, now);
        for id in &evicted {
            self.forget(id);
        }
        evicted
    }

    fn forget(&mut self, id: &PeripheralId) {
        self.connections.remove(id);
        self.queues.remove(id);
    }

    // ========================================================================
    // HARDWARE EVENTS
    // ========================================================================

    pub fn handle_event(&mut self, event: HardwareEvent, now: Instant) {
        match event {
            HardwareEvent::Advertisement(adv) => self.on_advertisement(adv, now),

            HardwareEvent::ConnectResult { id, result } => match result {
                Ok(()) if self.phase_of(&id) == Some(ConnectionPhase::Disconnected) => {
                    // Attempt already ended; drop the OS link
                    warn!("Late connect for {} after the attempt ended, disconnecting", id);
                    if let Err(e) = self.radio.disconnect(&id) {
                        debug!("Dropping late link to {} failed: {}", id, e);
                    }
                }
                Ok(()) => self.on_connected(&id, now),
                Err(status) => {
                    if self.phase_of(&id) == Some(ConnectionPhase::Connecting) {
                        let reason = format!("GATT status {}", status);
                        self.fail_connect(&id, LinkInput::ConnectFailed(reason), now);
                    } else {
                        warn!("Ignoring connect failure for {} outside of connecting", id);
                    }
                }
            },

            HardwareEvent::LinkDown { id, status } => {
                self.on_link_down(&id, format!("link down, status {}", status), now)
            }

            HardwareEvent::ServicesDiscovered { id, result } => {
                self.on_services_discovered(&id, result, now)
            }

            HardwareEvent::CharacteristicValue {
                id,
                target,
                origin,
                result,
            } => self.on_value(&id, target, origin, result, now),

            HardwareEvent::WriteResult { id, target, status } => {
                let key = CompletionKey::characteristic(target, GattOpKind::Write);
                self.complete_operation(&id, key, status.into_result().map(|_| None), now);
            }

            HardwareEvent::NotifyStateChanged {
                id,
                target,
                enabled,
                status,
            } => {
                let kind = if enabled {
                    GattOpKind::Subscribe
                } else {
                    GattOpKind::Unsubscribe
                };
                let Some(op) = self.take_completed(&id, CompletionKey::characteristic(target, kind))
                else {
                    return;
                };
                if status.is_success() {
                    if let Some(queue) = self.queues.get_mut(&id) {
                        if enabled {
                            queue.subscribe(target);
                        } else {
                            queue.unsubscribe(&target);
                        }
                    }
                }
                self.finish_operation(&id, op, status.into_result().map(|_| None), now);
            }

            HardwareEvent::DescriptorRead {
                id,
                target,
                descriptor,
                result,
            } => {
                let key = CompletionKey::descriptor(target, descriptor, GattOpKind::ReadDescriptor);
                self.complete_operation(&id, key, result.map(Some), now);
            }

            HardwareEvent::DescriptorWrite {
                id,
                target,
                descriptor,
                status,
            } => {
                let key =
                    CompletionKey::descriptor(target, descriptor, GattOpKind::WriteDescriptor);
                self.complete_operation(&id, key, status.into_result().map(|_| None), now);
            }

            HardwareEvent::MtuChanged { id, mtu, status } => {
                let live = self
                    .connections
                    .get_mut(&id)
                    .filter(|conn| !conn.phase().is_terminal() && status.is_success());
                match live {
                    Some(conn) => {
                        conn.set_mtu(mtu);
                        let mtu = conn.mtu();
                        debug!("MTU for {} is now {}", id, mtu);
                        self.notify(Notification::MtuChanged { id, mtu });
                    }
                    None => warn!("Ignoring MTU change ({}, status {}) for {}", mtu, status, id),
                }
            }

            HardwareEvent::ScanFailed { code } => match self.scanner.end() {
                Some(session) => {
                    warn!("Platform scan failure {}", code);
                    self.finish_scan(session.id, ScanStopReason::Failed(code), false);
                }
                None => warn!("Scan failure {} without an active session", code),
            },

            HardwareEvent::AdapterState { powered_on } => self.on_adapter_state(powered_on, now),
        }
    }

    fn on_advertisement(&mut self, adv: Advertisement, now: Instant) {
        let upsert = self.registry.upsert(adv, now);
        for evicted in &upsert.evicted {
            debug!("Registry full, evicted {}", evicted);
            self.forget(evicted);
        }
        if let Some(session) = self.scanner.admit(&upsert.peripheral) {
            self.notify(Notification::DeviceDiscovered {
                session,
                peripheral: upsert.peripheral,
            });
        }
    }

    fn on_connected(&mut self, id: &PeripheralId, now: Instant) {
        let Some(transition) = self.apply_hardware(id, LinkInput::ConnectSucceeded, now) else {
            return;
        };
        self.timers.cancel(&TimerKey::Connect(id.clone()));
        self.announce(id, transition);

        // Discovery always follows a successful connect
        let Some(transition) = self.apply_hardware(id, LinkInput::DiscoveryStarted, now) else {
            return;
        };
        self.announce(id, transition);
        match self.radio.discover_services(id) {
            Ok(()) => {
                self.timers.arm_after(
                    TimerKey::Discovery(id.clone()),
                    now,
                    self.config.discovery_timeout(),
                );
            }
            Err(e) => {
                warn!("Radio refused service discovery on {}: {}", id, e);
                self.fail_discovery(id, LinkInput::DiscoveryFailed(e.to_string()), now);
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        id: &PeripheralId,
        result: Result<Vec<DiscoveredService>, GattStatus>,
        now: Instant,
    ) {
        if self.phase_of(id) != Some(ConnectionPhase::DiscoveringServices) {
            warn!("Ignoring services discovered for {} outside of discovery", id);
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(status) => {
                let reason = format!("GATT status {}", status);
                self.fail_discovery(id, LinkInput::DiscoveryFailed(reason), now);
                return;
            }
        };

        let mut map = ServiceMap::new();
        for service in services {
            map.entry(service.uuid)
                .or_default()
                .extend(service.characteristics);
        }

        let Some(transition) = self.apply_hardware(id, LinkInput::ServicesDiscovered(map), now)
        else {
            return;
        };
        self.timers.cancel(&TimerKey::Discovery(id.clone()));
        if let Some(conn) = self.connections.get_mut(id) {
            info!("{} ready with {} services", id, conn.services().len());
            let info = conn.info();
            let services = info.services.clone();
            conn.resolve_discovery(Ok(services));
            conn.resolve_connect(Ok(info));
        }
        self.announce(id, transition);
    }

    fn on_value(
        &mut self,
        id: &PeripheralId,
        target: GattTarget,
        origin: ValueOrigin,
        result: Result<Vec<u8>, GattStatus>,
        now: Instant,
    ) {
        if origin != ValueOrigin::Notification {
            let key = CompletionKey::characteristic(target, GattOpKind::Read);
            let head_matches = self
                .queues
                .get(id)
                .and_then(OperationQueue::in_flight)
                .map_or(false, |op| op.completion_key() == key);
            if head_matches || origin == ValueOrigin::ReadResponse {
                self.complete_operation(id, key, result.map(Some), now);
                return;
            }
        }

        let subscribed = self
            .queues
            .get(id)
            .map_or(false, |queue| queue.is_subscribed(&target));
        match result {
            Ok(value) if subscribed => {
                trace!("Notification from {} on {} ({} bytes)", id, target, value.len());
                self.notify(Notification::ValueChanged {
                    id: id.clone(),
                    target,
                    value,
                });
            }
            Ok(_) => debug!("Dropping value for unsubscribed {} on {}", target, id),
            Err(status) => warn!("Notification error {} from {} on {}", status, id, target),
        }
    }

    fn on_link_down(&mut self, id: &PeripheralId, reason: String, now: Instant) {
        match self.phase_of(id) {
            Some(ConnectionPhase::Connecting) => {
                self.fail_connect(id, LinkInput::ConnectFailed(reason), now)
            }
            Some(ConnectionPhase::Disconnecting) => {
                self.finish_disconnect(id, LinkInput::LinkDown, now)
            }
            Some(ConnectionPhase::Connected)
            | Some(ConnectionPhase::DiscoveringServices)
            | Some(ConnectionPhase::Ready) => self.lose_link(id, reason, now),
            Some(ConnectionPhase::Disconnected) | None => {
                warn!("Ignoring link down for {} without a live connection", id)
            }
        }
    }

    fn on_adapter_state(&mut self, powered_on: bool, now: Instant) {
        self.adapter_powered = powered_on;
        info!("Bluetooth adapter powered {}", if powered_on { "on" } else { "off" });
        self.notify(Notification::AdapterStateChanged { powered_on });
        if powered_on {
            return;
        }

        if let Some(session) = self.scanner.end() {
            self.finish_scan(session.id, ScanStopReason::AdapterOff, false);
        }
        let live: Vec<PeripheralId> = self
            .connections
            .values()
            .filter(|conn| !conn.phase().is_terminal())
            .map(|conn| conn.id().clone())
            .collect();
        for id in live {
            self.on_link_down(&id, "adapter powered off".to_string(), now);
        }
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Process every deadline at or before `now`
    pub fn fire_timers(&mut self, now: Instant) {
        for key in self.timers.expired(now) {
            match key {
                TimerKey::Connect(id) => {
                    warn!("Connect to {} timed out", id);
                    if let Err(e) = self.radio.disconnect(&id) {
                        debug!("Cancelling connect to {} failed: {}", id, e);
                    }
                    self.fail_connect(&id, LinkInput::ConnectTimedOut, now);
                }
                TimerKey::Discovery(id) => {
                    warn!("Service discovery on {} timed out", id);
                    self.fail_discovery(&id, LinkInput::DiscoveryTimedOut, now);
                }
                TimerKey::Disconnect(id) => {
                    warn!("Disconnect of {} not confirmed in time", id);
                    self.finish_disconnect(&id, LinkInput::DisconnectTimedOut, now);
                }
                TimerKey::Operation(id, op_id) => {
                    let Some(op) = self
                        .queues
                        .get_mut(&id)
                        .and_then(|queue| queue.take_in_flight(op_id))
                    else {
                        continue;
                    };
                    warn!("{} {} on {} timed out", op.kind(), op_id, id);
                    let error = BridgeError::OperationTimeout {
                        id: id.clone(),
                        kind: op.kind(),
                        characteristic: op.target.characteristic,
                    };
                    op.resolve(Err(error));
                    self.pump(&id, now);
                }
                TimerKey::ScanDeadline(session) => {
                    if self.scanner.active().map(|s| s.id) == Some(session) {
                        self.scanner.end();
                        self.finish_scan(session, ScanStopReason::DeadlineReached, true);
                    }
                }
            }
        }
    }

    // ========================================================================
    // LIFECYCLE HELPERS
    // ========================================================================

    fn fail_connect(&mut self, id: &PeripheralId, input: LinkInput, now: Instant) {
        let reason = match &input {
            LinkInput::ConnectFailed(reason) => reason.clone(),
            _ => "connect timed out".to_string(),
        };
        let Some(transition) = self.apply_hardware(id, input, now) else {
            return;
        };
        self.timers.cancel_peripheral(id);

        let error = BridgeError::ConnectFailure {
            id: id.clone(),
            reason,
        };
        info!("{}", error);
        if let Some(conn) = self.connections.get_mut(id) {
            conn.record_error(error.clone());
            conn.resolve_discovery(Err(error.clone()));
            conn.resolve_connect(Err(error));
        }
        self.teardown(id);
        self.announce(id, transition);
    }

    fn fail_discovery(&mut self, id: &PeripheralId, input: LinkInput, now: Instant) {
        let reason = match &input {
            LinkInput::DiscoveryFailed(reason) => reason.clone(),
            _ => "service discovery timed out".to_string(),
        };
        let Some(transition) = self.apply_hardware(id, input, now) else {
            return;
        };
        self.timers.cancel(&TimerKey::Discovery(id.clone()));

        let error = BridgeError::DiscoveryFailure {
            id: id.clone(),
            reason,
        };
        info!("{}", error);
        if let Some(conn) = self.connections.get_mut(id) {
            conn.record_error(error.clone());
            conn.resolve_discovery(Err(error.clone()));
            conn.resolve_connect(Err(error));
        }
        self.announce(id, transition);
        self.request_disconnect(id, now);
    }

    /// Ask the radio to drop the link; completes immediately if it refuses
    fn request_disconnect(&mut self, id: &PeripheralId, now: Instant) {
        match self.radio.disconnect(id) {
            Ok(()) => {
                self.timers.arm_after(
                    TimerKey::Disconnect(id.clone()),
                    now,
                    self.config.disconnect_timeout(),
                );
            }
            Err(e) => {
                warn!("Radio refused disconnect of {}: {}", id, e);
                self.finish_disconnect(id, LinkInput::DisconnectTimedOut, now);
            }
        }
    }

    fn finish_disconnect(&mut self, id: &PeripheralId, input: LinkInput, now: Instant) {
        let Some(transition) = self.apply_hardware(id, input, now) else {
            return;
        };
        self.timers.cancel_peripheral(id);
        self.fail_operations(id, BridgeError::LinkLost { id: id.clone() });
        if let Some(conn) = self.connections.get_mut(id) {
            conn.resolve_disconnect(Ok(()));
        }
        self.teardown(id);
        self.announce(id, transition);
    }

    fn lose_link(&mut self, id: &PeripheralId, reason: String, now: Instant) {
        let Some(transition) = self.apply_hardware(id, LinkInput::LinkDown, now) else {
            return;
        };
        self.timers.cancel_peripheral(id);

        let error = BridgeError::LinkLost { id: id.clone() };
        warn!("Unexpected disconnect of {}: {}", id, reason);
        self.fail_operations(id, error.clone());
        if let Some(conn) = self.connections.get_mut(id) {
            conn.record_error(error.clone());
            conn.resolve_discovery(Err(error.clone()));
            conn.resolve_connect(Err(error.clone()));
        }
        self.teardown(id);
        self.announce(id, transition);
        self.notify(Notification::UnexpectedDisconnect {
            id: id.clone(),
            error,
        });
    }

    /// Release everything tied to a link that reached `Disconnected`
    fn teardown(&mut self, id: &PeripheralId) {
        self.fail_operations(id, BridgeError::LinkLost { id: id.clone() });
        if let Some(queue) = self.queues.get_mut(id) {
            queue.clear_subscriptions();
        }
        self.registry.unpin(id);
    }

    /// Apply a hardware- or timer-driven input; rejections are strays
    fn apply_hardware(
        &mut self,
        id: &PeripheralId,
        input: LinkInput,
        now: Instant,
    ) -> Option<Transition> {
        let conn = match self.connections.get_mut(id) {
            Some(conn) => conn,
            None => {
                warn!("Ignoring {} for unknown connection {}", input, id);
                return None;
            }
        };
        match conn.apply(input, now) {
            Ok(transition) => Some(transition),
            Err(e) => {
                warn!("Ignoring stray event for {}: {}", id, e);
                None
            }
        }
    }

    fn announce(&self, id: &PeripheralId, transition: Transition) {
        if !transition.changed() {
            return;
        }
        info!("{}: {} -> {}", id, transition.from, transition.to);
        self.notify(Notification::ConnectionStateChanged {
            id: id.clone(),
            phase: transition.to,
        });
    }

    fn phase_of(&self, id: &PeripheralId) -> Option<ConnectionPhase> {
        self.connections.get(id).map(Connection::phase)
    }

    fn connection_mut(&mut self, id: &PeripheralId) -> Result<&mut Connection, BridgeError> {
        match self.connections.get_mut(id) {
            Some(conn) => Ok(conn),
            None if self.registry.contains(id) => Err(BridgeError::InvalidState {
                operation: "connection",
                detail: format!("{} is disconnected", id),
            }),
            None => Err(BridgeError::NotFound(format!("peripheral {}", id))),
        }
    }

    fn ensure_powered(&self) -> Result<(), BridgeError> {
        if self.adapter_powered {
            Ok(())
        } else {
            Err(RadioError::Unavailable.into())
        }
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            trace!("Notification receiver dropped");
        }
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Stop scanning, drop every live link and fail all outstanding handles
    /// with `Closed`
    pub fn shutdown(&mut self, now: Instant) {
        if let Some(session) = self.scanner.end() {
            self.finish_scan(session.id, ScanStopReason::Shutdown, true);
        }

        let ids: Vec<PeripheralId> = self.connections.keys().cloned().collect();
        for id in ids {
            self.fail_operations(&id, BridgeError::Closed);
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            conn.resolve_connect(Err(BridgeError::Closed));
            conn.resolve_discovery(Err(BridgeError::Closed));
            conn.resolve_disconnect(Err(BridgeError::Closed));
            if conn.phase().is_terminal() {
                continue;
            }
            if let Err(e) = self.radio.disconnect(&id) {
                debug!("Disconnect of {} during shutdown failed: {}", id, e);
            }
            if let Some(transition) = self.apply_hardware(&id, LinkInput::LinkDown, now) {
                self.teardown(&id);
                self.announce(&id, transition);
            }
        }
        self.timers.clear();
        info!("Bridge shut down");
    }
}
