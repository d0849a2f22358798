// Bridge event loop and public handle
//
// One tokio task owns the dispatcher. Commands from the application and
// callbacks from the platform binding are marshaled onto the same unbounded
// channel, so arrival order is processing order and no state is ever touched
// from two places at once. The loop sleeps until either input arrives or the
// earliest timer deadline passes.

use crate::config::BridgeConfig;
use crate::connection::ConnectionStatus;
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::event::{normalize, PlatformCallback};
use crate::pending::PendingHandle;
use crate::queue::GattRequest;
use crate::radio::RadioAdapter;
use crate::registry::Peripheral;
use crate::types::{
    ConnectionInfo, ConnectionPhase, GattTarget, GattValue, Notification, PeripheralId,
    ScanRequest, ScanSessionId, ServiceMap,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Application-facing stream of unsolicited events
pub type NotificationStream = mpsc::UnboundedReceiver<Notification>;

type Reply<T> = oneshot::Sender<Result<T, BridgeError>>;

/// Commands executed on the event loop
#[derive(Debug)]
enum Command {
    StartScan {
        request: ScanRequest,
        reply: Reply<ScanSessionId>,
    },
    StopScan {
        session: ScanSessionId,
        reply: Reply<()>,
    },
    IsScanning {
        reply: Reply<bool>,
    },
    Connect {
        id: PeripheralId,
        reply: Reply<PendingHandle<ConnectionInfo>>,
    },
    Disconnect {
        id: PeripheralId,
        reply: Reply<PendingHandle<()>>,
    },
    DiscoverServices {
        id: PeripheralId,
        reply: Reply<PendingHandle<ServiceMap>>,
    },
    Gatt {
        id: PeripheralId,
        target: GattTarget,
        request: GattRequest,
        reply: Reply<PendingHandle<GattValue>>,
    },
    Peripheral {
        id: PeripheralId,
        reply: Reply<Peripheral>,
    },
    Peripherals {
        reply: Reply<Vec<Peripheral>>,
    },
    ConnectionPhase {
        id: PeripheralId,
        reply: Reply<ConnectionPhase>,
    },
    ConnectionStatus {
        id: PeripheralId,
        reply: Reply<ConnectionStatus>,
    },
    Mtu {
        id: PeripheralId,
        reply: Reply<u16>,
    },
    Evict {
        id: PeripheralId,
        reply: Reply<Peripheral>,
    },
    EvictStale {
        max_age: Duration,
        reply: Reply<Vec<PeripheralId>>,
    },
}

#[derive(Debug)]
enum Input {
    Command(Command),
    Radio(PlatformCallback),
    Shutdown(oneshot::Sender<()>),
}

/// Where a platform binding delivers its callbacks.
///
/// Holds only a weak reference to the loop: once every [`BleBridge`] handle is
/// gone the loop shuts down even if the radio still has sinks around.
#[derive(Debug, Clone)]
pub struct RadioEventSink {
    inbox: mpsc::WeakUnboundedSender<Input>,
}

impl RadioEventSink {
    /// Queue a callback behind everything already delivered
    pub fn deliver(&self, callback: PlatformCallback) -> Result<(), BridgeError> {
        let inbox = self.inbox.upgrade().ok_or(BridgeError::Closed)?;
        inbox
            .send(Input::Radio(callback))
            .map_err(|_| BridgeError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.upgrade().map_or(true, |inbox| inbox.is_closed())
    }
}

/// Cloneable handle to a running bridge
#[derive(Debug, Clone)]
pub struct BleBridge {
    inbox: mpsc::UnboundedSender<Input>,
}

impl BleBridge {
    /// Validate `config`, build the radio around a fresh event sink and spawn
    /// the event loop on the current tokio runtime.
    pub fn spawn<R, F>(
        config: BridgeConfig,
        make_radio: F,
    ) -> Result<(BleBridge, NotificationStream), BridgeError>
    where
        R: RadioAdapter + 'static,
        F: FnOnce(RadioEventSink) -> R,
    {
        config.validate()?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let sink = RadioEventSink {
            inbox: inbox_tx.downgrade(),
        };
        let dispatcher = Dispatcher::new(config, make_radio(sink), notify_tx);

        tokio::spawn(run_loop(dispatcher, inbox_rx));
        Ok((BleBridge { inbox: inbox_tx }, notify_rx))
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(Input::Command(command(reply)))
            .map_err(|_| BridgeError::Closed)?;
        response.await.map_err(|_| BridgeError::Closed)?
    }

    pub async fn start_scan(&self, request: ScanRequest) -> Result<ScanSessionId, BridgeError> {
        self.request(|reply| Command::StartScan { request, reply }).await
    }

    pub async fn stop_scan(&self, session: ScanSessionId) -> Result<(), BridgeError> {
        self.request(|reply| Command::StopScan { session, reply }).await
    }

    pub async fn is_scanning(&self) -> Result<bool, BridgeError> {
        self.request(|reply| Command::IsScanning { reply }).await
    }

    pub async fn connect(
        &self,
        id: &PeripheralId,
    ) -> Result<PendingHandle<ConnectionInfo>, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::Connect { id, reply }).await
    }

    pub async fn disconnect(&self, id: &PeripheralId) -> Result<PendingHandle<()>, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::Disconnect { id, reply }).await
    }

    pub async fn discover_services(
        &self,
        id: &PeripheralId,
    ) -> Result<PendingHandle<ServiceMap>, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::DiscoverServices { id, reply })
            .await
    }

    async fn gatt(
        &self,
        id: &PeripheralId,
        target: GattTarget,
        request: GattRequest,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::Gatt {
            id,
            target,
            request,
            reply,
        })
        .await
    }

    pub async fn read(
        &self,
        id: &PeripheralId,
        target: GattTarget,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.gatt(id, target, GattRequest::Read).await
    }

    pub async fn write(
        &self,
        id: &PeripheralId,
        target: GattTarget,
        value: Vec<u8>,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        let request = GattRequest::Write {
            value,
            with_response: true,
        };
        self.gatt(id, target, request).await
    }

    pub async fn write_without_response(
        &self,
        id: &PeripheralId,
        target: GattTarget,
        value: Vec<u8>,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        let request = GattRequest::Write {
            value,
            with_response: false,
        };
        self.gatt(id, target, request).await
    }

    pub async fn subscribe(
        &self,
        id: &PeripheralId,
        target: GattTarget,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.gatt(id, target, GattRequest::SetNotify { enable: true })
            .await
    }

    pub async fn unsubscribe(
        &self,
        id: &PeripheralId,
        target: GattTarget,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.gatt(id, target, GattRequest::SetNotify { enable: false })
            .await
    }

    pub async fn read_descriptor(
        &self,
        id: &PeripheralId,
        target: GattTarget,
        descriptor: Uuid,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.gatt(id, target, GattRequest::ReadDescriptor { descriptor })
            .await
    }

    pub async fn write_descriptor(
        &self,
        id: &PeripheralId,
        target: GattTarget,
        descriptor: Uuid,
        value: Vec<u8>,
    ) -> Result<PendingHandle<GattValue>, BridgeError> {
        self.gatt(id, target, GattRequest::WriteDescriptor { descriptor, value })
            .await
    }

    pub async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::Peripheral { id, reply }).await
    }

    pub async fn peripherals(&self) -> Result<Vec<Peripheral>, BridgeError> {
        self.request(|reply| Command::Peripherals { reply }).await
    }

    pub async fn connection_phase(&self, id: &PeripheralId) -> Result<ConnectionPhase, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::ConnectionPhase { id, reply })
            .await
    }

    /// Phase, MTU and the last recorded failure, also after the link is gone
    pub async fn connection_status(
        &self,
        id: &PeripheralId,
    ) -> Result<ConnectionStatus, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::ConnectionStatus { id, reply })
            .await
    }

    pub async fn mtu(&self, id: &PeripheralId) -> Result<u16, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::Mtu { id, reply }).await
    }

    pub async fn evict(&self, id: &PeripheralId) -> Result<Peripheral, BridgeError> {
        let id = id.clone();
        self.request(|reply| Command::Evict { id, reply }).await
    }

    pub async fn evict_stale(&self, max_age: Duration) -> Result<Vec<PeripheralId>, BridgeError> {
        self.request(|reply| Command::EvictStale { max_age, reply })
            .await
    }

    /// Stop scanning, drop every link, fail outstanding handles with `Closed`
    /// and end the event loop. Returns once the loop has finished.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.inbox
            .send(Input::Shutdown(done_tx))
            .map_err(|_| BridgeError::Closed)?;
        done_rx.await.map_err(|_| BridgeError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_loop<R: RadioAdapter>(
    mut dispatcher: Dispatcher<R>,
    mut inbox: mpsc::UnboundedReceiver<Input>,
) {
    info!("BLE bridge event loop started");

    loop {
        let deadline = dispatcher.next_deadline();
        tokio::select! {
            input = inbox.recv() => match input {
                Some(Input::Command(command)) => execute(&mut dispatcher, command),
                Some(Input::Radio(callback)) => match normalize(callback) {
                    Ok(event) => {
                        match event.peripheral() {
                            Some(id) => trace!("Platform event for {}", id),
                            None => trace!("Adapter-wide platform event"),
                        }
                        dispatcher.handle_event(event, Instant::now())
                    }
                    Err(e) => warn!("Dropping malformed platform callback: {}", e),
                },
                Some(Input::Shutdown(done)) => {
                    dispatcher.shutdown(Instant::now());
                    let _ = done.send(());
                    break;
                }
                None => {
                    debug!("All bridge handles dropped");
                    dispatcher.shutdown(Instant::now());
                    break;
                }
            },
            _ = sleep_until(deadline) => dispatcher.fire_timers(Instant::now()),
        }
    }

    info!("BLE bridge event loop stopped");
}

fn execute<R: RadioAdapter>(dispatcher: &mut Dispatcher<R>, command: Command) {
    let now = Instant::now();
    match command {
        Command::StartScan { request, reply } => {
            let _ = reply.send(dispatcher.start_scan(request, now));
        }
        Command::StopScan { session, reply } => {
            let _ = reply.send(dispatcher.stop_scan(session));
        }
        Command::IsScanning { reply } => {
            let _ = reply.send(Ok(dispatcher.is_scanning()));
        }
        Command::Connect { id, reply } => {
            let _ = reply.send(dispatcher.connect(&id, now));
        }
        Command::Disconnect { id, reply } => {
            let _ = reply.send(dispatcher.disconnect(&id, now));
        }
        Command::DiscoverServices { id, reply } => {
            let _ = reply.send(dispatcher.discover_services(&id));
        }
        Command::Gatt {
            id,
            target,
            request,
            reply,
        } => {
            let _ = reply.send(dispatcher.submit(&id, target, request, now));
        }
        Command::Peripheral { id, reply } => {
            let _ = reply.send(dispatcher.peripheral(&id));
        }
        Command::Peripherals { reply } => {
            let _ = reply.send(Ok(dispatcher.peripherals()));
        }
        Command::ConnectionPhase { id, reply } => {
            let _ = reply.send(dispatcher.connection_phase(&id));
        }
        Command::ConnectionStatus { id, reply } => {
            let _ = reply.send(dispatcher.connection_status(&id));
        }
        Command::Mtu { id, reply } => {
            let _ = reply.send(dispatcher.mtu(&id));
        }
        Command::Evict { id, reply } => {
            let _ = reply.send(dispatcher.evict(&id));
        }
        Command::EvictStale { max_age, reply } => {
            let _ = reply.send(Ok(dispatcher.evict_stale(max_age, now)));
        }
    }
}
