/// Connection state machine
///
/// One [`Connection`] per peripheral. The lifecycle is a single tagged enum, so
/// a device can never be in two phases at once; every change goes through
/// [`Connection::apply`], which validates the input against the current state.
/// Callers waiting on connect, discovery or disconnect are parked on the
/// connection and resolved together, which is how concurrent connects coalesce
/// into one radio request.

use crate::error::BridgeError;
use crate::pending::Responder;
use crate::types::{
    ConnectionInfo, ConnectionPhase, DiscoveredCharacteristic, GattTarget, PeripheralId,
    ServiceMap, DEFAULT_ATT_MTU,
};
use std::fmt;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { since: Instant },
    Connected { since: Instant },
    DiscoveringServices { since: Instant },
    Ready { since: Instant },
    /// `requested` is false when the bridge tears the link down itself
    /// (failed discovery)
    Disconnecting { since: Instant, requested: bool },
}

impl ConnectionState {
    pub fn phase(&self) -> ConnectionPhase {
        match self {
            ConnectionState::Disconnected => ConnectionPhase::Disconnected,
            ConnectionState::Connecting { .. } => ConnectionPhase::Connecting,
            ConnectionState::Connected { .. } => ConnectionPhase::Connected,
            ConnectionState::DiscoveringServices { .. } => ConnectionPhase::DiscoveringServices,
            ConnectionState::Ready { .. } => ConnectionPhase::Ready,
            ConnectionState::Disconnecting { .. } => ConnectionPhase::Disconnecting,
        }
    }
}

/// Inputs driving the state machine: commands, hardware results and timer expiries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkInput {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed(String),
    ConnectTimedOut,
    DiscoveryStarted,
    ServicesDiscovered(ServiceMap),
    DiscoveryFailed(String),
    DiscoveryTimedOut,
    DisconnectRequested,
    LinkDown,
    DisconnectTimedOut,
}

impl fmt::Display for LinkInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkInput::ConnectRequested => "connect",
            LinkInput::ConnectSucceeded => "connect-success",
            LinkInput::ConnectFailed(_) => "connect-failure",
            LinkInput::ConnectTimedOut => "connect-timeout",
            LinkInput::DiscoveryStarted => "discovery-start",
            LinkInput::ServicesDiscovered(_) => "services-discovered",
            LinkInput::DiscoveryFailed(_) => "discovery-failure",
            LinkInput::DiscoveryTimedOut => "discovery-timeout",
            LinkInput::DisconnectRequested => "disconnect",
            LinkInput::LinkDown => "link-down",
            LinkInput::DisconnectTimedOut => "disconnect-timeout",
        };
        f.write_str(name)
    }
}

/// Phase before and after an accepted input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
}

impl Transition {
    /// False for coalesced inputs that leave the phase untouched
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Point-in-time view of one connection record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub id: PeripheralId,
    pub phase: ConnectionPhase,
    pub mtu: u16,
    /// Why the link last failed; survives the return to `Disconnected`
    pub last_error: Option<BridgeError>,
}

impl ConnectionStatus {
    /// Status of a known peripheral that never had a connection record
    pub fn idle(id: PeripheralId) -> Self {
        Self {
            id,
            phase: ConnectionPhase::Disconnected,
            mtu: DEFAULT_ATT_MTU,
            last_error: None,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    id: PeripheralId,
    state: ConnectionState,
    mtu: u16,
    services: ServiceMap,
    last_error: Option<BridgeError>,
    connect_waiters: Vec<Responder<ConnectionInfo>>,
    discovery_waiters: Vec<Responder<ServiceMap>>,
    disconnect_waiters: Vec<Responder<()>>,
}

impl Connection {
    pub fn new(id: PeripheralId) -> Self {
        Self {
            id,
            state: ConnectionState::Disconnected,
            mtu: DEFAULT_ATT_MTU,
            services: ServiceMap::new(),
            last_error: None,
            connect_waiters: Vec::new(),
            discovery_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnectionState::Ready { .. })
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu.max(DEFAULT_ATT_MTU);
    }

    pub fn services(&self) -> &ServiceMap {
        &self.services
    }

    pub fn last_error(&self) -> Option<&BridgeError> {
        self.last_error.as_ref()
    }

    pub fn record_error(&mut self, error: BridgeError) {
        self.last_error = Some(error);
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id.clone(),
            phase: self.phase(),
            mtu: self.mtu,
            last_error: self.last_error.clone(),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            mtu: self.mtu,
            services: self.services.clone(),
        }
    }

    /// Look up a discovered characteristic
    pub fn find_characteristic(&self, target: &GattTarget) -> Option<&DiscoveredCharacteristic> {
        self.services
            .get(&target.service)?
            .iter()
            .find(|c| c.uuid == target.characteristic)
    }

    /// Validate `input` against the current state and move to the next one.
    ///
    /// Inputs that the current state does not expect are rejected with
    /// `InvalidState` and leave the connection untouched.
    pub fn apply(&mut self, input: LinkInput, now: Instant) -> Result<Transition, BridgeError> {
        use ConnectionState::*;

        let from = self.state.phase();
        let next = match (&self.state, input) {
            (Disconnected, LinkInput::ConnectRequested) => Connecting { since: now },
            // Coalesced: the caller joins the attempt already under way
            (
                Connecting { .. } | Connected { .. } | DiscoveringServices { .. },
                LinkInput::ConnectRequested,
            ) => self.state,

            (Connecting { .. }, LinkInput::ConnectSucceeded) => Connected { since: now },
            (Connecting { .. }, LinkInput::ConnectFailed(_) | LinkInput::ConnectTimedOut) => {
                Disconnected
            }

            (Connected { .. }, LinkInput::DiscoveryStarted) => DiscoveringServices { since: now },
            (DiscoveringServices { .. }, LinkInput::ServicesDiscovered(services)) => {
                self.services = services;
                Ready { since: now }
            }
            (
                DiscoveringServices { .. },
                LinkInput::DiscoveryFailed(_) | LinkInput::DiscoveryTimedOut,
            ) => Disconnecting {
                since: now,
                requested: false,
            },

            (
                Connecting { .. } | Connected { .. } | DiscoveringServices { .. } | Ready { .. },
                LinkInput::DisconnectRequested,
            ) => Disconnecting {
                since: now,
                requested: true,
            },
            (Disconnecting { .. }, LinkInput::DisconnectRequested) => self.state,

            (Disconnecting { .. }, LinkInput::DisconnectTimedOut) => Disconnected,
            (state, LinkInput::LinkDown) if *state != Disconnected => Disconnected,

            (state, input) => {
                return Err(BridgeError::InvalidState {
                    operation: "connection",
                    detail: format!("{} not accepted while {}", input, state.phase()),
                })
            }
        };

        if next == Disconnected {
            self.services.clear();
            self.mtu = DEFAULT_ATT_MTU;
        }
        self.state = next;
        Ok(Transition {
            from,
            to: self.state.phase(),
        })
    }

    pub fn add_connect_waiter(&mut self, responder: Responder<ConnectionInfo>) {
        self.connect_waiters.push(responder);
    }

    pub fn add_discovery_waiter(&mut self, responder: Responder<ServiceMap>) {
        self.discovery_waiters.push(responder);
    }

    pub fn add_disconnect_waiter(&mut self, responder: Responder<()>) {
        self.disconnect_waiters.push(responder);
    }

    pub fn connect_waiters(&self) -> usize {
        self.connect_waiters.len()
    }

    /// Resolve every parked connect caller with the same outcome
    pub fn resolve_connect(&mut self, result: Result<ConnectionInfo, BridgeError>) {
        for waiter in self.connect_waiters.drain(..) {
            waiter.resolve(result.clone());
        }
    }

    pub fn resolve_discovery(&mut self, result: Result<ServiceMap, BridgeError>) {
        for waiter in self.discovery_waiters.drain(..) {
            waiter.resolve(result.clone());
        }
    }

    pub fn resolve_disconnect(&mut self, result: Result<(), BridgeError>) {
        for waiter in self.disconnect_waiters.drain(..) {
            waiter.resolve(result.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::pending;
    use crate::types::{uuid_from_short, DiscoveredCharacteristic};

    fn services() -> ServiceMap {
        let mut map = ServiceMap::new();
        map.insert(
            uuid_from_short(0x180D),
            vec![DiscoveredCharacteristic {
                uuid: uuid_from_short(0x2A37),
                descriptors: vec![uuid_from_short(0x2902)],
            }],
        );
        map
    }

    fn ready(now: Instant) -> Connection {
        let mut conn = Connection::new(PeripheralId::new("dev-1"));
        conn.apply(LinkInput::ConnectRequested, now).expect("connect");
        conn.apply(LinkInput::ConnectSucceeded, now).expect("connected");
        conn.apply(LinkInput::DiscoveryStarted, now).expect("discovering");
        conn.apply(LinkInput::ServicesDiscovered(services()), now)
            .expect("ready");
        conn
    }

    #[test]
    fn test_happy_path_reaches_ready() {
        let conn = ready(Instant::now());
        assert_eq!(conn.phase(), ConnectionPhase::Ready);
        assert!(conn.is_ready());
        assert!(conn
            .find_characteristic(&GattTarget::new(
                uuid_from_short(0x180D),
                uuid_from_short(0x2A37)
            ))
            .is_some());
    }

    #[test]
    fn test_connect_coalesces_while_connecting() {
        let now = Instant::now();
        let mut conn = Connection::new(PeripheralId::new("dev-1"));
        let first = conn.apply(LinkInput::ConnectRequested, now).expect("connect");
        assert!(first.changed());

        let second = conn.apply(LinkInput::ConnectRequested, now).expect("coalesced");
        assert!(!second.changed());
        assert_eq!(second.to, ConnectionPhase::Connecting);
    }

    #[test]
    fn test_connect_rejected_when_ready() {
        let mut conn = ready(Instant::now());
        let result = conn.apply(LinkInput::ConnectRequested, Instant::now());
        assert!(matches!(result, Err(BridgeError::InvalidState { .. })));
        assert_eq!(conn.phase(), ConnectionPhase::Ready);
    }

    #[test]
    fn test_connect_failure_returns_to_disconnected() {
        let now = Instant::now();
        let mut conn = Connection::new(PeripheralId::new("dev-1"));
        conn.apply(LinkInput::ConnectRequested, now).expect("connect");
        let t = conn
            .apply(LinkInput::ConnectFailed("status 0x85".into()), now)
            .expect("failure");
        assert_eq!(t.to, ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_discovery_failure_tears_down() {
        let now = Instant::now();
        let mut conn = Connection::new(PeripheralId::new("dev-1"));
        conn.apply(LinkInput::ConnectRequested, now).expect("connect");
        conn.apply(LinkInput::ConnectSucceeded, now).expect("connected");
        conn.apply(LinkInput::DiscoveryStarted, now).expect("discovering");

        conn.apply(LinkInput::DiscoveryTimedOut, now).expect("timeout");
        assert_eq!(
            conn.state(),
            ConnectionState::Disconnecting {
                since: now,
                requested: false
            }
        );
        conn.apply(LinkInput::LinkDown, now).expect("down");
        assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_link_down_from_every_live_state() {
        let now = Instant::now();
        let steps = [
            LinkInput::ConnectRequested,
            LinkInput::ConnectSucceeded,
            LinkInput::DiscoveryStarted,
            LinkInput::ServicesDiscovered(services()),
            LinkInput::DisconnectRequested,
        ];
        for depth in 1..=steps.len() {
            let mut conn = Connection::new(PeripheralId::new("dev-1"));
            for step in steps.iter().take(depth) {
                conn.apply(step.clone(), now).expect("step");
            }
            conn.apply(LinkInput::LinkDown, now).expect("link down");
            assert_eq!(conn.phase(), ConnectionPhase::Disconnected);
            assert!(conn.services().is_empty());
            assert_eq!(conn.mtu(), DEFAULT_ATT_MTU);
        }
    }

    #[test]
    fn test_stray_inputs_rejected() {
        let now = Instant::now();
        let mut conn = Connection::new(PeripheralId::new("dev-1"));
        assert!(conn.apply(LinkInput::LinkDown, now).is_err());
        assert!(conn.apply(LinkInput::ConnectSucceeded, now).is_err());
        assert!(conn.apply(LinkInput::DisconnectRequested, now).is_err());

        let mut conn = ready(now);
        assert!(conn
            .apply(LinkInput::ServicesDiscovered(services()), now)
            .is_err());
        assert_eq!(conn.phase(), ConnectionPhase::Ready);
    }

    #[test]
    fn test_waiters_share_outcome() {
        let mut conn = ready(Instant::now());
        let (tx1, mut rx1) = pending();
        let (tx2, mut rx2) = pending();
        conn.add_connect_waiter(tx1);
        conn.add_connect_waiter(tx2);
        assert_eq!(conn.connect_waiters(), 2);

        let info = conn.info();
        conn.resolve_connect(Ok(info.clone()));
        assert_eq!(rx1.try_result(), Some(Ok(info.clone())));
        assert_eq!(rx2.try_result(), Some(Ok(info)));
        assert_eq!(conn.connect_waiters(), 0);
    }

    #[test]
    fn test_mtu_floor() {
        let mut conn = Connection::new(PeripheralId::new("dev-1"));
        conn.set_mtu(10);
        assert_eq!(conn.mtu(), DEFAULT_ATT_MTU);
        conn.set_mtu(247);
        assert_eq!(conn.mtu(), 247);
    }
}
