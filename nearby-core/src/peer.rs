//! The logical peer record, its state, timers and reconnect backoff.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::identity::{DeviceId, DiscoveryInfo, PeerHandle, PeerIdentity};
use crate::protocol::ProvisionedInfo;
use crate::stream::StreamDecoder;
use crate::transport::{SessionHandle, SessionState, StreamHandle};

/// Connection progress of a peer. `Ord` follows the historical declaration
/// order; use the predicates, not the rank, for decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerState {
    Unknown,
    Hidden,
    Visible,
    Invited,
    Connecting,
    Connected,
    Provisioned,
    Disconnected,
}

impl PeerState {
    /// States from which an invitation may be sent.
    pub fn can_connect(self) -> bool {
        matches!(
            self,
            PeerState::Unknown | PeerState::Visible | PeerState::Disconnected | PeerState::Hidden
        )
    }

    pub fn is_connected(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Provisioned)
    }

    /// Included in the visible collection.
    pub fn is_visible(self) -> bool {
        !matches!(self, PeerState::Unknown | PeerState::Hidden)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Unknown => "unknown",
            PeerState::Hidden => "hidden",
            PeerState::Visible => "visible",
            PeerState::Invited => "invited",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Provisioned => "provisioned",
            PeerState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multiplicative reconnect delay with a floor and a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration, multiplier: f64) -> Self {
        Self {
            floor,
            ceiling,
            multiplier,
            current: floor,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to use now; grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Per-peer deadlines. Each one is valid only in the states listed in
/// [`PeerTimers::retain_for`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PeerTimers {
    pub rsvp: Option<Instant>,
    pub ping: Option<Instant>,
    pub ping_timeout: Option<Instant>,
    pub info_retry: Option<Instant>,
    pub hide: Option<Instant>,
    pub reconnect: Option<Instant>,
}

impl PeerTimers {
    /// Drop every deadline that does not belong to `state`.
    pub fn retain_for(&mut self, state: PeerState) {
        if state != PeerState::Invited {
            self.rsvp = None;
        }
        if !state.is_connected() {
            self.ping = None;
            self.ping_timeout = None;
        }
        if state != PeerState::Connected {
            self.info_retry = None;
        }
        if state != PeerState::Disconnected {
            self.hide = None;
        }
        if !matches!(
            state,
            PeerState::Visible | PeerState::Disconnected | PeerState::Hidden
        ) {
            self.reconnect = None;
        }
    }

    pub fn clear(&mut self) {
        *self = PeerTimers::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == PeerTimers::default()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.rsvp,
            self.ping,
            self.ping_timeout,
            self.info_retry,
            self.hide,
            self.reconnect,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// One remote device across its whole connection lifetime.
#[derive(Debug)]
pub struct Peer {
    pub(crate) identity: PeerIdentity,
    pub(crate) handle: PeerHandle,
    pub(crate) label: String,
    pub(crate) discovery_info: DiscoveryInfo,
    pub(crate) provisioned_info: Option<ProvisionedInfo>,
    pub(crate) state: PeerState,
    pub(crate) session_state: SessionState,
    pub(crate) last_seen_at: Instant,
    pub(crate) last_connected_at: Option<Instant>,
    pub(crate) disconnected_at: Option<Instant>,
    pub(crate) visible_in_discovery: bool,
    pub(crate) session: Option<SessionHandle>,
    pub(crate) streams: HashMap<StreamHandle, StreamDecoder>,
    pub(crate) last_invite_at: Option<Instant>,
    pub(crate) info_retries: u32,
    pub(crate) timers: PeerTimers,
    pub(crate) backoff: Backoff,
}

impl Peer {
    pub fn new(
        identity: PeerIdentity,
        handle: PeerHandle,
        label: String,
        discovery_info: DiscoveryInfo,
        backoff: Backoff,
        now: Instant,
    ) -> Self {
        Self {
            identity,
            handle,
            label,
            discovery_info,
            provisioned_info: None,
            state: PeerState::Unknown,
            session_state: SessionState::NotConnected,
            last_seen_at: now,
            last_connected_at: None,
            disconnected_at: None,
            visible_in_discovery: false,
            session: None,
            streams: HashMap::new(),
            last_invite_at: None,
            info_retries: 0,
            timers: PeerTimers::default(),
            backoff,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.identity.id()
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Transport handle used for outbound traffic.
    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Display name, de-duplicated against other peers.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn discovery_info(&self) -> &DiscoveryInfo {
        &self.discovery_info
    }

    pub fn provisioned_info(&self) -> Option<&ProvisionedInfo> {
        self.provisioned_info.as_ref()
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        self.disconnected_at
    }

    pub fn visible_in_discovery(&self) -> bool {
        self.visible_in_discovery
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.session
    }

    pub fn has_pending_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id(),
            display_name: self.identity.display_name().to_owned(),
            label: self.label.clone(),
            handle: self.handle.clone(),
            state: self.state,
            session_state: self.session_state,
            discovery_info: self.discovery_info.clone(),
            provisioned_info: self.provisioned_info.clone(),
            last_seen_at: self.last_seen_at,
            last_connected_at: self.last_connected_at,
            disconnected_at: self.disconnected_at,
            visible_in_discovery: self.visible_in_discovery,
        }
    }
}

/// Read-only copy of a peer for observers and status output.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub id: DeviceId,
    pub display_name: String,
    pub label: String,
    pub handle: PeerHandle,
    pub state: PeerState,
    pub session_state: SessionState,
    pub discovery_info: DiscoveryInfo,
    pub provisioned_info: Option<ProvisionedInfo>,
    pub last_seen_at: Instant,
    pub last_connected_at: Option<Instant>,
    pub disconnected_at: Option<Instant>,
    pub visible_in_discovery: bool,
}
