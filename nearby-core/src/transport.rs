//! Transport capability consumed by the coordinator, and the events it reports.
//!
//! Implementations do the actual advertising, browsing and socket work. Calls
//! must not block: queue the work and report the outcome later as a
//! [`TransportEvent`].

use std::fmt;
use std::time::Duration;

use crate::identity::{DiscoveryInfo, PeerHandle};

/// Point-to-point session with one remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Open byte stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Raw transport-level session signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    NotConnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::NotConnected => "not-connected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        })
    }
}

pub trait Transport {
    fn start_advertising(&mut self, info: &DiscoveryInfo) -> Result<(), TransportError>;
    fn stop_advertising(&mut self);
    fn start_browsing(&mut self) -> Result<(), TransportError>;
    fn stop_browsing(&mut self);

    /// Create (or return the existing) session towards `peer`.
    fn open_session(&mut self, peer: &PeerHandle) -> Result<SessionHandle, TransportError>;
    fn close_session(&mut self, session: SessionHandle);

    /// Invite `peer` into `session`, attaching the local discovery info as context.
    fn invite(
        &mut self,
        peer: &PeerHandle,
        session: SessionHandle,
        context: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Accept an inbound invitation from `peer` into `session`.
    fn accept_invitation(
        &mut self,
        peer: &PeerHandle,
        session: SessionHandle,
    ) -> Result<(), TransportError>;

    fn send(&mut self, bytes: &[u8], to: &PeerHandle, reliable: bool)
        -> Result<(), TransportError>;

    fn open_stream(&mut self, to: &PeerHandle, name: &str) -> Result<StreamHandle, TransportError>;
    fn write_stream(&mut self, stream: StreamHandle, bytes: &[u8]) -> Result<(), TransportError>;
    fn close_stream(&mut self, stream: StreamHandle);

    /// Handles the transport currently reports as connected.
    fn connected_peers(&self) -> Vec<PeerHandle>;
}

/// Inbound events from the transport, fed to `Coordinator::handle_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerFound {
        handle: PeerHandle,
        info: Option<DiscoveryInfo>,
    },
    PeerLost {
        handle: PeerHandle,
    },
    /// `context` is the inviter's discovery info, serialized as JSON.
    InvitationReceived {
        handle: PeerHandle,
        context: Vec<u8>,
    },
    SessionStateChanged {
        handle: PeerHandle,
        state: SessionState,
    },
    DataReceived {
        handle: PeerHandle,
        bytes: Vec<u8>,
    },
    Stream {
        handle: PeerHandle,
        event: StreamEvent,
    },
    /// Advertiser or browser failed asynchronously.
    Failed(TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened { stream: StreamHandle, name: String },
    Data { stream: StreamHandle, bytes: Vec<u8> },
    Closed { stream: StreamHandle },
    Failed { stream: StreamHandle, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("advertising failed: {0}")]
    Advertise(String),
    #[error("browsing failed: {0}")]
    Browse(String),
    #[error("no active session for {0}")]
    NoSession(PeerHandle),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerHandle),
    #[error("invite failed: {0}")]
    Invite(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("transport closed")]
    Closed,
}
