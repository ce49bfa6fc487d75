//! Session coordinator: the composition root. Owns the transport, the peer
//! registry and the router; the host feeds it events and ticks.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{ConfigError, SessionConfig};
use crate::connectivity::{DisconnectReason, Effect};
use crate::identity::{DeviceId, DiscoveryInfo, IdentityStore, LocalIdentity, PeerHandle};
use crate::observer::{MeshObserver, NoopObserver};
use crate::peer::{Peer, PeerSnapshot, PeerState};
use crate::protocol::{
    encode_message, AvatarMessage, MeshMessage, ProvisionedInfo, RegisterError, SystemMessage,
};
use crate::registry::{PeerRegistry, Resolution};
use crate::router::{Direction, Dispatch, MessageHistory, Router};
use crate::stream::{self, StreamDecoder, StreamError};
use crate::transport::{
    SessionHandle, StreamEvent, StreamHandle, Transport, TransportError, TransportEvent,
};
use crate::wire::{self, FrameEncodeError};

/// Error returned to callers of the coordinator's send and stream APIs.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceId),
    #[error("peer {0} is not connected")]
    NotConnected(DeviceId),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Filtered views over the peer set, recomputed after every state change.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Views {
    connected: Vec<DeviceId>,
    visible: Vec<DeviceId>,
    provisioned: Vec<DeviceId>,
}

pub struct Coordinator<T: Transport> {
    transport: T,
    config: SessionConfig,
    local: LocalIdentity,
    local_provisioned: ProvisionedInfo,
    avatar: Option<AvatarMessage>,
    registry: PeerRegistry,
    router: Router,
    observer: Box<dyn MeshObserver>,
    identity_store: Option<Box<dyn IdentityStore>>,
    active: bool,
    recent_error: Option<TransportError>,
    views: Views,
}

impl<T: Transport> Coordinator<T> {
    /// Fails when the configuration cannot be started.
    pub fn new(transport: T, config: SessionConfig, local: LocalIdentity) -> Result<Self, ConfigError> {
        config.validate()?;
        if local.display_name().trim().is_empty() {
            return Err(ConfigError::MissingDisplayName);
        }
        let registry = PeerRegistry::new(local.identity());
        let router = Router::new(config.history_limit);
        Ok(Self {
            transport,
            config,
            local,
            local_provisioned: ProvisionedInfo::new(),
            avatar: None,
            registry,
            router,
            observer: Box::new(NoopObserver),
            identity_store: None,
            active: false,
            recent_error: None,
            views: Views::default(),
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn MeshObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn set_observer(&mut self, observer: Box<dyn MeshObserver>) {
        self.observer = observer;
    }

    /// Where changes to the local identity are written back.
    pub fn with_identity_store(mut self, store: Box<dyn IdentityStore>) -> Self {
        self.identity_store = Some(store);
        self
    }

    pub fn register_message<M: MeshMessage>(&mut self) -> Result<(), RegisterError> {
        self.router.messages_mut().register::<M>()
    }

    pub fn register_message_type<F>(&mut self, kind: &str, decoder: F) -> Result<(), RegisterError>
    where
        F: Fn(&[u8]) -> Result<Box<dyn std::any::Any + Send>, String> + Send + 'static,
    {
        self.router.messages_mut().register_with(kind, decoder)
    }

    /// Begin advertising and browsing. Idempotent.
    pub fn start(&mut self) {
        if self.active {
            return;
        }
        self.active = true;
        let info = self.local.discovery_info();
        match self.transport.start_advertising(&info) {
            Ok(()) => info!(service = %self.config.service_type, "advertising"),
            Err(e) => self.note_error(e),
        }
        match self.transport.start_browsing() {
            Ok(()) => info!(service = %self.config.service_type, "browsing"),
            Err(e) => self.note_error(e),
        }
    }

    /// Stop advertising and browsing and disconnect every peer. Idempotent.
    pub fn stop(&mut self, now: Instant) {
        if !self.active {
            return;
        }
        self.active = false;
        self.transport.stop_advertising();
        self.transport.stop_browsing();
        for id in self.registry.ids() {
            self.update(id, now, |peer, cfg| {
                peer.disconnect(DisconnectReason::Shutdown, now, cfg)
            });
        }
        info!("stopped");
    }

    pub fn cycle(&mut self, now: Instant) {
        self.stop(now);
        self.start();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one transport event.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::PeerFound { handle, info } => {
                if !self.active {
                    debug!(%handle, "ignoring discovery while stopped");
                    return;
                }
                let Some(id) = self.resolve(&handle, info.as_ref(), now) else {
                    return;
                };
                debug!(%handle, peer = %id, "found");
                self.update(id, now, |peer, cfg| peer.found(info, now, cfg));
            }
            TransportEvent::PeerLost { handle } => {
                if let Some(id) = self.registry.lookup(&handle) {
                    debug!(%handle, peer = %id, "lost");
                    self.update(id, now, |peer, _| {
                        peer.lost();
                        Vec::new()
                    });
                }
            }
            TransportEvent::InvitationReceived { handle, context } => {
                if !self.active {
                    debug!(%handle, "ignoring invitation while stopped");
                    return;
                }
                let info = match serde_json::from_slice::<DiscoveryInfo>(&context) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!(%handle, error = %e, "invitation context is not discovery info");
                        None
                    }
                };
                let Some(id) = self.resolve(&handle, info.as_ref(), now) else {
                    return;
                };
                // No rejection policy: every invitation is accepted.
                debug!(%handle, peer = %id, "accepting invitation");
                self.update(id, now, |peer, cfg| peer.received_invitation(info, now, cfg));
            }
            TransportEvent::SessionStateChanged { handle, state } => {
                if !self.active {
                    debug!(%handle, %state, "ignoring session change while stopped");
                    return;
                }
                let Some(id) = self.registry.lookup(&handle) else {
                    debug!(%handle, %state, "session change for unknown handle");
                    return;
                };
                self.update(id, now, |peer, cfg| peer.session_state_changed(state, now, cfg));
            }
            TransportEvent::DataReceived { handle, bytes } => self.receive(&handle, &bytes, now),
            TransportEvent::Stream { handle, event } => self.stream_event(&handle, event, now),
            TransportEvent::Failed(e) => self.note_error(e),
        }
    }

    /// Fire due per-peer timers. Nothing fires while stopped.
    pub fn tick(&mut self, now: Instant) {
        if !self.active {
            return;
        }
        let connected: HashSet<PeerHandle> = self.transport.connected_peers().into_iter().collect();
        for id in self.registry.ids() {
            let transport_connected = self.registry.handles_of(&id).any(|h| connected.contains(h));
            self.update(id, now, |peer, cfg| peer.tick(now, cfg, transport_connected));
        }
    }

    /// Resolve a handle to its peer, creating it if needed. `None` for the local device.
    pub fn resolve(
        &mut self,
        handle: &PeerHandle,
        info: Option<&DiscoveryInfo>,
        now: Instant,
    ) -> Option<DeviceId> {
        let resolution = self.registry.resolve(handle, info, now, &self.config);
        if let Resolution::Created(id) = resolution {
            self.refresh_views();
            if let Some(peer) = self.registry.get(&id) {
                info!(peer = %peer.label(), %handle, "created device");
            }
        }
        resolution.id()
    }

    /// Send one application message to a connected peer.
    pub fn send_to<M: MeshMessage>(
        &mut self,
        id: &DeviceId,
        message: &M,
        now: Instant,
    ) -> Result<(), MeshError> {
        let bytes = encode_message(message)?;
        self.send_connected(id, M::KIND, &bytes, now)
    }

    /// Send to every connected peer. Per-peer failures are logged and skipped;
    /// returns how many peers the message went to.
    pub fn send_to_all<M: MeshMessage>(&mut self, message: &M, now: Instant) -> Result<usize, MeshError> {
        let bytes = encode_message(message)?;
        Ok(self.broadcast(M::KIND, &bytes, now))
    }

    /// Send a key-value dictionary to every connected peer.
    pub fn send_dictionary_to_all(
        &mut self,
        info: std::collections::BTreeMap<String, String>,
        now: Instant,
    ) -> Result<usize, MeshError> {
        let message = SystemMessage::Dictionary(info);
        let bytes = message.encode()?;
        Ok(self.broadcast(message.kind().tag(), &bytes, now))
    }

    fn broadcast(&mut self, kind: &str, bytes: &[u8], now: Instant) -> usize {
        let mut delivered = 0;
        for id in self.views.connected.clone() {
            match self.send_connected(&id, kind, bytes, now) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %id, kind, error = %e, "broadcast send failed"),
            }
        }
        delivered
    }

    fn send_connected(
        &mut self,
        id: &DeviceId,
        kind: &str,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), MeshError> {
        let peer = self.registry.get(id).ok_or(MeshError::UnknownPeer(*id))?;
        if !peer.state().is_connected() {
            return Err(MeshError::NotConnected(*id));
        }
        self.transmit(id, kind, bytes, now)?;
        Ok(())
    }

    /// Write bytes to the peer's transport without checking its state.
    fn transmit(
        &mut self,
        id: &DeviceId,
        kind: &str,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), TransportError> {
        let Some(peer) = self.registry.get(id) else {
            return Err(TransportError::Closed);
        };
        let handle = peer.handle().clone();
        debug!(peer = %peer.label(), kind, len = bytes.len(), "sending");
        self.router
            .record(now, Direction::Outbound, *id, kind, bytes.len());
        let result = self.transport.send(bytes, &handle, true);
        if let Err(e) = &result {
            self.note_error(e.clone());
        }
        result
    }

    fn send_system(&mut self, id: &DeviceId, message: &SystemMessage, now: Instant) {
        match message.encode() {
            Ok(bytes) => {
                let _ = self.transmit(id, message.kind().tag(), &bytes, now);
            }
            Err(e) => warn!(kind = %message.kind(), error = %e, "system message encode failed"),
        }
    }

    fn device_info_message(&self) -> SystemMessage {
        SystemMessage::DeviceInfo(self.local.discovery_info())
    }

    /// Explicitly disconnect one peer, telling it first.
    pub fn disconnect(&mut self, id: &DeviceId, now: Instant) {
        self.update(*id, now, |peer, cfg| {
            peer.disconnect(DisconnectReason::Local, now, cfg)
        });
    }

    /// Replace the advertised info: persist it, re-advertise and push it to connected peers.
    pub fn set_local_discovery_info(&mut self, info: DiscoveryInfo, now: Instant) {
        if !self.local.set_discovery_info(info) {
            return;
        }
        if let Some(store) = self.identity_store.as_mut() {
            if let Err(e) = store.save_local_identity(&self.local) {
                warn!(error = %e, "local identity not saved");
            }
        }
        if self.active {
            self.transport.stop_advertising();
            let info = self.local.discovery_info();
            if let Err(e) = self.transport.start_advertising(&info) {
                self.note_error(e);
            }
        }
        let message = self.device_info_message();
        for id in self.views.connected.clone() {
            self.send_system(&id, &message, now);
        }
    }

    /// Replace the local provisioned info and send it to provisioned peers.
    pub fn set_local_provisioned_info(&mut self, info: ProvisionedInfo, now: Instant) {
        if info == self.local_provisioned {
            return;
        }
        self.local_provisioned = info;
        let message = SystemMessage::Provision(self.local_provisioned.clone());
        for id in self.views.provisioned.clone() {
            self.send_system(&id, &message, now);
        }
    }

    pub fn set_avatar(&mut self, avatar: Option<AvatarMessage>) {
        self.avatar = avatar;
    }

    pub fn open_stream(&mut self, id: &DeviceId, name: &str) -> Result<StreamHandle, MeshError> {
        let peer = self.registry.get_mut(id).ok_or(MeshError::UnknownPeer(*id))?;
        if !peer.state().is_connected() {
            return Err(MeshError::NotConnected(*id));
        }
        let stream = self.transport.open_stream(&peer.handle, name)?;
        peer.streams
            .insert(stream, StreamDecoder::new(self.config.max_stream_chunk));
        debug!(peer = %peer.label, name, "stream opened");
        Ok(stream)
    }

    /// Write one chunk. A failed write closes just that stream.
    pub fn send_stream(
        &mut self,
        id: &DeviceId,
        stream: StreamHandle,
        bytes: &[u8],
    ) -> Result<(), MeshError> {
        let peer = self.registry.get_mut(id).ok_or(MeshError::UnknownPeer(*id))?;
        if !peer.streams.contains_key(&stream) {
            return Err(StreamError::Closed.into());
        }
        if bytes.len() > self.config.max_stream_chunk {
            return Err(StreamError::TooLarge(bytes.len()).into());
        }
        let chunk = stream::encode_chunk(bytes)?;
        if let Err(e) = self.transport.write_stream(stream, &chunk) {
            warn!(peer = %peer.label, error = %e, "stream write failed, closing stream");
            peer.streams.remove(&stream);
            self.transport.close_stream(stream);
            return Err(StreamError::Transport(e.to_string()).into());
        }
        Ok(())
    }

    pub fn close_stream(&mut self, id: &DeviceId, stream: StreamHandle) {
        if let Some(peer) = self.registry.get_mut(id) {
            if peer.streams.remove(&stream).is_some() {
                self.transport.close_stream(stream);
            }
        }
    }

    pub fn peer(&self, id: &DeviceId) -> Option<PeerSnapshot> {
        self.registry.get(id).map(Peer::snapshot)
    }

    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let mut all: Vec<_> = self.registry.iter().map(Peer::snapshot).collect();
        all.sort_by(|a, b| a.label.cmp(&b.label));
        all
    }

    pub fn connected(&self) -> &[DeviceId] {
        &self.views.connected
    }

    pub fn visible(&self) -> &[DeviceId] {
        &self.views.visible
    }

    pub fn provisioned(&self) -> &[DeviceId] {
        &self.views.provisioned
    }

    /// Last transport failure, for operators.
    pub fn recent_error(&self) -> Option<&TransportError> {
        self.recent_error.as_ref()
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn history(&self) -> &MessageHistory {
        self.router.history()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Earliest pending peer deadline; hosts may sleep until then.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.iter().filter_map(Peer::next_deadline).min()
    }

    fn note_error(&mut self, e: TransportError) {
        warn!(error = %e, "transport error");
        self.recent_error = Some(e);
    }

    /// Run one transition on a peer, carry out its effects, notify on change.
    fn update<F>(&mut self, id: DeviceId, now: Instant, transition: F)
    where
        F: FnOnce(&mut Peer, &SessionConfig) -> Vec<Effect>,
    {
        let Some(peer) = self.registry.get_mut(&id) else {
            return;
        };
        let before = (peer.state(), peer.visible_in_discovery());
        let effects = transition(peer, &self.config);
        self.apply(&id, effects, now);
        self.after_change(&id, before);
    }

    fn after_change(&mut self, id: &DeviceId, before: (PeerState, bool)) {
        let Some(peer) = self.registry.get(id) else {
            return;
        };
        if (peer.state(), peer.visible_in_discovery()) == before {
            return;
        }
        let snapshot = peer.snapshot();
        if snapshot.state != before.0 {
            info!(peer = %snapshot.label, state = %snapshot.state, "peer state");
        }
        self.refresh_views();
        self.observer.on_state_changed(&snapshot);
    }

    fn refresh_views(&mut self) {
        let mut peers: Vec<&Peer> = self.registry.iter().collect();
        peers.sort_by(|a, b| a.label().cmp(b.label()));
        let pick = |f: fn(PeerState) -> bool| -> Vec<DeviceId> {
            peers.iter().filter(|p| f(p.state())).map(|p| p.id()).collect()
        };
        self.views = Views {
            connected: pick(PeerState::is_connected),
            visible: pick(PeerState::is_visible),
            provisioned: pick(|s| s == PeerState::Provisioned),
        };
    }

    fn ensure_session(&mut self, id: &DeviceId) -> Result<SessionHandle, TransportError> {
        let peer = self.registry.get_mut(id).ok_or(TransportError::Closed)?;
        if let Some(session) = peer.session {
            return Ok(session);
        }
        let session = self.transport.open_session(&peer.handle)?;
        peer.session = Some(session);
        Ok(session)
    }

    fn apply(&mut self, id: &DeviceId, effects: Vec<Effect>, now: Instant) {
        for effect in effects {
            let Some(peer) = self.registry.get_mut(id) else {
                return;
            };
            let handle = peer.handle().clone();
            match effect {
                Effect::EnsureSession => {
                    if let Err(e) = self.ensure_session(id) {
                        self.note_error(e);
                    }
                }
                Effect::Invite { reinvite } => {
                    let context = match serde_json::to_vec(&self.local.discovery_info()) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(error = %e, "invitation context encode failed");
                            Vec::new()
                        }
                    };
                    let timeout = self.config.invitation_timeout;
                    let result = self
                        .ensure_session(id)
                        .and_then(|s| self.transport.invite(&handle, s, &context, timeout));
                    match result {
                        Ok(()) if reinvite => info!(%handle, "reinvited"),
                        Ok(()) => debug!(%handle, "invited"),
                        Err(e) => {
                            self.note_error(e);
                            if let Some(peer) = self.registry.get_mut(id) {
                                peer.invite_failed(now, &self.config);
                            }
                        }
                    }
                }
                Effect::AcceptInvitation => {
                    let result = self
                        .ensure_session(id)
                        .and_then(|s| self.transport.accept_invitation(&handle, s));
                    if let Err(e) = result {
                        self.note_error(e);
                    }
                }
                Effect::CloseSession => {
                    if let Some(session) = peer.session.take() {
                        self.transport.close_session(session);
                    }
                }
                Effect::CloseStreams => {
                    for (stream, _) in peer.streams.drain() {
                        self.transport.close_stream(stream);
                    }
                }
                Effect::Send(message) => self.send_system(id, &message, now),
                Effect::SendDeviceInfo => {
                    let message = self.device_info_message();
                    self.send_system(id, &message, now);
                }
            }
        }
    }

    /// Inbound bytes. Decode failures are logged and dropped; they never
    /// tear the connection down.
    fn receive(&mut self, handle: &PeerHandle, bytes: &[u8], now: Instant) {
        let Some(id) = self.registry.lookup(handle) else {
            warn!(%handle, len = bytes.len(), "data from unknown handle dropped");
            return;
        };
        let Some(peer) = self.registry.get_mut(&id) else {
            return;
        };
        let before = (peer.state(), peer.visible_in_discovery());
        peer.note_traffic(now, &self.config);
        let label = peer.label().to_owned();
        debug!(peer = %label, len = bytes.len(), "receiving");

        match self.router.dispatch(bytes, id, now) {
            Err(e) => warn!(peer = %label, error = %e, "dropping frame"),
            Ok(Dispatch::Heartbeat) => {}
            Ok(Dispatch::Disconnect) => {
                if let Some(peer) = self.registry.get_mut(&id) {
                    let effects = peer.disconnect(DisconnectReason::Remote, now, &self.config);
                    self.apply(&id, effects, now);
                }
            }
            Ok(Dispatch::MergeInfo(info)) => {
                let Some(peer) = self.registry.get_mut(&id) else {
                    return;
                };
                let merge = peer.merge_info(info, now, &self.config);
                let snapshot = peer.snapshot();
                if merge.first {
                    let reply = self.device_info_message();
                    self.send_system(&id, &reply, now);
                    self.observer.on_first_info_received(&snapshot);
                } else if merge.changed {
                    self.observer.on_info_changed(&snapshot);
                }
            }
            Ok(Dispatch::ReplyDeviceInfo) => {
                let reply = self.device_info_message();
                self.send_system(&id, &reply, now);
            }
            Ok(Dispatch::ReplyAvatar) => match self.avatar.clone() {
                Some(avatar) => self.send_system(&id, &SystemMessage::Avatar(avatar), now),
                None => debug!(peer = %label, "avatar requested but none set"),
            },
            Ok(Dispatch::Deliver(message)) => {
                if let Some(peer) = self.registry.get(&id) {
                    let snapshot = peer.snapshot();
                    self.observer.on_message_received(message, &snapshot);
                }
            }
        }
        self.after_change(&id, before);
    }

    fn stream_event(&mut self, handle: &PeerHandle, event: StreamEvent, now: Instant) {
        let Some(id) = self.registry.lookup(handle) else {
            warn!(%handle, "stream event from unknown handle dropped");
            return;
        };
        let Some(peer) = self.registry.get_mut(&id) else {
            return;
        };
        match event {
            StreamEvent::Opened { stream, name } => {
                debug!(peer = %peer.label, name = %name, "inbound stream");
                peer.streams
                    .insert(stream, StreamDecoder::new(self.config.max_stream_chunk));
            }
            StreamEvent::Data { stream, bytes } => {
                peer.note_traffic(now, &self.config);
                let Some(decoder) = peer.streams.get_mut(&stream) else {
                    warn!(peer = %peer.label, "data for unknown stream dropped");
                    return;
                };
                match decoder.push(&bytes) {
                    Ok(chunks) => {
                        let snapshot = peer.snapshot();
                        for chunk in chunks {
                            self.observer.on_stream_chunk(&snapshot, stream, chunk);
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer.label, error = %e, "stream failed, closing it");
                        peer.streams.remove(&stream);
                        self.transport.close_stream(stream);
                    }
                }
            }
            StreamEvent::Closed { stream } => {
                peer.streams.remove(&stream);
            }
            StreamEvent::Failed { stream, reason } => {
                warn!(peer = %peer.label, %reason, "stream failed");
                if peer.streams.remove(&stream).is_some() {
                    self.transport.close_stream(stream);
                }
            }
        }
    }
}

/// Decode a bare frame's kind, for hosts that log traffic.
pub fn frame_kind(bytes: &[u8]) -> Option<&str> {
    wire::peek_kind(bytes).ok()
}
