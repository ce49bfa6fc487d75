//! LAN transport: TCP sessions between peers found by the beacon discovery.
//!
//! [`LanTransport`] is the synchronous face handed to the coordinator; it only
//! queues [`NetCommand`]s. [`run_sessions`] owns every connection and reports
//! back through the transport event channel. Packets on a connection are
//! bincode, framed with the core stream chunk framing.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use nearby_core::stream::{encode_chunk, StreamDecoder};
use nearby_core::{
    DiscoveryInfo, PeerHandle, SessionHandle, SessionState, StreamEvent, StreamHandle, Transport,
    TransportError, TransportEvent,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::discovery::AddressBook;

/// Largest packet accepted on a session connection.
const MAX_PACKET: usize = 8 * 1024 * 1024;
/// Stream handles for streams the remote side opened.
const INBOUND_STREAM: u64 = 1 << 63;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Packet {
    Hello { handle: String, context: Vec<u8> },
    Accept,
    Data(Vec<u8>),
    StreamOpen { id: u64, name: String },
    StreamData { id: u64, bytes: Vec<u8> },
    /// `opener` is true when the sender opened the stream.
    StreamClose { id: u64, opener: bool },
    Bye,
}

fn encode_packet(packet: &Packet) -> std::io::Result<Vec<u8>> {
    let body = bincode::serialize(packet)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    encode_chunk(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[derive(Debug)]
pub enum NetCommand {
    Invite {
        handle: PeerHandle,
        addr: SocketAddr,
        context: Vec<u8>,
        timeout: Duration,
    },
    Accept { handle: PeerHandle },
    Send { handle: PeerHandle, bytes: Vec<u8> },
    OpenStream { handle: PeerHandle, stream: StreamHandle, name: String },
    WriteStream { stream: StreamHandle, bytes: Vec<u8> },
    CloseStream { stream: StreamHandle },
    Close { handle: PeerHandle },
}

/// Receiving ends of the channels [`LanTransport`] writes to.
pub struct NetSide {
    pub commands: mpsc::UnboundedReceiver<NetCommand>,
    pub advert: watch::Receiver<Option<DiscoveryInfo>>,
    pub browsing: watch::Receiver<bool>,
    pub connected: watch::Sender<HashSet<PeerHandle>>,
}

pub struct LanTransport {
    commands: mpsc::UnboundedSender<NetCommand>,
    advert: watch::Sender<Option<DiscoveryInfo>>,
    browsing: watch::Sender<bool>,
    connected: watch::Receiver<HashSet<PeerHandle>>,
    book: AddressBook,
    sessions: HashMap<SessionHandle, PeerHandle>,
    by_peer: HashMap<PeerHandle, SessionHandle>,
    next_id: u64,
}

impl LanTransport {
    pub fn new(book: AddressBook) -> (Self, NetSide) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (advert_tx, advert_rx) = watch::channel(None);
        let (browsing_tx, browsing_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(HashSet::new());
        let transport = Self {
            commands: commands_tx,
            advert: advert_tx,
            browsing: browsing_tx,
            connected: connected_rx,
            book,
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            next_id: 0,
        };
        let side = NetSide {
            commands: commands_rx,
            advert: advert_rx,
            browsing: browsing_rx,
            connected: connected_tx,
        };
        (transport, side)
    }

    fn queue(&self, command: NetCommand) -> Result<(), TransportError> {
        self.commands.send(command).map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self, peer: &PeerHandle) -> bool {
        self.connected.borrow().contains(peer)
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Transport for LanTransport {
    fn start_advertising(&mut self, info: &DiscoveryInfo) -> Result<(), TransportError> {
        self.advert.send_replace(Some(info.clone()));
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.advert.send_replace(None);
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        self.browsing.send_replace(true);
        Ok(())
    }

    fn stop_browsing(&mut self) {
        self.browsing.send_replace(false);
    }

    fn open_session(&mut self, peer: &PeerHandle) -> Result<SessionHandle, TransportError> {
        if let Some(session) = self.by_peer.get(peer) {
            return Ok(*session);
        }
        let session = SessionHandle(self.next());
        self.sessions.insert(session, peer.clone());
        self.by_peer.insert(peer.clone(), session);
        Ok(session)
    }

    fn close_session(&mut self, session: SessionHandle) {
        if let Some(peer) = self.sessions.remove(&session) {
            self.by_peer.remove(&peer);
            let _ = self.queue(NetCommand::Close { handle: peer });
        }
    }

    fn invite(
        &mut self,
        peer: &PeerHandle,
        _session: SessionHandle,
        context: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let addr = {
            let book = match self.book.lock() {
                Ok(b) => b,
                Err(poisoned) => poisoned.into_inner(),
            };
            book.get(peer).copied()
        };
        let addr = addr.ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        self.queue(NetCommand::Invite {
            handle: peer.clone(),
            addr,
            context: context.to_vec(),
            timeout,
        })
    }

    fn accept_invitation(
        &mut self,
        peer: &PeerHandle,
        _session: SessionHandle,
    ) -> Result<(), TransportError> {
        self.queue(NetCommand::Accept {
            handle: peer.clone(),
        })
    }

    fn send(&mut self, bytes: &[u8], to: &PeerHandle, _reliable: bool) -> Result<(), TransportError> {
        // TCP only; every send is reliable.
        if !self.is_connected(to) {
            return Err(TransportError::NoSession(to.clone()));
        }
        self.queue(NetCommand::Send {
            handle: to.clone(),
            bytes: bytes.to_vec(),
        })
    }

    fn open_stream(&mut self, to: &PeerHandle, name: &str) -> Result<StreamHandle, TransportError> {
        if !self.is_connected(to) {
            return Err(TransportError::NoSession(to.clone()));
        }
        let stream = StreamHandle(self.next());
        self.queue(NetCommand::OpenStream {
            handle: to.clone(),
            stream,
            name: name.to_owned(),
        })?;
        Ok(stream)
    }

    fn write_stream(&mut self, stream: StreamHandle, bytes: &[u8]) -> Result<(), TransportError> {
        self.queue(NetCommand::WriteStream {
            stream,
            bytes: bytes.to_vec(),
        })
        .map_err(|_| TransportError::Stream("session task gone".into()))
    }

    fn close_stream(&mut self, stream: StreamHandle) {
        let _ = self.queue(NetCommand::CloseStream { stream });
    }

    fn connected_peers(&self) -> Vec<PeerHandle> {
        self.connected.borrow().iter().cloned().collect()
    }
}

enum LinkEvent {
    Packet { link: u64, packet: Packet },
    Closed { link: u64 },
}

struct Link {
    handle: Option<PeerHandle>,
    writer: mpsc::UnboundedSender<Packet>,
    open: bool,
}

struct StreamRoute {
    handle: PeerHandle,
    wire_id: u64,
    opened_here: bool,
}

/// Owner of every connection; runs inside [`run_sessions`].
struct Sessions {
    local: PeerHandle,
    links: HashMap<u64, Link>,
    by_handle: HashMap<PeerHandle, u64>,
    streams: HashMap<StreamHandle, StreamRoute>,
    next_link: u64,
    next_inbound: u64,
    connected: watch::Sender<HashSet<PeerHandle>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    reports: mpsc::UnboundedSender<LinkEvent>,
}

impl Sessions {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn set_connected(&self, handle: &PeerHandle, up: bool) {
        self.connected.send_modify(|set| {
            if up {
                set.insert(handle.clone());
            } else {
                set.remove(handle);
            }
        });
    }

    fn new_link(&mut self, handle: Option<PeerHandle>) -> (u64, mpsc::UnboundedReceiver<Packet>) {
        self.next_link += 1;
        let (writer, outgoing) = mpsc::unbounded_channel();
        self.links.insert(
            self.next_link,
            Link {
                handle,
                writer,
                open: false,
            },
        );
        (self.next_link, outgoing)
    }

    fn accepted(&mut self, link: u64) {
        let Some(l) = self.links.get_mut(&link) else {
            return;
        };
        l.open = true;
        if let Some(handle) = l.handle.clone() {
            self.set_connected(&handle, true);
            info!(%handle, "session connected");
            self.emit(TransportEvent::SessionStateChanged {
                handle,
                state: SessionState::Connected,
            });
        }
    }

    fn link_for(&self, handle: &PeerHandle) -> Option<&Link> {
        self.by_handle.get(handle).and_then(|id| self.links.get(id))
    }

    fn command(&mut self, command: NetCommand) {
        match command {
            NetCommand::Invite {
                handle,
                addr,
                context,
                timeout,
            } => {
                if self.by_handle.contains_key(&handle) {
                    debug!(%handle, "already linked, invite skipped");
                    return;
                }
                let (link, outgoing) = self.new_link(Some(handle.clone()));
                self.by_handle.insert(handle.clone(), link);
                self.emit(TransportEvent::SessionStateChanged {
                    handle,
                    state: SessionState::Connecting,
                });
                let hello = Packet::Hello {
                    handle: self.local.as_str().to_owned(),
                    context,
                };
                let reports = self.reports.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => run_link(stream, link, Some(hello), outgoing, reports).await,
                        Ok(Err(e)) => {
                            debug!(%addr, error = %e, "connect failed");
                            let _ = reports.send(LinkEvent::Closed { link });
                        }
                        Err(_) => {
                            debug!(%addr, "invitation timed out");
                            let _ = reports.send(LinkEvent::Closed { link });
                        }
                    }
                });
            }
            NetCommand::Accept { handle } => {
                let Some(&link) = self.by_handle.get(&handle) else {
                    warn!(%handle, "accept for unknown link");
                    return;
                };
                if let Some(l) = self.links.get(&link) {
                    let _ = l.writer.send(Packet::Accept);
                }
                self.accepted(link);
            }
            NetCommand::Send { handle, bytes } => match self.link_for(&handle) {
                Some(l) if l.open => {
                    let _ = l.writer.send(Packet::Data(bytes));
                }
                _ => debug!(%handle, "send without open link dropped"),
            },
            NetCommand::OpenStream {
                handle,
                stream,
                name,
            } => {
                if let Some(l) = self.link_for(&handle) {
                    let _ = l.writer.send(Packet::StreamOpen { id: stream.0, name });
                    self.streams.insert(
                        stream,
                        StreamRoute {
                            handle,
                            wire_id: stream.0,
                            opened_here: true,
                        },
                    );
                }
            }
            NetCommand::WriteStream { stream, bytes } => {
                if let Some(route) = self.streams.get(&stream) {
                    if let Some(l) = self.link_for(&route.handle) {
                        let _ = l.writer.send(Packet::StreamData {
                            id: route.wire_id,
                            bytes,
                        });
                    }
                }
            }
            NetCommand::CloseStream { stream } => {
                if let Some(route) = self.streams.remove(&stream) {
                    if let Some(l) = self.link_for(&route.handle) {
                        let _ = l.writer.send(Packet::StreamClose {
                            id: route.wire_id,
                            opener: route.opened_here,
                        });
                    }
                }
            }
            NetCommand::Close { handle } => {
                if let Some(link) = self.by_handle.remove(&handle) {
                    if let Some(l) = self.links.remove(&link) {
                        let _ = l.writer.send(Packet::Bye);
                    }
                    self.drop_streams(&handle);
                    self.set_connected(&handle, false);
                }
            }
        }
    }

    fn drop_streams(&mut self, handle: &PeerHandle) {
        self.streams.retain(|_, route| route.handle != *handle);
    }

    fn find_stream(&self, handle: &PeerHandle, wire_id: u64, opened_here: bool) -> Option<StreamHandle> {
        self.streams
            .iter()
            .find(|(_, r)| r.handle == *handle && r.wire_id == wire_id && r.opened_here == opened_here)
            .map(|(s, _)| *s)
    }

    fn link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Closed { link } => self.link_closed(link),
            LinkEvent::Packet { link, packet } => self.packet(link, packet),
        }
    }

    fn link_closed(&mut self, link: u64) {
        let Some(l) = self.links.remove(&link) else {
            return;
        };
        let Some(handle) = l.handle else {
            return;
        };
        if self.by_handle.get(&handle) != Some(&link) {
            return;
        }
        self.by_handle.remove(&handle);
        self.drop_streams(&handle);
        self.set_connected(&handle, false);
        info!(%handle, "session closed");
        self.emit(TransportEvent::SessionStateChanged {
            handle,
            state: SessionState::NotConnected,
        });
    }

    fn packet(&mut self, link: u64, packet: Packet) {
        let Some(handle) = self.links.get(&link).map(|l| l.handle.clone()) else {
            return;
        };
        match (packet, handle) {
            (Packet::Hello { handle, context }, None) => self.hello(link, PeerHandle::new(handle), context),
            (Packet::Accept, Some(_)) => self.accepted(link),
            (Packet::Bye, _) => self.link_closed(link),
            (Packet::Data(bytes), Some(handle)) => {
                self.emit(TransportEvent::DataReceived { handle, bytes });
            }
            (Packet::StreamOpen { id, name }, Some(handle)) => {
                self.next_inbound += 1;
                let stream = StreamHandle(INBOUND_STREAM | self.next_inbound);
                self.streams.insert(
                    stream,
                    StreamRoute {
                        handle: handle.clone(),
                        wire_id: id,
                        opened_here: false,
                    },
                );
                self.emit(TransportEvent::Stream {
                    handle,
                    event: StreamEvent::Opened { stream, name },
                });
            }
            (Packet::StreamData { id, bytes }, Some(handle)) => {
                // Data only flows from opener to acceptor.
                if let Some(stream) = self.find_stream(&handle, id, false) {
                    self.emit(TransportEvent::Stream {
                        handle,
                        event: StreamEvent::Data { stream, bytes },
                    });
                }
            }
            (Packet::StreamClose { id, opener }, Some(handle)) => {
                if let Some(stream) = self.find_stream(&handle, id, !opener) {
                    self.streams.remove(&stream);
                    self.emit(TransportEvent::Stream {
                        handle,
                        event: StreamEvent::Closed { stream },
                    });
                }
            }
            (packet, handle) => {
                warn!(?handle, ?packet, "unexpected packet, closing link");
                if let Some(l) = self.links.get(&link) {
                    let _ = l.writer.send(Packet::Bye);
                }
                self.link_closed(link);
            }
        }
    }

    /// Inbound connection introduced itself.
    fn hello(&mut self, link: u64, remote: PeerHandle, context: Vec<u8>) {
        if let Some(&existing) = self.by_handle.get(&remote) {
            let existing_open = self.links.get(&existing).is_some_and(|l| l.open);
            // Crossed invitations: the one sent by the smaller handle wins.
            if existing_open || self.local < remote {
                debug!(handle = %remote, "duplicate link refused");
                if let Some(l) = self.links.remove(&link) {
                    let _ = l.writer.send(Packet::Bye);
                }
                return;
            }
            self.links.remove(&existing);
        }
        if let Some(l) = self.links.get_mut(&link) {
            l.handle = Some(remote.clone());
        }
        self.by_handle.insert(remote.clone(), link);
        self.emit(TransportEvent::InvitationReceived {
            handle: remote,
            context,
        });
    }
}

/// Accept connections and execute transport commands until the command channel closes.
pub async fn run_sessions(
    listener: TcpListener,
    local: PeerHandle,
    mut commands: mpsc::UnboundedReceiver<NetCommand>,
    connected: watch::Sender<HashSet<PeerHandle>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<()> {
    let (reports, mut link_events) = mpsc::unbounded_channel();
    let mut sessions = Sessions {
        local,
        links: HashMap::new(),
        by_handle: HashMap::new(),
        streams: HashMap::new(),
        next_link: 0,
        next_inbound: 0,
        connected,
        events,
        reports,
    };
    info!(addr = ?listener.local_addr().ok(), "sessions listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                debug!(%addr, "inbound connection");
                let (link, outgoing) = sessions.new_link(None);
                let reports = sessions.reports.clone();
                tokio::spawn(run_link(stream, link, None, outgoing, reports));
            }
            command = commands.recv() => match command {
                Some(command) => sessions.command(command),
                None => return Ok(()),
            },
            Some(event) = link_events.recv() => sessions.link_event(event),
        }
    }
}

/// Pump one TCP connection: decode inbound packets, write queued ones.
async fn run_link(
    stream: TcpStream,
    link: u64,
    hello: Option<Packet>,
    mut outgoing: mpsc::UnboundedReceiver<Packet>,
    reports: mpsc::UnboundedSender<LinkEvent>,
) {
    if let Err(e) = pump(stream, link, hello, &mut outgoing, &reports).await {
        debug!(link, error = %e, "link ended");
    }
    let _ = reports.send(LinkEvent::Closed { link });
}

async fn pump(
    stream: TcpStream,
    link: u64,
    hello: Option<Packet>,
    outgoing: &mut mpsc::UnboundedReceiver<Packet>,
    reports: &mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    if let Some(hello) = hello {
        writer.write_all(&encode_packet(&hello)?).await?;
    }
    let mut decoder = StreamDecoder::new(MAX_PACKET);
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                let chunks = decoder
                    .push(&buf[..n])
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                for chunk in chunks {
                    match bincode::deserialize::<Packet>(&chunk) {
                        Ok(packet) => {
                            let _ = reports.send(LinkEvent::Packet { link, packet });
                        }
                        Err(e) => warn!(link, error = %e, "undecodable packet dropped"),
                    }
                }
            }
            packet = outgoing.recv() => {
                let Some(packet) = packet else {
                    return Ok(());
                };
                let bye = packet == Packet::Bye;
                writer.write_all(&encode_packet(&packet)?).await?;
                if bye {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn transport() -> (LanTransport, NetSide, AddressBook) {
        let book: AddressBook = Arc::new(Mutex::new(HashMap::new()));
        let (t, side) = LanTransport::new(book.clone());
        (t, side, book)
    }

    #[test]
    fn packets_are_length_framed_bincode() {
        let bytes = encode_packet(&Packet::Data(vec![1, 2, 3])).unwrap();
        let mut decoder = StreamDecoder::new(MAX_PACKET);
        let chunks = decoder.push(&bytes).unwrap();
        assert_eq!(chunks.len(), 1);
        let packet: Packet = bincode::deserialize(&chunks[0]).unwrap();
        assert_eq!(packet, Packet::Data(vec![1, 2, 3]));
    }

    #[test]
    fn advertising_and_browsing_flip_watches() {
        let (mut t, side, _) = transport();
        let mut info = DiscoveryInfo::new();
        info.insert("name".into(), "Desk".into());
        t.start_advertising(&info).unwrap();
        t.start_browsing().unwrap();
        assert_eq!(side.advert.borrow().as_ref(), Some(&info));
        assert!(*side.browsing.borrow());
        t.stop_advertising();
        t.stop_browsing();
        assert!(side.advert.borrow().is_none());
        assert!(!*side.browsing.borrow());
    }

    #[test]
    fn invite_needs_a_known_address() {
        let (mut t, mut side, book) = transport();
        let peer = PeerHandle::new("p");
        let session = t.open_session(&peer).unwrap();
        assert_eq!(t.open_session(&peer).unwrap(), session);
        assert_eq!(
            t.invite(&peer, session, b"{}", Duration::from_secs(1)),
            Err(TransportError::UnknownPeer(peer.clone()))
        );
        book.lock()
            .unwrap()
            .insert(peer.clone(), "127.0.0.1:9".parse().unwrap());
        t.invite(&peer, session, b"{}", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            side.commands.try_recv(),
            Ok(NetCommand::Invite { .. })
        ));
    }

    #[test]
    fn send_requires_connected_peer() {
        let (mut t, side, _) = transport();
        let peer = PeerHandle::new("p");
        assert_eq!(
            t.send(b"x", &peer, true),
            Err(TransportError::NoSession(peer.clone()))
        );
        side.connected.send_modify(|s| {
            s.insert(peer.clone());
        });
        assert!(t.send(b"x", &peer, true).is_ok());
        assert_eq!(t.connected_peers(), vec![peer]);
    }

    #[tokio::test]
    async fn two_hosts_connect_and_exchange_data() {
        let (mut a, a_side, a_book) = transport();
        let (mut b, b_side, _) = transport();
        let (a_events_tx, mut a_events) = mpsc::unbounded_channel();
        let (b_events_tx, mut b_events) = mpsc::unbounded_channel();
        let a_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b_listener.local_addr().unwrap();
        tokio::spawn(run_sessions(
            a_listener,
            PeerHandle::new("a"),
            a_side.commands,
            a_side.connected,
            a_events_tx,
        ));
        tokio::spawn(run_sessions(
            b_listener,
            PeerHandle::new("b"),
            b_side.commands,
            b_side.connected,
            b_events_tx,
        ));

        let to_b = PeerHandle::new("b");
        a_book.lock().unwrap().insert(to_b.clone(), b_addr);
        let session = a.open_session(&to_b).unwrap();
        a.invite(&to_b, session, b"ctx", Duration::from_secs(5)).unwrap();

        let invitation = loop {
            match b_events.recv().await.unwrap() {
                TransportEvent::InvitationReceived { handle, context } => break (handle, context),
                _ => continue,
            }
        };
        assert_eq!(invitation, (PeerHandle::new("a"), b"ctx".to_vec()));
        let from_a = PeerHandle::new("a");
        let b_session = b.open_session(&from_a).unwrap();
        b.accept_invitation(&from_a, b_session).unwrap();

        loop {
            if let TransportEvent::SessionStateChanged {
                state: SessionState::Connected,
                ..
            } = a_events.recv().await.unwrap()
            {
                break;
            }
        }
        a.send(b"hello", &to_b, true).unwrap();
        let data = loop {
            if let TransportEvent::DataReceived { handle, bytes } = b_events.recv().await.unwrap() {
                break (handle, bytes);
            }
        };
        assert_eq!(data, (from_a, b"hello".to_vec()));

        a.close_session(session);
        loop {
            if let TransportEvent::SessionStateChanged {
                state: SessionState::NotConnected,
                ..
            } = b_events.recv().await.unwrap()
            {
                break;
            }
        }
    }
}
