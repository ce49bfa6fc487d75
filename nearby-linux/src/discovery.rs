//! LAN discovery: UDP multicast beacons carrying the advertised discovery info.
//! Beacons are framed with the core codec under the `nearby-beacon` kind.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nearby_core::{DiscoveryInfo, PeerHandle, TransportEvent, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_KIND: &str = "nearby-beacon";
const BEACON_INTERVAL: Duration = Duration::from_secs(2);
const PEER_TIMEOUT: Duration = Duration::from_secs(8);

/// Handle -> last known session address, written here and read by the session transport.
pub type AddressBook = Arc<Mutex<HashMap<PeerHandle, SocketAddr>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub version: u8,
    pub service_type: String,
    pub handle: String,
    pub listen_port: u16,
    pub info: DiscoveryInfo,
}

impl Beacon {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        Ok(nearby_core::encode_frame(BEACON_KIND, &body)?)
    }

    /// `None` for anything that is not a beacon of this protocol version.
    pub fn decode(bytes: &[u8]) -> Option<Beacon> {
        let frame = nearby_core::decode_frame(bytes).ok()?;
        if frame.kind != BEACON_KIND {
            return None;
        }
        let beacon: Beacon = bincode::deserialize(&frame.payload).ok()?;
        (beacon.version == PROTOCOL_VERSION).then_some(beacon)
    }
}

struct Seen {
    info: DiscoveryInfo,
    last_seen: Instant,
}

/// Peers currently heard on the LAN.
pub struct PeerTable {
    service_type: String,
    local: PeerHandle,
    seen: HashMap<PeerHandle, Seen>,
}

impl PeerTable {
    pub fn new(service_type: &str, local: PeerHandle) -> Self {
        Self {
            service_type: service_type.to_owned(),
            local,
            seen: HashMap::new(),
        }
    }

    /// Record a beacon. Returns the event to report when the peer is new or
    /// its info changed.
    pub fn observe(&mut self, beacon: Beacon, now: Instant) -> Option<TransportEvent> {
        if beacon.service_type != self.service_type || beacon.handle == self.local.as_str() {
            return None;
        }
        let handle = PeerHandle::new(beacon.handle);
        match self.seen.get_mut(&handle) {
            Some(seen) if seen.info == beacon.info => {
                seen.last_seen = now;
                None
            }
            _ => {
                self.seen.insert(
                    handle.clone(),
                    Seen {
                        info: beacon.info.clone(),
                        last_seen: now,
                    },
                );
                Some(TransportEvent::PeerFound {
                    handle,
                    info: Some(beacon.info),
                })
            }
        }
    }

    /// Drop peers not heard from within the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<TransportEvent> {
        let gone: Vec<PeerHandle> = self
            .seen
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) >= PEER_TIMEOUT)
            .map(|(h, _)| h.clone())
            .collect();
        gone.into_iter()
            .map(|handle| {
                self.seen.remove(&handle);
                TransportEvent::PeerLost { handle }
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

pub struct DiscoverySettings {
    pub service_type: String,
    pub local: PeerHandle,
    pub discovery_port: u16,
    pub transport_port: u16,
}

/// Beacon while advertising, listen while browsing, report changes as transport events.
pub async fn run_discovery(
    settings: DiscoverySettings,
    mut advert: watch::Receiver<Option<DiscoveryInfo>>,
    mut browsing: watch::Receiver<bool>,
    book: AddressBook,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> std::io::Result<()> {
    let socket = make_multicast_socket(settings.discovery_port)?;
    let group = SocketAddr::from((MULTICAST_GROUP, settings.discovery_port));
    let mut table = PeerTable::new(&settings.service_type, settings.local.clone());
    let mut beacon_tick = tokio::time::interval(BEACON_INTERVAL);
    let mut buf = vec![0u8; 65536];
    info!(port = settings.discovery_port, "discovery listening");

    let current_beacon = |info: &DiscoveryInfo| Beacon {
        version: PROTOCOL_VERSION,
        service_type: settings.service_type.clone(),
        handle: settings.local.as_str().to_owned(),
        listen_port: settings.transport_port,
        info: info.clone(),
    };

    loop {
        tokio::select! {
            _ = beacon_tick.tick() => {
                let advertised = advert.borrow().clone();
                if let Some(info) = advertised {
                    match current_beacon(&info).encode() {
                        Ok(frame) => {
                            if let Err(e) = socket.send_to(&frame, group).await {
                                warn!(error = %e, "beacon send failed");
                                let _ = events.send(TransportEvent::Failed(
                                    nearby_core::TransportError::Advertise(e.to_string()),
                                ));
                            }
                        }
                        Err(e) => warn!(error = %e, "beacon encode failed"),
                    }
                }
                for event in table.expire(Instant::now()) {
                    let _ = events.send(event);
                }
            }
            changed = advert.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                beacon_tick.reset_immediately();
            }
            changed = browsing.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                if !*browsing.borrow() {
                    table.clear();
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;
                if !*browsing.borrow() {
                    continue;
                }
                let Some(beacon) = Beacon::decode(&buf[..n]) else {
                    continue;
                };
                let addr = SocketAddr::new(from.ip(), beacon.listen_port);
                let handle = PeerHandle::new(beacon.handle.clone());
                if let Some(event) = table.observe(beacon, Instant::now()) {
                    debug!(%handle, %addr, "beacon");
                    match book.lock() {
                        Ok(mut b) => {
                            b.insert(handle, addr);
                        }
                        Err(poisoned) => {
                            poisoned.into_inner().insert(handle, addr);
                        }
                    }
                    let _ = events.send(event);
                    // Answer a newcomer directly so it need not wait a full interval.
                    let advertised = advert.borrow().clone();
                    if let Some(info) = advertised {
                        if let Ok(frame) = current_beacon(&info).encode() {
                            let _ = socket.send_to(&frame, from).await;
                        }
                    }
                }
            }
        }
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}
