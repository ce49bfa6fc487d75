//! Identity registry: raw transport handles -> one logical peer per identity.
//!
//! The registry is owned by the coordinator and mutated only through
//! `&mut self`, so there is a single writer and two resolutions of the same
//! handle can never both create a peer.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::config::SessionConfig;
use crate::identity::{DeviceId, DiscoveryInfo, PeerHandle, PeerIdentity};
use crate::peer::{Backoff, Peer};

/// Outcome of [`PeerRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Existing(DeviceId),
    Created(DeviceId),
    /// The handle belongs to this device.
    Local,
}

impl Resolution {
    pub fn id(self) -> Option<DeviceId> {
        match self {
            Resolution::Existing(id) | Resolution::Created(id) => Some(id),
            Resolution::Local => None,
        }
    }
}

pub struct PeerRegistry {
    local: PeerIdentity,
    peers: HashMap<DeviceId, Peer>,
    aliases: HashMap<PeerHandle, DeviceId>,
}

impl PeerRegistry {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Return the peer for `handle`, creating it on first sight.
    pub fn resolve(
        &mut self,
        handle: &PeerHandle,
        info: Option<&DiscoveryInfo>,
        now: Instant,
        cfg: &SessionConfig,
    ) -> Resolution {
        if let Some(id) = self.aliases.get(handle) {
            return Resolution::Existing(*id);
        }
        let identity = PeerIdentity::from_discovery(handle, info);
        let id = identity.id();
        if id == self.local.id() {
            return Resolution::Local;
        }
        self.aliases.insert(handle.clone(), id);
        if self.peers.contains_key(&id) {
            debug!(peer = %id, %handle, "new handle for known peer");
            return Resolution::Existing(id);
        }
        let label = self.unique_label(identity.display_name());
        debug!(peer = %label, %id, %handle, "created peer");
        let peer = Peer::new(
            identity,
            handle.clone(),
            label,
            info.cloned().unwrap_or_default(),
            Backoff::new(cfg.reinvite_delay, cfg.reconnect_ceiling, cfg.reconnect_multiplier),
            now,
        );
        self.peers.insert(id, peer);
        Resolution::Created(id)
    }

    /// Known peer for `handle`, without creating one.
    pub fn lookup(&self, handle: &PeerHandle) -> Option<DeviceId> {
        self.aliases.get(handle).copied()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.peers.keys().copied().collect()
    }

    /// Every handle that resolves to `id`.
    pub fn handles_of(&self, id: &DeviceId) -> impl Iterator<Item = &PeerHandle> + '_ {
        let id = *id;
        self.aliases
            .iter()
            .filter(move |(_, v)| **v == id)
            .map(|(h, _)| h)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// `name`, or `"name - n"` with the smallest free `n >= 2`.
    fn unique_label(&self, name: &str) -> String {
        let taken = |label: &str| {
            label == self.local.display_name() || self.peers.values().any(|p| p.label == label)
        };
        if !taken(name) {
            return name.to_owned();
        }
        (2..)
            .map(|n| format!("{name} - {n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| name.to_owned())
    }
}
