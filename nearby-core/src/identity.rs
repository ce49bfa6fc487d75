//! Device identity: stable device ID, transport handles, the persisted local identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Advertised key-value metadata, visible before a session exists.
pub type DiscoveryInfo = BTreeMap<String, String>;

/// Well-known discovery-info keys.
pub mod keys {
    pub const NAME: &str = "name";
    pub const IDIOM: &str = "idiom";
    pub const UNIQUE: &str = "unique";
    pub const DEVICE: &str = "device";
    pub const SIMULATOR: &str = "sim";
}

/// Device ID: truncated hash of the unique handle and display name.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DeviceId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl DeviceId {
    /// Derive the ID from a unique handle plus display name.
    pub fn derive(unique: &str, display_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"nearby-identity-v1");
        hasher.update(unique.as_bytes());
        hasher.update([0u8]);
        hasher.update(display_name.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

/// Raw transport-level handle for a remote endpoint. Several handles may map to one peer.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerHandle(String);

impl PeerHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        PeerHandle(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable logical identity of a device. Immutable once assigned.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    id: DeviceId,
    display_name: String,
}

impl PeerIdentity {
    pub fn new(unique: &str, display_name: &str) -> Self {
        Self {
            id: DeviceId::derive(unique, display_name),
            display_name: display_name.to_owned(),
        }
    }

    /// Identity for a discovery or invitation event. The advertised `unique` key wins over the
    /// raw handle so that a device reachable through several handles stays one peer.
    pub fn from_discovery(handle: &PeerHandle, info: Option<&DiscoveryInfo>) -> Self {
        let unique = info
            .and_then(|i| i.get(keys::UNIQUE))
            .map(String::as_str)
            .unwrap_or(handle.as_str());
        let name = info
            .and_then(|i| i.get(keys::NAME))
            .map(String::as_str)
            .unwrap_or(handle.as_str());
        Self::new(unique, name)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// The local device's identity. Generated once, then loaded from an [`IdentityStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    handle: Uuid,
    display_name: String,
    discovery_info: DiscoveryInfo,
}

impl LocalIdentity {
    pub fn generate(display_name: &str) -> Self {
        Self {
            handle: Uuid::new_v4(),
            display_name: display_name.to_owned(),
            discovery_info: DiscoveryInfo::new(),
        }
    }

    /// Transport handle other devices use to reach this one.
    pub fn handle(&self) -> PeerHandle {
        PeerHandle(self.handle.to_string())
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(&self.handle.to_string(), &self.display_name)
    }

    /// Advertised info. `name` and `unique` are always filled from the identity.
    pub fn discovery_info(&self) -> DiscoveryInfo {
        let mut info = self.discovery_info.clone();
        info.insert(keys::NAME.to_owned(), self.display_name.clone());
        info.insert(keys::UNIQUE.to_owned(), self.handle.to_string());
        info
    }

    /// Replace the extra advertised keys. Returns true when anything changed.
    pub fn set_discovery_info(&mut self, info: DiscoveryInfo) -> bool {
        let mut info = info;
        info.remove(keys::NAME);
        info.remove(keys::UNIQUE);
        if info == self.discovery_info {
            return false;
        }
        self.discovery_info = info;
        true
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        bincode::serialize(self).map_err(|e| IdentityError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        bincode::deserialize(bytes).map_err(|e| IdentityError::Decode(e.to_string()))
    }
}

/// Persistence capability for the local identity.
pub trait IdentityStore: Send {
    fn load_local_identity(&self) -> Result<Option<LocalIdentity>, IdentityError>;
    fn save_local_identity(&mut self, identity: &LocalIdentity) -> Result<(), IdentityError>;
}

/// Identity store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: Option<Vec<u8>>,
}

impl IdentityStore for MemoryIdentityStore {
    fn load_local_identity(&self) -> Result<Option<LocalIdentity>, IdentityError> {
        self.slot
            .as_deref()
            .map(LocalIdentity::from_bytes)
            .transpose()
    }

    fn save_local_identity(&mut self, identity: &LocalIdentity) -> Result<(), IdentityError> {
        self.slot = Some(identity.to_bytes()?);
        Ok(())
    }
}

/// Load the persisted identity, or generate and persist a new one.
pub fn load_or_create(
    store: &mut dyn IdentityStore,
    display_name: &str,
) -> Result<LocalIdentity, IdentityError> {
    if let Some(existing) = store.load_local_identity()? {
        return Ok(existing);
    }
    let identity = LocalIdentity::generate(display_name);
    store.save_local_identity(&identity)?;
    tracing::info!(identity = %identity.identity(), "generated local identity");
    Ok(identity)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity encode failed: {0}")]
    Encode(String),
    #[error("identity decode failed: {0}")]
    Decode(String),
    #[error("identity store failed: {0}")]
    Store(String),
}
