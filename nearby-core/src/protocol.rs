//! Nearby wire protocol: system message kinds, their payloads, and the application kind table.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::wire::{self, DecodeError, FrameEncodeError, FramedMessage, LegacyEnvelope};

/// Current protocol version. Carried in LAN beacons.
pub const PROTOCOL_VERSION: u8 = 1;

/// Application data exchanged after a session connects.
pub type ProvisionedInfo = serde_json::Map<String, serde_json::Value>;

/// Module prefix used for legacy envelope class names.
const LEGACY_MODULE: &str = "Nearby";

/// Kinds handled by the mesh itself before application dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemKind {
    Ping,
    Disconnect,
    RequestDeviceInfo,
    DeviceInfo,
    Provision,
    Pair,
    Dictionary,
    RequestAvatar,
    Avatar,
}

impl SystemKind {
    pub const ALL: [SystemKind; 9] = [
        SystemKind::Ping,
        SystemKind::Disconnect,
        SystemKind::RequestDeviceInfo,
        SystemKind::DeviceInfo,
        SystemKind::Provision,
        SystemKind::Pair,
        SystemKind::Dictionary,
        SystemKind::RequestAvatar,
        SystemKind::Avatar,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            SystemKind::Ping => "*system-ping*",
            SystemKind::Disconnect => "*system-disconnect*",
            SystemKind::RequestDeviceInfo => "*request-device-info*",
            SystemKind::DeviceInfo => "*device-info*",
            SystemKind::Provision => "provision",
            SystemKind::Pair => "pair",
            SystemKind::Dictionary => "*dictionary*",
            SystemKind::RequestAvatar => "*request-avatar*",
            SystemKind::Avatar => "*avatar*",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    fn legacy_class(self) -> &'static str {
        match self {
            SystemKind::DeviceInfo => "DeviceInfo",
            SystemKind::Dictionary => "DictionaryMessage",
            SystemKind::Avatar => "Avatar",
            SystemKind::Provision => "ProvisionMessage",
            SystemKind::Pair => "PairMessage",
            _ => "NearbySystemMessage",
        }
    }
}

impl fmt::Display for SystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Serialize, Deserialize)]
struct BareBody {
    kind: String,
}

#[derive(Serialize, Deserialize)]
struct DeviceInfoBody {
    #[serde(rename = "deviceInfo")]
    device_info: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct InfoBody {
    #[serde(default)]
    info: ProvisionedInfo,
}

#[derive(Serialize, Deserialize)]
struct DictionaryBody {
    info: BTreeMap<String, String>,
}

/// Avatar metadata and image bytes. Caching is the application's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarMessage {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "imageData", default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<Vec<u8>>,
    pub hash: String,
}

impl AvatarMessage {
    pub fn new(name: Option<String>, image_data: Option<Vec<u8>>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_deref().unwrap_or("").as_bytes());
        hasher.update(image_data.as_deref().unwrap_or(&[]));
        let hash = hex::encode(hasher.finalize());
        Self {
            name,
            image_data,
            hash,
        }
    }
}

/// A decoded system message.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemMessage {
    Ping,
    Disconnect,
    RequestDeviceInfo,
    DeviceInfo(BTreeMap<String, String>),
    Provision(ProvisionedInfo),
    Pair(ProvisionedInfo),
    Dictionary(BTreeMap<String, String>),
    RequestAvatar,
    Avatar(AvatarMessage),
}

impl SystemMessage {
    pub fn kind(&self) -> SystemKind {
        match self {
            SystemMessage::Ping => SystemKind::Ping,
            SystemMessage::Disconnect => SystemKind::Disconnect,
            SystemMessage::RequestDeviceInfo => SystemKind::RequestDeviceInfo,
            SystemMessage::DeviceInfo(_) => SystemKind::DeviceInfo,
            SystemMessage::Provision(_) => SystemKind::Provision,
            SystemMessage::Pair(_) => SystemKind::Pair,
            SystemMessage::Dictionary(_) => SystemKind::Dictionary,
            SystemMessage::RequestAvatar => SystemKind::RequestAvatar,
            SystemMessage::Avatar(_) => SystemKind::Avatar,
        }
    }

    fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            SystemMessage::Ping
            | SystemMessage::Disconnect
            | SystemMessage::RequestDeviceInfo
            | SystemMessage::RequestAvatar => serde_json::to_vec(&BareBody {
                kind: self.kind().tag().to_owned(),
            }),
            SystemMessage::DeviceInfo(info) => serde_json::to_vec(&DeviceInfoBody {
                device_info: info.clone(),
            }),
            SystemMessage::Provision(info) | SystemMessage::Pair(info) => {
                serde_json::to_vec(&InfoBody { info: info.clone() })
            }
            SystemMessage::Dictionary(info) => {
                serde_json::to_vec(&DictionaryBody { info: info.clone() })
            }
            SystemMessage::Avatar(avatar) => serde_json::to_vec(avatar),
        }
    }

    /// Single-tag envelope with a JSON body.
    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let body = self
            .body()
            .map_err(|e| FrameEncodeError::Payload(e.to_string()))?;
        wire::encode_frame(self.kind().tag(), &body)
    }

    /// Legacy control envelope (identifier, command, class name, JSON body).
    pub fn encode_legacy(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let body = self
            .body()
            .map_err(|e| FrameEncodeError::Payload(e.to_string()))?;
        let kind = self.kind();
        let class = format!("{}.{}", LEGACY_MODULE, kind.legacy_class());
        LegacyEnvelope::new(kind.tag(), class, body).encode()
    }

    pub fn decode(kind: SystemKind, payload: &[u8]) -> Result<Self, DecodeError> {
        let fail = |e: serde_json::Error| DecodeError::PayloadDecodeFailed {
            kind: kind.tag().to_owned(),
            reason: e.to_string(),
        };
        Ok(match kind {
            SystemKind::Ping => SystemMessage::Ping,
            SystemKind::Disconnect => SystemMessage::Disconnect,
            SystemKind::RequestDeviceInfo => SystemMessage::RequestDeviceInfo,
            SystemKind::RequestAvatar => SystemMessage::RequestAvatar,
            SystemKind::DeviceInfo => {
                let body: DeviceInfoBody = serde_json::from_slice(payload).map_err(fail)?;
                SystemMessage::DeviceInfo(body.device_info)
            }
            SystemKind::Provision => {
                let body: InfoBody = serde_json::from_slice(payload).map_err(fail)?;
                SystemMessage::Provision(body.info)
            }
            SystemKind::Pair => {
                let body: InfoBody = serde_json::from_slice(payload).map_err(fail)?;
                SystemMessage::Pair(body.info)
            }
            SystemKind::Dictionary => {
                let body: DictionaryBody = serde_json::from_slice(payload).map_err(fail)?;
                SystemMessage::Dictionary(body.info)
            }
            SystemKind::Avatar => SystemMessage::Avatar(serde_json::from_slice(payload).map_err(fail)?),
        })
    }
}

/// An application message type with a fixed kind tag.
pub trait MeshMessage: Serialize + DeserializeOwned + Send + 'static {
    const KIND: &'static str;
}

/// Frame an application message with a JSON body.
pub fn encode_message<M: MeshMessage>(message: &M) -> Result<Vec<u8>, FrameEncodeError> {
    let body =
        serde_json::to_vec(message).map_err(|e| FrameEncodeError::Payload(e.to_string()))?;
    wire::encode_frame(M::KIND, &body)
}

/// A decoded application message; recover the concrete type with [`AppMessage::downcast`].
pub struct AppMessage {
    kind: String,
    body: Box<dyn Any + Send>,
}

impl AppMessage {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn downcast_ref<M: 'static>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }

    pub fn downcast<M: 'static>(self) -> Result<M, Self> {
        let kind = self.kind;
        match self.body.downcast::<M>() {
            Ok(m) => Ok(*m),
            Err(body) => Err(AppMessage { kind, body }),
        }
    }
}

impl fmt::Debug for AppMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppMessage").field("kind", &self.kind).finish()
    }
}

/// What the mesh hands to the application.
#[derive(Debug)]
pub enum DecodedMessage {
    Dictionary(BTreeMap<String, String>),
    Avatar(AvatarMessage),
    App(AppMessage),
}

impl DecodedMessage {
    pub fn kind(&self) -> &str {
        match self {
            DecodedMessage::Dictionary(_) => SystemKind::Dictionary.tag(),
            DecodedMessage::Avatar(_) => SystemKind::Avatar.tag(),
            DecodedMessage::App(m) => m.kind(),
        }
    }
}

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, String> + Send>;

/// Kind -> decoder table, populated at startup.
#[derive(Default)]
pub struct MessageRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serde message type under its `KIND`.
    pub fn register<M: MeshMessage>(&mut self) -> Result<(), RegisterError> {
        self.register_with(M::KIND, |bytes| {
            serde_json::from_slice::<M>(bytes)
                .map(|m| Box::new(m) as Box<dyn Any + Send>)
                .map_err(|e| e.to_string())
        })
    }

    /// Register an arbitrary decoder for `kind`.
    pub fn register_with<F>(&mut self, kind: &str, decoder: F) -> Result<(), RegisterError>
    where
        F: Fn(&[u8]) -> Result<Box<dyn Any + Send>, String> + Send + 'static,
    {
        if kind.is_empty() || kind.len() > wire::MAX_KIND_LEN {
            return Err(RegisterError::InvalidKind(kind.to_owned()));
        }
        if SystemKind::from_tag(kind).is_some() {
            return Err(RegisterError::Reserved(kind.to_owned()));
        }
        if self.decoders.insert(kind.to_owned(), Box::new(decoder)).is_some() {
            tracing::debug!(kind, "replaced message decoder");
        }
        Ok(())
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn decode(&self, frame: &FramedMessage) -> Result<AppMessage, DecodeError> {
        let decoder = self
            .decoders
            .get(&frame.kind)
            .ok_or_else(|| DecodeError::UnknownKind(frame.kind.clone()))?;
        let body = decoder(&frame.payload).map_err(|reason| DecodeError::PayloadDecodeFailed {
            kind: frame.kind.clone(),
            reason,
        })?;
        Ok(AppMessage {
            kind: frame.kind.clone(),
            body,
        })
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("kind {0:?} is reserved for system messages")]
    Reserved(String),
    #[error("kind {0:?} must be 1..=255 bytes")]
    InvalidKind(String),
}
