//! Nearby mesh core: peer discovery, session negotiation and message routing.
//! Host-driven: no I/O; the host feeds transport events and ticks, the
//! coordinator drives the host's [`Transport`].

pub mod config;
pub mod connectivity;
pub mod identity;
pub mod observer;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod stream;
pub mod transport;
pub mod wire;

pub use config::{validate_service_type, ConfigError, SessionConfig};
pub use connectivity::DisconnectReason;
pub use identity::{
    load_or_create, DeviceId, DiscoveryInfo, IdentityError, IdentityStore, LocalIdentity,
    MemoryIdentityStore, PeerHandle, PeerIdentity,
};
pub use observer::{MeshObserver, NoopObserver};
pub use peer::{PeerSnapshot, PeerState};
pub use protocol::{
    encode_message, AppMessage, AvatarMessage, DecodedMessage, MeshMessage, MessageRegistry,
    ProvisionedInfo, SystemKind, SystemMessage, PROTOCOL_VERSION,
};
pub use registry::{PeerRegistry, Resolution};
pub use session::{Coordinator, MeshError};
pub use stream::{StreamDecoder, StreamError};
pub use transport::{
    SessionHandle, SessionState, StreamEvent, StreamHandle, Transport, TransportError,
    TransportEvent,
};
pub use wire::{decode_frame, encode_frame, DecodeError, FrameEncodeError, FramedMessage};
