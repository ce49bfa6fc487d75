//! Callbacks the coordinator makes into the application.

use crate::peer::PeerSnapshot;
use crate::protocol::DecodedMessage;
use crate::transport::StreamHandle;

/// All methods default to no-ops; implement the ones you need.
pub trait MeshObserver: Send {
    fn on_message_received(&mut self, _message: DecodedMessage, _from: &PeerSnapshot) {}
    /// Provisioned info arrived for the first time in this session.
    fn on_first_info_received(&mut self, _from: &PeerSnapshot) {}
    fn on_info_changed(&mut self, _from: &PeerSnapshot) {}
    fn on_state_changed(&mut self, _peer: &PeerSnapshot) {}
    fn on_stream_chunk(&mut self, _from: &PeerSnapshot, _stream: StreamHandle, _chunk: Vec<u8>) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl MeshObserver for NoopObserver {}
