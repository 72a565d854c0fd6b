//! Peer transport provider boundary.
//!
//! The actual peer negotiation protocol lives outside this layer; the
//! supervisor only consumes its connect/send surface and its callback
//! events.

use async_trait::async_trait;
use shared::domain::PeerId;
use tokio::sync::broadcast;

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged { peer_id: PeerId, connected: bool },
    DataChannelStateChanged { peer_id: PeerId, open: bool },
    InboundData { peer_id: PeerId, bytes: Vec<u8> },
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Starts (or restarts) a connection attempt toward `peer_id`. Returns
    /// once the attempt is underway; completion is reported through
    /// [`TransportEvent::ConnectionStateChanged`].
    async fn connect(&self, peer_id: &PeerId) -> Result<(), ConnectionError>;

    async fn send(&self, peer_id: &PeerId, bytes: Vec<u8>) -> Result<(), ConnectionError>;

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}
