//! Transport seam: a server relay plus direct client-to-client channels.
//!
//! Connection negotiation itself (ICE, SDP) lives behind this trait. The
//! session only sees envelopes, channel openings and connection state changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{ClientId, ConnectionState, Envelope, Result};

pub mod local;
pub mod relay;

pub use local::{LocalMesh, LocalTransport};
pub use relay::RelayTransport;

/// STUN/TURN server entry handed to the transport at bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// What a transport needs to register the local client
#[derive(Debug, Clone)]
pub struct TransportBootstrap {
    pub client_id: ClientId,
    pub start_time: i64,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Envelope received over the relay or a direct channel
    Inbound(Envelope),

    /// A direct channel to this peer is open and usable
    ChannelOpen(ClientId),

    ConnectionState {
        peer: ClientId,
        state: ConnectionState,
    },

    /// The relay connection dropped
    RelayClosed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Register with the relay and start delivering events
    async fn connect(
        &self,
        bootstrap: TransportBootstrap,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Send over the relay. Fails with `SignalingUnavailable` if the relay is down.
    async fn broadcast(&self, envelope: Envelope) -> Result<()>;

    /// Send over the direct channel to `peer`. Fails with `PeerUnreachable`.
    async fn send(&self, peer: &ClientId, envelope: Envelope) -> Result<()>;

    async fn close_peer(&self, peer: &ClientId);

    /// Close every channel and unregister from the relay
    async fn disconnect(&self);
}
