//! In-process relay and peer channels for tests and single-process demos.
//!
//! A `Join` notification broadcast over the relay opens a direct channel
//! between the joiner and every registered endpoint, mimicking what a real
//! mesh does after ICE negotiation. Link states and relay availability can be
//! forced to exercise failure paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Transport, TransportBootstrap, TransportEvent};
use crate::{ClientId, CollaborationError, ConnectionState, Envelope, Notification, Result};

type LinkKey = (ClientId, ClientId);

fn link_key(a: &ClientId, b: &ClientId) -> LinkKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<ClientId, mpsc::UnboundedSender<TransportEvent>>,
    links: HashMap<LinkKey, ConnectionState>,
    joins: HashMap<ClientId, usize>,
    relay_down: bool,
}

impl HubState {
    fn deliver(&self, to: &ClientId, event: TransportEvent) -> bool {
        match self.endpoints.get(to) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn set_link(&mut self, a: &ClientId, b: &ClientId, state: ConnectionState) {
        self.links.insert(link_key(a, b), state);
    }

    fn link(&self, a: &ClientId, b: &ClientId) -> Option<ConnectionState> {
        self.links.get(&link_key(a, b)).copied()
    }
}

/// Shared hub all `LocalTransport`s of one document talk through
#[derive(Clone, Default)]
pub struct LocalMesh {
    state: Arc<Mutex<HubState>>,
}

impl LocalMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport not yet registered; `connect` binds it to a client id
    pub fn endpoint(&self) -> LocalTransport {
        LocalTransport {
            hub: self.clone(),
            client_id: Mutex::new(None),
        }
    }

    /// Force the state of the channel between `a` and `b`, reporting it to both ends
    pub fn set_link_state(&self, a: &ClientId, b: &ClientId, state: ConnectionState) {
        let mut hub = self.state.lock();
        hub.set_link(a, b, state);
        hub.deliver(
            a,
            TransportEvent::ConnectionState {
                peer: b.clone(),
                state,
            },
        );
        hub.deliver(
            b,
            TransportEvent::ConnectionState {
                peer: a.clone(),
                state,
            },
        );
    }

    /// Re-establish a channel; both ends see a fresh `ChannelOpen`
    pub fn reconnect(&self, a: &ClientId, b: &ClientId) {
        let mut hub = self.state.lock();
        hub.set_link(a, b, ConnectionState::Connected);
        hub.deliver(a, TransportEvent::ChannelOpen(b.clone()));
        hub.deliver(b, TransportEvent::ChannelOpen(a.clone()));
    }

    pub fn set_relay_down(&self, down: bool) {
        self.state.lock().relay_down = down;
    }

    /// Number of join announcements `client` has broadcast
    pub fn join_count(&self, client: &ClientId) -> usize {
        self.state.lock().joins.get(client).copied().unwrap_or(0)
    }

    pub fn link_state(&self, a: &ClientId, b: &ClientId) -> Option<ConnectionState> {
        self.state.lock().link(a, b)
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

pub struct LocalTransport {
    hub: LocalMesh,
    client_id: Mutex<Option<ClientId>>,
}

impl LocalTransport {
    fn bound_id(&self) -> Result<ClientId> {
        self.client_id
            .lock()
            .clone()
            .ok_or_else(|| CollaborationError::SignalingUnavailable("not connected".to_string()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        bootstrap: TransportBootstrap,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut hub = self.hub.state.lock();
        if hub.relay_down {
            return Err(CollaborationError::SignalingUnavailable(
                "relay unreachable".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        hub.endpoints.insert(bootstrap.client_id.clone(), tx);
        *self.client_id.lock() = Some(bootstrap.client_id);
        Ok(rx)
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        let from = self.bound_id()?;
        let mut hub = self.hub.state.lock();
        if hub.relay_down {
            return Err(CollaborationError::SignalingUnavailable(
                "relay unreachable".to_string(),
            ));
        }

        if let Some(to) = envelope.to_client_id() {
            hub.deliver(to, TransportEvent::Inbound(envelope.clone()));
            return Ok(());
        }

        let others: Vec<ClientId> = hub
            .endpoints
            .keys()
            .filter(|id| **id != from)
            .cloned()
            .collect();

        let is_join = matches!(
            envelope,
            Envelope::Notification {
                message: Notification::Join { .. },
                ..
            }
        );
        if is_join {
            *hub.joins.entry(from.clone()).or_insert(0) += 1;
        }

        for other in others {
            hub.deliver(&other, TransportEvent::Inbound(envelope.clone()));
            if is_join {
                debug!(from = %from, to = %other, "opening local channel");
                hub.set_link(&from, &other, ConnectionState::Connected);
                hub.deliver(&from, TransportEvent::ChannelOpen(other.clone()));
                hub.deliver(&other, TransportEvent::ChannelOpen(from.clone()));
            }
        }
        Ok(())
    }

    async fn send(&self, peer: &ClientId, envelope: Envelope) -> Result<()> {
        let from = self.bound_id()?;
        let hub = self.hub.state.lock();
        if hub.link(&from, peer) != Some(ConnectionState::Connected) {
            return Err(CollaborationError::PeerUnreachable(peer.clone()));
        }
        if !hub.deliver(peer, TransportEvent::Inbound(envelope)) {
            return Err(CollaborationError::PeerUnreachable(peer.clone()));
        }
        Ok(())
    }

    async fn close_peer(&self, peer: &ClientId) {
        let Ok(from) = self.bound_id() else {
            return;
        };
        let mut hub = self.hub.state.lock();
        if hub.link(&from, peer).is_some() {
            hub.set_link(&from, peer, ConnectionState::Closed);
            hub.deliver(
                peer,
                TransportEvent::ConnectionState {
                    peer: from,
                    state: ConnectionState::Closed,
                },
            );
        }
    }

    async fn disconnect(&self) {
        let Some(from) = self.client_id.lock().take() else {
            return;
        };
        let mut hub = self.hub.state.lock();
        hub.endpoints.remove(&from);

        let linked: Vec<LinkKey> = hub
            .links
            .keys()
            .filter(|(a, b)| *a == from || *b == from)
            .cloned()
            .collect();
        for (a, b) in linked {
            hub.links.insert((a.clone(), b.clone()), ConnectionState::Closed);
            let other = if a == from { b } else { a };
            hub.deliver(
                &other,
                TransportEvent::ConnectionState {
                    peer: from.clone(),
                    state: ConnectionState::Closed,
                },
            );
        }
    }
}
