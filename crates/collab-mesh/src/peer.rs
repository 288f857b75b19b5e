/// Mesh topology: known peers, their connection state, and message routing
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    ClientId, ClientSession, CollabEvent, CollaborationError, Envelope, Notification,
    PendingRequests, Request, RequestId, Response, Result, Transport,
};

/// State of the direct channel to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Disconnected-like states the connection never leaves on its own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// One remote client as seen by the local session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: ClientId,
    pub connection_state: ConnectionState,

    /// Remote session start, learned from the join announcement or handshake
    pub start_time: Option<i64>,

    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl PeerInfo {
    pub fn new(peer_id: ClientId, connection_state: ConnectionState) -> Self {
        Self {
            peer_id,
            connection_state,
            start_time: None,
            display_name: None,
            avatar_url: None,
        }
    }
}

/// Owns the peer set and routes requests and notifications to peers.
///
/// Individual peer failures are returned to the caller and never tear the
/// session down. Only relay failure is surfaced as `SignalingUnavailable`.
pub struct PeerSessionManager {
    local: ClientSession,
    transport: Arc<dyn Transport>,
    peers: Mutex<HashMap<ClientId, PeerInfo>>,
    pending: PendingRequests,
    /// Serializes outbound relay traffic from this client
    relay_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<CollabEvent>,
    request_timeout: Duration,
    stopped: AtomicBool,
}

impl PeerSessionManager {
    pub fn new(
        local: ClientSession,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<CollabEvent>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            local,
            transport,
            peers: Mutex::new(HashMap::new()),
            pending: PendingRequests::new(),
            relay_lock: tokio::sync::Mutex::new(()),
            events,
            request_timeout,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn local(&self) -> &ClientSession {
        &self.local
    }

    pub fn client_id(&self) -> &ClientId {
        &self.local.client_id
    }

    /// Publish a session event; returns how many subscribers saw it
    pub fn emit(&self, event: CollabEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(CollaborationError::SessionStopped);
        }
        Ok(())
    }

    /// Announce ourselves over the relay so existing peers open channels to us
    pub async fn join(&self) -> Result<()> {
        self.ensure_running()?;
        info!(client_id = %self.local.client_id, "joining mesh");
        self.broadcast_relay(Envelope::Notification {
            from_client_id: self.local.client_id.clone(),
            to_client_id: None,
            message: Notification::Join {
                start_time: self.local.start_time,
            },
        })
        .await
    }

    async fn broadcast_relay(&self, envelope: Envelope) -> Result<()> {
        let _guard = self.relay_lock.lock().await;
        match self.transport.broadcast(envelope).await {
            Ok(()) => Ok(()),
            Err(err @ CollaborationError::SignalingUnavailable(_)) => {
                error!(client_id = %self.local.client_id, error = %err, "relay channel down");
                self.emit(CollabEvent::SignalingUnavailable(err.to_string()));
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Send `request` to `peer` over its direct channel and wait for the answer.
    ///
    /// `timeout` defaults to the configured request timeout. A peer without
    /// an open channel, or one that does not answer in time, yields
    /// `PeerUnreachable`.
    pub async fn request_peer(
        &self,
        peer: &ClientId,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.ensure_running()?;
        if !self.is_connected(peer) {
            return Err(CollaborationError::PeerUnreachable(peer.clone()));
        }

        let name = request.name();
        let (request_id, rx) = self.pending.register()?;
        let envelope = Envelope::Request {
            from_client_id: self.local.client_id.clone(),
            to_client_id: Some(peer.clone()),
            request_id,
            message: request,
        };

        debug!(peer = %peer, request = name, request_id, "sending request");
        if let Err(err) = self.transport.send(peer, envelope).await {
            self.pending.forget(request_id);
            warn!(peer = %peer, request = name, error = %err, "request not delivered");
            return Err(CollaborationError::PeerUnreachable(peer.clone()));
        }

        let timeout = timeout.unwrap_or(self.request_timeout);
        match self.pending.wait(request_id, rx, timeout, name).await {
            Err(CollaborationError::Timeout(_)) => {
                warn!(peer = %peer, request = name, "peer did not answer in time");
                Err(CollaborationError::PeerUnreachable(peer.clone()))
            }
            other => other,
        }
    }

    pub async fn notify_peer(&self, peer: &ClientId, notification: Notification) -> Result<()> {
        self.ensure_running()?;
        let envelope = Envelope::Notification {
            from_client_id: self.local.client_id.clone(),
            to_client_id: Some(peer.clone()),
            message: notification,
        };
        self.transport.send(peer, envelope).await
    }

    /// Best-effort fan-out to every connected peer. Returns how many were reached.
    pub async fn notify_all(&self, notification: Notification) -> usize {
        let targets: Vec<ClientId> = self
            .connected_peers()
            .into_iter()
            .map(|p| p.peer_id)
            .collect();

        let name = notification.name();
        let sends = targets.iter().map(|peer| {
            let envelope = Envelope::Notification {
                from_client_id: self.local.client_id.clone(),
                to_client_id: Some(peer.clone()),
                message: notification.clone(),
            };
            async move { (peer, self.transport.send(peer, envelope).await) }
        });

        let mut delivered = 0;
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => warn!(peer = %peer, notification = name, error = %err, "notify failed"),
            }
        }
        delivered
    }

    /// Answer a request received from `peer`
    pub async fn respond(
        &self,
        peer: &ClientId,
        request_id: RequestId,
        response: Response,
    ) -> Result<()> {
        let envelope = Envelope::Response {
            from_client_id: self.local.client_id.clone(),
            to_client_id: Some(peer.clone()),
            request_id,
            message: response,
        };
        self.transport.send(peer, envelope).await
    }

    /// Route a response envelope to the request waiting for it
    pub fn resolve_response(&self, request_id: RequestId, response: Response) -> bool {
        self.pending.resolve(request_id, response)
    }

    /// A peer announced itself over the relay; its channel is still being formed
    pub fn on_peer_announced(&self, peer: &ClientId, start_time: i64) {
        let mut peers = self.peers.lock();
        match peers.get_mut(peer) {
            Some(info) if !info.connection_state.is_terminal() => {
                info.start_time = Some(start_time);
            }
            _ => {
                let mut info = PeerInfo::new(peer.clone(), ConnectionState::Connecting);
                info.start_time = Some(start_time);
                peers.insert(peer.clone(), info);
            }
        }
    }

    /// The direct channel to `peer` opened. A peer whose previous connection
    /// ended gets a fresh `PeerInfo`.
    pub fn on_channel_open(&self, peer: &ClientId) {
        {
            let mut peers = self.peers.lock();
            match peers.get_mut(peer) {
                Some(info) if !info.connection_state.is_terminal() => {
                    info.connection_state = ConnectionState::Connected;
                }
                _ => {
                    peers.insert(
                        peer.clone(),
                        PeerInfo::new(peer.clone(), ConnectionState::Connected),
                    );
                }
            }
        }
        info!(client_id = %self.local.client_id, peer = %peer, "channel open");
        self.emit(CollabEvent::PeerJoined(peer.clone()));
    }

    /// Record a connection state change. Terminal states are never left;
    /// reconnection goes through `on_channel_open`.
    pub fn update_state(&self, peer: &ClientId, state: ConnectionState) -> bool {
        let mut peers = self.peers.lock();
        let Some(info) = peers.get_mut(peer) else {
            return false;
        };
        if info.connection_state.is_terminal() && !state.is_terminal() {
            debug!(peer = %peer, ?state, "ignoring transition out of terminal state");
            return false;
        }
        if info.connection_state != state {
            debug!(peer = %peer, from = ?info.connection_state, to = ?state, "connection state");
            info.connection_state = state;
        }
        true
    }

    pub fn set_peer_start_time(&self, peer: &ClientId, start_time: i64) {
        if let Some(info) = self.peers.lock().get_mut(peer) {
            info.start_time = Some(start_time);
        }
    }

    pub fn set_peer_profile(
        &self,
        peer: &ClientId,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) {
        if let Some(info) = self.peers.lock().get_mut(peer) {
            info.display_name = display_name;
            info.avatar_url = avatar_url;
        }
    }

    /// Drop a peer and let dependent layers clean up
    pub async fn remove_peer(&self, peer: &ClientId) -> Option<PeerInfo> {
        let removed = self.peers.lock().remove(peer);
        if removed.is_some() {
            self.transport.close_peer(peer).await;
            info!(client_id = %self.local.client_id, peer = %peer, "peer removed");
            self.emit(CollabEvent::PeerRemoved(peer.clone()));
        }
        removed
    }

    /// Drop every peer, closing their channels
    pub async fn reset_peers(&self) {
        let peers: Vec<ClientId> = self.peers.lock().keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer).await;
        }
    }

    /// Drop peers whose channel failed or closed for good. They come back
    /// through a fresh join if they are still around.
    pub async fn prune_terminal_peers(&self) -> Vec<ClientId> {
        let terminal: Vec<ClientId> = self
            .peers
            .lock()
            .values()
            .filter(|p| p.connection_state.is_terminal())
            .map(|p| p.peer_id.clone())
            .collect();
        for peer in &terminal {
            self.remove_peer(peer).await;
        }
        terminal
    }

    pub fn peer(&self, peer: &ClientId) -> Option<PeerInfo> {
        self.peers.lock().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.connection_state == ConnectionState::Connected)
            .cloned()
            .collect()
    }

    pub fn is_connected(&self, peer: &ClientId) -> bool {
        self.peers
            .lock()
            .get(peer)
            .map(|p| p.connection_state == ConnectionState::Connected)
            .unwrap_or(false)
    }

    pub fn connection_states(&self) -> Vec<ConnectionState> {
        self.peers
            .lock()
            .values()
            .map(|p| p.connection_state)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Tell peers we are leaving, fail in-flight requests and close everything.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(client_id = %self.local.client_id, "stopping peer session");

        self.notify_all(Notification::Disconnect).await;
        self.pending.cancel_all();

        let peers: Vec<ClientId> = self.peers.lock().drain().map(|(id, _)| id).collect();
        for peer in &peers {
            self.transport.close_peer(peer).await;
        }
        self.transport.disconnect().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
