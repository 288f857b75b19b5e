//! WebSocket transport to `collab-relay`.
//!
//! Every envelope travels through the relay: broadcasts fan out to the room,
//! addressed envelopes reach one client. A peer counts as having an open
//! channel once both sides have exchanged `join` announcements. The same
//! socket carries requests to the server, so this type is also the
//! `HistoryServer` for the document.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{IceServer, Transport, TransportBootstrap, TransportEvent};
use crate::{
    ClientId, ClientSession, CollaborationError, ConnectionState, DocumentSnapshot, Envelope,
    HistoryServer, Notification, PendingRequests, Request, Response, Result, StepId,
};

type Outbound = mpsc::UnboundedSender<Message>;
type Peers = Arc<Mutex<HashSet<ClientId>>>;

struct Link {
    outbound: Outbound,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }
}

pub struct RelayTransport {
    url: String,
    client_id: ClientId,
    start_time: i64,
    request_timeout: Duration,
    link: tokio::sync::Mutex<Option<Link>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    peers: Peers,
    pending: Arc<PendingRequests>,
}

impl RelayTransport {
    /// `document_url` is the relay room, e.g. `ws://127.0.0.1:9001/doc-42`.
    /// The transport is bound to `client`; the session must use the same identity.
    pub fn new(
        document_url: impl Into<String>,
        client: &ClientSession,
        request_timeout: Duration,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            url: document_url.into(),
            client_id: client.client_id.clone(),
            start_time: client.start_time,
            request_timeout,
            link: tokio::sync::Mutex::new(None),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            peers: Arc::new(Mutex::new(HashSet::new())),
            pending: Arc::new(PendingRequests::new()),
        }
    }

    fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}client_id={}", self.url, separator, self.client_id)
    }

    /// Open the socket if it is not open yet and return its outbound queue
    async fn ensure_open(&self) -> Result<Outbound> {
        let mut link = self.link.lock().await;
        if let Some(existing) = link.as_ref() {
            if existing.is_alive() {
                return Ok(existing.outbound.clone());
            }
        }

        let endpoint = self.endpoint();
        let (socket, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| CollaborationError::SignalingUnavailable(e.to_string()))?;
        info!(url = %endpoint, "relay connected");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("relay write failed: {}", e);
                    break;
                }
            }
        });

        let router = InboundRouter {
            client_id: self.client_id.clone(),
            start_time: self.start_time,
            outbound: outbound.clone(),
            events: self.events.clone(),
            peers: self.peers.clone(),
            pending: self.pending.clone(),
        };
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => router.route(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("relay read failed: {}", e);
                        break;
                    }
                }
            }
            router.closed();
        });

        *link = Some(Link {
            outbound: outbound.clone(),
            reader,
            writer,
        });
        Ok(outbound)
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let outbound = self.ensure_open().await?;
        outbound
            .send(Message::Text(envelope.to_json()?))
            .map_err(|_| CollaborationError::SignalingUnavailable("relay writer closed".to_string()))
    }

    async fn request_server(&self, request: Request) -> Result<Response> {
        let name = request.name();
        let (request_id, rx) = self.pending.register()?;
        let envelope = Envelope::Request {
            from_client_id: self.client_id.clone(),
            to_client_id: Some(ClientId::server()),
            request_id,
            message: request,
        };
        if let Err(err) = self.send_envelope(&envelope).await {
            self.pending.forget(request_id);
            return Err(CollaborationError::NetworkError(err.to_string()));
        }
        self.pending
            .wait(request_id, rx, self.request_timeout, name)
            .await
    }

    pub fn open_channels(&self) -> usize {
        self.peers.lock().len()
    }
}

/// Reader-side routing, shared with the socket reader task
struct InboundRouter {
    client_id: ClientId,
    start_time: i64,
    outbound: Outbound,
    events: mpsc::UnboundedSender<TransportEvent>,
    peers: Peers,
    pending: Arc<PendingRequests>,
}

impl InboundRouter {
    fn route(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed relay message: {}", e);
                return;
            }
        };

        match &envelope {
            Envelope::Response {
                from_client_id,
                request_id,
                message,
                ..
            } if from_client_id.is_server() => {
                self.pending.resolve(*request_id, message.clone());
                return;
            }
            Envelope::Notification {
                from_client_id,
                to_client_id,
                message: Notification::Join { .. },
            } => {
                let peer = from_client_id.clone();
                if to_client_id.is_none() {
                    self.answer_join(&peer);
                }
                self.peers.lock().insert(peer.clone());
                let _ = self.events.send(TransportEvent::Inbound(envelope.clone()));
                let _ = self.events.send(TransportEvent::ChannelOpen(peer));
                return;
            }
            Envelope::Notification {
                message: Notification::PeerLeft { client_id },
                ..
            } => {
                self.peers.lock().remove(client_id);
            }
            _ => {}
        }

        let _ = self.events.send(TransportEvent::Inbound(envelope));
    }

    /// Tell a newly announced peer about us so both sides consider the channel open
    fn answer_join(&self, peer: &ClientId) {
        let reply = Envelope::Notification {
            from_client_id: self.client_id.clone(),
            to_client_id: Some(peer.clone()),
            message: Notification::Join {
                start_time: self.start_time,
            },
        };
        match reply.to_json() {
            Ok(text) => {
                let _ = self.outbound.send(Message::Text(text));
            }
            Err(e) => error!("failed to encode join reply: {}", e),
        }
    }

    fn closed(&self) {
        let peers: Vec<ClientId> = self.peers.lock().drain().collect();
        for peer in peers {
            let _ = self.events.send(TransportEvent::ConnectionState {
                peer,
                state: ConnectionState::Disconnected,
            });
        }
        let _ = self.events.send(TransportEvent::RelayClosed);
        info!(client_id = %self.client_id, "relay connection closed");
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn connect(
        &self,
        bootstrap: TransportBootstrap,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        if bootstrap.client_id != self.client_id {
            return Err(CollaborationError::Protocol(format!(
                "transport bound to client {}, not {}",
                self.client_id, bootstrap.client_id
            )));
        }
        let events = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| CollaborationError::Protocol("transport already connected".to_string()))?;
        if let Err(err) = self.ensure_open().await {
            *self.events_rx.lock() = Some(events);
            return Err(err);
        }
        Ok(events)
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        self.send_envelope(&envelope).await
    }

    async fn send(&self, peer: &ClientId, envelope: Envelope) -> Result<()> {
        if !self.peers.lock().contains(peer) {
            return Err(CollaborationError::PeerUnreachable(peer.clone()));
        }
        self.send_envelope(&envelope)
            .await
            .map_err(|_| CollaborationError::PeerUnreachable(peer.clone()))
    }

    async fn close_peer(&self, peer: &ClientId) {
        self.peers.lock().remove(peer);
    }

    async fn disconnect(&self) {
        self.pending.cancel_all();
        self.peers.lock().clear();
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.outbound.send(Message::Close(None));
            // give the writer a chance to flush the close frame
            tokio::task::yield_now().await;
            link.reader.abort();
            link.writer.abort();
        }
    }
}

#[async_trait]
impl HistoryServer for RelayTransport {
    async fn ensure_common_history(
        &self,
        history_ids: Vec<StepId>,
    ) -> Result<Option<DocumentSnapshot>> {
        match self
            .request_server(Request::EnsureCommonHistory { history_ids })
            .await?
        {
            Response::CommonHistory(document) => Ok(document),
            other => Err(unexpected(other)),
        }
    }

    async fn fetch_document(&self) -> Result<DocumentSnapshot> {
        match self.request_server(Request::FetchDocument).await? {
            Response::Document(document) => Ok(document),
            other => Err(unexpected(other)),
        }
    }

    async fn save_document(&self, snapshot: DocumentSnapshot) -> Result<()> {
        match self.request_server(Request::SaveDocument(snapshot)).await? {
            Response::Saved => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        match self.request_server(Request::GetIceServers).await? {
            Response::IceServers(servers) => Ok(servers),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> CollaborationError {
    CollaborationError::Protocol(format!("unexpected server response: {}", response.name()))
}
