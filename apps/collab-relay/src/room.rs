/// Document rooms: envelope routing between members and the server side of
/// the protocol (history check, fetch, save, ICE servers)
use collab_mesh::transport::IceServer;
use collab_mesh::{histories_agree, ClientId, Envelope, Notification, Request, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::store::DocumentStore;

pub type Tx = mpsc::UnboundedSender<Message>;

/// Identifies one WebSocket connection of a member
pub type ConnectionId = u64;

struct Member {
    tx: Tx,
    connection: ConnectionId,
}

/// Clients editing one document
#[derive(Default)]
struct Room {
    members: HashMap<ClientId, Member>,
}

impl Room {
    fn send(&self, to: &ClientId, envelope: &Envelope) {
        let Some(Member { tx, .. }) = self.members.get(to) else {
            debug!(client_id = %to, message = envelope.name(), "dropping message for absent member");
            return;
        };
        match envelope.to_json() {
            Ok(json) => {
                if let Err(e) = tx.send(Message::Text(json)) {
                    error!("Failed to send to client {}: {}", to, e);
                }
            }
            Err(e) => error!("Failed to serialize message: {}", e),
        }
    }

    fn broadcast(&self, envelope: &Envelope, exclude: Option<&ClientId>) {
        let json = match envelope.to_json() {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                return;
            }
        };

        for (client_id, Member { tx, .. }) in &self.members {
            if Some(client_id) == exclude {
                continue;
            }
            if let Err(e) = tx.send(Message::Text(json.clone())) {
                error!("Failed to send to client {}: {}", client_id, e);
            }
        }
    }
}

pub struct Relay {
    rooms: RwLock<HashMap<String, Room>>,
    next_connection: AtomicU64,
    store: Arc<DocumentStore>,
    ice_servers: Vec<IceServer>,
}

impl Relay {
    pub fn new(store: Arc<DocumentStore>, ice_servers: Vec<IceServer>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            store,
            ice_servers,
        }
    }

    /// Add `client_id` to the room of `document_id`.
    ///
    /// A client that reconnects before its old socket timed out replaces the
    /// old connection, which is told to close.
    pub async fn join(
        &self,
        document_id: &str,
        client_id: &ClientId,
        tx: Tx,
    ) -> anyhow::Result<ConnectionId> {
        if client_id.is_server() {
            anyhow::bail!("client id {} is reserved", client_id);
        }
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(document_id.to_string()).or_default();
        if let Some(stale) = room
            .members
            .insert(client_id.clone(), Member { tx, connection })
        {
            warn!(document_id, client_id = %client_id, "client rejoined, closing its previous connection");
            let _ = stale.tx.send(Message::Close(None));
        }
        info!(document_id, client_id = %client_id, members = room.members.len(), "client joined");
        Ok(connection)
    }

    /// Remove `client_id` and tell the remaining members. Empty rooms are dropped.
    /// Does nothing if `connection` was already replaced by a newer one.
    pub async fn leave(&self, document_id: &str, client_id: &ClientId, connection: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(document_id) else {
            return;
        };
        match room.members.get(client_id) {
            Some(member) if member.connection == connection => {}
            _ => return,
        }
        room.members.remove(client_id);
        info!(document_id, client_id = %client_id, "client left");

        let left = Envelope::Notification {
            from_client_id: ClientId::server(),
            to_client_id: None,
            message: Notification::PeerLeft {
                client_id: client_id.clone(),
            },
        };
        room.broadcast(&left, None);

        if room.members.is_empty() {
            info!(document_id, "room is empty, removing");
            rooms.remove(document_id);
        }
    }

    /// Route one text frame from `sender`
    pub async fn route(&self, document_id: &str, sender: &ClientId, text: &str) -> anyhow::Result<()> {
        let envelope = Envelope::from_json(text)?;
        if envelope.from_client_id() != sender {
            anyhow::bail!(
                "client {} sent a message as {}",
                sender,
                envelope.from_client_id()
            );
        }

        if let Envelope::Request {
            to_client_id: Some(to),
            request_id,
            message,
            ..
        } = &envelope
        {
            if to.is_server() {
                let response = self.answer(document_id, message.clone());
                let reply = Envelope::Response {
                    from_client_id: ClientId::server(),
                    to_client_id: Some(sender.clone()),
                    request_id: *request_id,
                    message: response,
                };
                let rooms = self.rooms.read().await;
                if let Some(room) = rooms.get(document_id) {
                    room.send(sender, &reply);
                }
                return Ok(());
            }
        }

        let rooms = self.rooms.read().await;
        let room = rooms
            .get(document_id)
            .ok_or_else(|| anyhow::anyhow!("Room not found"))?;
        match envelope.to_client_id() {
            Some(to) if to.is_server() => {
                warn!(client_id = %sender, message = envelope.name(), "unexpected message for the server");
            }
            Some(to) => room.send(to, &envelope),
            None => room.broadcast(&envelope, Some(sender)),
        }
        Ok(())
    }

    /// Server side of the requests addressed to `server`
    pub fn answer(&self, document_id: &str, request: Request) -> Response {
        match request {
            Request::EnsureCommonHistory { history_ids } => {
                let stored = self.store.get(document_id);
                if histories_agree(&stored.history_ids, &history_ids) {
                    Response::CommonHistory(None)
                } else {
                    debug!(document_id, "client history diverged from the stored copy");
                    Response::CommonHistory(Some(stored))
                }
            }
            Request::FetchDocument => Response::Document(self.store.get(document_id)),
            Request::SaveDocument(document) => match self.store.put(document_id, document) {
                Ok(()) => Response::Saved,
                Err(e) => {
                    error!(document_id, "Failed to save document: {}", e);
                    Response::error(format!("save failed: {}", e))
                }
            },
            Request::GetIceServers => Response::IceServers(self.ice_servers.clone()),
            other => Response::error(format!("{} is a peer request", other.name())),
        }
    }

    pub async fn member_count(&self, document_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(document_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_mesh::{DocumentSnapshot, StepId};

    fn relay() -> Relay {
        Relay::new(
            Arc::new(DocumentStore::in_memory()),
            vec![IceServer::new("stun:stun.example.org:3478")],
        )
    }

    async fn member(relay: &Relay, id: &str) -> mpsc::UnboundedReceiver<Message> {
        joined(relay, id).await.1
    }

    async fn joined(relay: &Relay, id: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = relay.join("doc", &ClientId::from(id), tx).await.unwrap();
        (connection, rx)
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            envelopes.push(Envelope::from_json(&text).unwrap());
        }
        envelopes
    }

    fn join_from(id: &str) -> String {
        Envelope::Notification {
            from_client_id: ClientId::from(id),
            to_client_id: None,
            message: Notification::Join { start_time: 1 },
        }
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let relay = relay();
        let mut a = member(&relay, "a").await;
        let mut b = member(&relay, "b").await;
        let mut c = member(&relay, "c").await;

        relay.route("doc", &ClientId::from("a"), &join_from("a")).await.unwrap();

        assert!(received(&mut a).is_empty());
        assert_eq!(received(&mut b).len(), 1);
        assert_eq!(received(&mut c).len(), 1);
    }

    #[tokio::test]
    async fn test_addressed_message_reaches_one_member() {
        let relay = relay();
        let _a = member(&relay, "a").await;
        let mut b = member(&relay, "b").await;
        let mut c = member(&relay, "c").await;

        let text = Envelope::Request {
            from_client_id: ClientId::from("a"),
            to_client_id: Some(ClientId::from("b")),
            request_id: 3,
            message: Request::GetClientName,
        }
        .to_json()
        .unwrap();
        relay.route("doc", &ClientId::from("a"), &text).await.unwrap();

        assert_eq!(received(&mut b).len(), 1);
        assert!(received(&mut c).is_empty());
    }

    #[tokio::test]
    async fn test_spoofed_sender_rejected() {
        let relay = relay();
        let _a = member(&relay, "a").await;
        let mut b = member(&relay, "b").await;

        let result = relay.route("doc", &ClientId::from("a"), &join_from("b")).await;

        assert!(result.is_err());
        assert!(received(&mut b).is_empty());
    }

    #[tokio::test]
    async fn test_server_id_reserved() {
        let relay = relay();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(relay.join("doc", &ClientId::server(), tx).await.is_err());
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_stale_connection() {
        let relay = relay();
        let (stale, mut old_rx) = joined(&relay, "a").await;
        let mut b = member(&relay, "b").await;

        let (fresh, mut new_rx) = joined(&relay, "a").await;
        assert_ne!(stale, fresh);
        assert!(matches!(old_rx.try_recv(), Ok(Message::Close(_))));
        assert_eq!(relay.member_count("doc").await, 2);

        // the old socket finally notices and leaves
        relay.leave("doc", &ClientId::from("a"), stale).await;
        assert_eq!(relay.member_count("doc").await, 2);
        assert!(received(&mut b).is_empty());

        relay.route("doc", &ClientId::from("b"), &join_from("b")).await.unwrap();
        assert_eq!(received(&mut new_rx).len(), 1);
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_request_answered_to_sender() {
        let relay = relay();
        let mut a = member(&relay, "a").await;
        let mut b = member(&relay, "b").await;

        let text = Envelope::Request {
            from_client_id: ClientId::from("a"),
            to_client_id: Some(ClientId::server()),
            request_id: 9,
            message: Request::GetIceServers,
        }
        .to_json()
        .unwrap();
        relay.route("doc", &ClientId::from("a"), &text).await.unwrap();

        let replies = received(&mut a);
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            Envelope::Response {
                request_id,
                message: Response::IceServers(servers),
                ..
            } => {
                assert_eq!(*request_id, 9);
                assert_eq!(servers.len(), 1);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(received(&mut b).is_empty());
    }

    #[test]
    fn test_history_check_against_stored_copy() {
        let relay = relay();
        let saved = DocumentSnapshot::new(vec![StepId::from("root"), StepId::from("s1")], "saved");
        assert_eq!(relay.answer("doc", Request::SaveDocument(saved.clone())), Response::Saved);

        let behind = relay.answer(
            "doc",
            Request::EnsureCommonHistory {
                history_ids: vec![StepId::from("root")],
            },
        );
        assert_eq!(behind, Response::CommonHistory(Some(saved.clone())));

        let ahead = relay.answer(
            "doc",
            Request::EnsureCommonHistory {
                history_ids: vec![StepId::from("root"), StepId::from("s1"), StepId::from("s2")],
            },
        );
        assert_eq!(ahead, Response::CommonHistory(None));

        assert_eq!(relay.answer("doc", Request::FetchDocument), Response::Document(saved));
    }

    #[test]
    fn test_peer_requests_not_served() {
        let relay = relay();
        assert!(matches!(
            relay.answer("doc", Request::GetHistoryFromSnapshot),
            Response::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_leave_notifies_and_drops_empty_room() {
        let relay = relay();
        let (a, _a_rx) = joined(&relay, "a").await;
        let (b, mut b_rx) = joined(&relay, "b").await;

        relay.leave("doc", &ClientId::from("a"), a).await;
        let notices = received(&mut b_rx);
        assert!(matches!(
            &notices[..],
            [Envelope::Notification {
                message: Notification::PeerLeft { client_id },
                ..
            }] if client_id == &ClientId::from("a")
        ));
        assert_eq!(relay.member_count("doc").await, 1);

        relay.leave("doc", &ClientId::from("b"), b).await;
        assert_eq!(relay.room_count().await, 0);
    }
}
