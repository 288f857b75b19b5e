/// Collaborative cursors: debounced local broadcast and remote rendering
/// Lossy on purpose; only the latest position of each client matters.
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    ClientId, CollaborativeSelection, DocumentEngine, Notification, PeerInfo, PeerSessionManager,
    Request, Response, Result, Selection, SelectionUpdate,
};

pub struct SelectionBroadcaster {
    mesh: Arc<PeerSessionManager>,
    document: Arc<dyn DocumentEngine>,
    debounce: Duration,
    /// Latest unsent local selection; `Some` while a flush is scheduled
    pending: Arc<Mutex<Option<Selection>>>,
}

impl SelectionBroadcaster {
    pub fn new(
        mesh: Arc<PeerSessionManager>,
        document: Arc<dyn DocumentEngine>,
        debounce: Duration,
    ) -> Self {
        Self {
            mesh,
            document,
            debounce,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue `selection` for broadcast. Changes within one debounce window
    /// collapse into a single update carrying the last one.
    pub fn on_local_selection_change(&self, selection: Selection) {
        let scheduled = self.pending.lock().replace(selection).is_some();
        if scheduled {
            return;
        }

        let pending = self.pending.clone();
        let mesh = self.mesh.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(selection) = pending.lock().take() else {
                return;
            };
            if mesh.is_stopped() {
                return;
            }
            let update = SelectionUpdate::new(mesh.client_id().clone(), selection);
            mesh.notify_all(Notification::SelectionUpdate(update)).await;
        });
    }

    /// Render a peer's cursor. The sender of the envelope is authoritative
    /// for whose cursor it is.
    pub fn on_remote_selection_update(&self, from: &ClientId, update: SelectionUpdate) {
        if &update.client_id != from {
            debug!(peer = %from, claimed = %update.client_id, "selection update sender mismatch");
        }
        let selection = enrich_selection(from, update.selection(), self.mesh.peer(from).as_ref());
        self.document.apply_external_selection(selection);
    }

    pub fn on_peer_removed(&self, peer: &ClientId) {
        self.document.remove_external_selection(peer);
    }

    /// Fetch and cache the display name and avatar of `peer`
    pub async fn fetch_profile(&self, peer: &ClientId) -> Result<()> {
        let name = match self
            .mesh
            .request_peer(peer, Request::GetClientName, None)
            .await?
        {
            Response::ClientName(name) => Some(name),
            other => {
                warn!(peer = %peer, response = other.name(), "unexpected client name response");
                None
            }
        };

        let avatar = match self
            .mesh
            .request_peer(peer, Request::GetClientAvatar, None)
            .await?
        {
            Response::ClientAvatar(avatar) => avatar,
            other => {
                warn!(peer = %peer, response = other.name(), "unexpected client avatar response");
                None
            }
        };

        self.mesh.set_peer_profile(peer, name, avatar);
        Ok(())
    }
}

pub fn enrich_selection(
    client_id: &ClientId,
    selection: Selection,
    info: Option<&PeerInfo>,
) -> CollaborativeSelection {
    CollaborativeSelection {
        client_id: client_id.clone(),
        selection,
        client_name: info.and_then(|i| i.display_name.clone()),
        client_avatar_url: info.and_then(|i| i.avatar_url.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalMesh, TransportBootstrap, TransportEvent};
    use crate::{
        ClientProfile, ClientSession, DocumentSnapshot, Envelope, MemoryDocument, Transport,
    };
    use serde_json::json;
    use tokio::sync::{broadcast, mpsc};

    struct Pair {
        broadcaster: SelectionBroadcaster,
        mesh: Arc<PeerSessionManager>,
        document: Arc<MemoryDocument>,
        remote_rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    async fn pair() -> Pair {
        let hub = LocalMesh::new();
        let local = ClientSession::with_identity(ClientId::from("1"), 1, ClientProfile::new("me"));
        let transport = hub.endpoint();
        let _local_rx = transport
            .connect(TransportBootstrap {
                client_id: local.client_id.clone(),
                start_time: 1,
                ice_servers: Vec::new(),
            })
            .await
            .unwrap();
        let remote = hub.endpoint();
        let remote_rx = remote
            .connect(TransportBootstrap {
                client_id: ClientId::from("2"),
                start_time: 2,
                ice_servers: Vec::new(),
            })
            .await
            .unwrap();

        let (events, _) = broadcast::channel(16);
        let mesh = Arc::new(PeerSessionManager::new(
            local,
            Arc::new(transport),
            events,
            Duration::from_secs(1),
        ));
        mesh.join().await.unwrap();
        mesh.on_channel_open(&ClientId::from("2"));

        let document = Arc::new(MemoryDocument::new(
            ClientId::from("1"),
            DocumentSnapshot::default(),
        ));
        let broadcaster =
            SelectionBroadcaster::new(mesh.clone(), document.clone(), Duration::from_millis(50));
        Pair {
            broadcaster,
            mesh,
            document,
            remote_rx,
        }
    }

    fn selection_updates(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<SelectionUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Inbound(Envelope::Notification {
                message: Notification::SelectionUpdate(update),
                ..
            }) = event
            {
                updates.push(update);
            }
        }
        updates
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_changes_collapse_into_latest() {
        let mut p = pair().await;

        for offset in 0..5 {
            p.broadcaster
                .on_local_selection_change(Selection::caret(json!(offset)));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let updates = selection_updates(&mut p.remote_rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].anchor, json!(4));
        assert_eq!(updates[0].client_id, ClientId::from("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_send_separately() {
        let mut p = pair().await;

        p.broadcaster
            .on_local_selection_change(Selection::caret(json!(1)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        p.broadcaster
            .on_local_selection_change(Selection::caret(json!(2)));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(selection_updates(&mut p.remote_rx).len(), 2);
    }

    #[tokio::test]
    async fn test_remote_selection_enriched_from_cache() {
        let p = pair().await;
        let peer = ClientId::from("2");
        p.mesh
            .set_peer_profile(&peer, Some("Bob".to_string()), Some("bob.png".to_string()));

        p.broadcaster.on_remote_selection_update(
            &peer,
            SelectionUpdate::new(peer.clone(), Selection::caret(json!(3))),
        );

        let rendered = p.document.remote_selection(&peer).unwrap();
        assert_eq!(rendered.client_name.as_deref(), Some("Bob"));
        assert_eq!(rendered.client_avatar_url.as_deref(), Some("bob.png"));
        assert_eq!(rendered.selection, Selection::caret(json!(3)));
    }

    #[tokio::test]
    async fn test_peer_removal_clears_cursor() {
        let p = pair().await;
        let peer = ClientId::from("2");
        p.broadcaster.on_remote_selection_update(
            &peer,
            SelectionUpdate::new(peer.clone(), Selection::caret(json!(0))),
        );
        assert_eq!(p.document.remote_selection_count(), 1);

        p.broadcaster.on_peer_removed(&peer);

        assert_eq!(p.document.remote_selection_count(), 0);
    }
}
