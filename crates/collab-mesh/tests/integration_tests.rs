/// Multi-client scenarios over the in-process mesh
/// Joining, step propagation, backfill, stop, and offline/online recovery
use collab_mesh::transport::LocalMesh;
use collab_mesh::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Memory document that counts how often it served a snapshot
struct SpyDocument {
    inner: MemoryDocument,
    snapshots_served: AtomicUsize,
}

impl SpyDocument {
    fn new(client_id: &ClientId, base: DocumentSnapshot) -> Self {
        Self {
            inner: MemoryDocument::new(client_id.clone(), base),
            snapshots_served: AtomicUsize::new(0),
        }
    }

    fn snapshots_served(&self) -> usize {
        self.snapshots_served.load(Ordering::SeqCst)
    }
}

impl DocumentEngine for SpyDocument {
    fn branch_ids(&self) -> Vec<StepId> {
        self.inner.branch_ids()
    }

    fn snapshot_steps(&self) -> Vec<HistoryStep> {
        self.snapshots_served.fetch_add(1, Ordering::SeqCst);
        self.inner.snapshot_steps()
    }

    fn missing_steps(&self, from: &StepId, to: &StepId) -> MissingSteps {
        self.inner.missing_steps(from, to)
    }

    fn apply_external_steps(&self, steps: Vec<HistoryStep>) {
        self.inner.apply_external_steps(steps)
    }

    fn apply_external_selection(&self, selection: CollaborativeSelection) {
        self.inner.apply_external_selection(selection)
    }

    fn remove_external_selection(&self, client_id: &ClientId) {
        self.inner.remove_external_selection(client_id)
    }

    fn current_selection(&self) -> Option<Selection> {
        self.inner.current_selection()
    }

    fn snapshot(&self) -> DocumentSnapshot {
        self.inner.snapshot()
    }

    fn replace_content(&self, snapshot: DocumentSnapshot) {
        self.inner.replace_content(snapshot)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.inner.subscribe()
    }
}

struct Client {
    id: ClientId,
    session: Arc<CollabSession>,
    document: Arc<SpyDocument>,
}

impl Client {
    fn content(&self) -> String {
        self.document.inner.content()
    }

    fn commit(&self, text: &str) -> HistoryStep {
        self.document.inner.commit_local(text)
    }

    fn has_step(&self, step: &HistoryStep) -> bool {
        self.document.branch_ids().contains(&step.id)
    }
}

fn base() -> DocumentSnapshot {
    DocumentSnapshot::new(vec![StepId::from("root")], "")
}

fn config() -> CollabConfig {
    CollabConfig::default()
        .with_request_timeout(Duration::from_secs(2))
        .with_selection_debounce(Duration::from_millis(20))
        .with_sample_interval(Duration::from_millis(50))
        .with_offline_grace(Duration::from_millis(100))
}

async fn start_client(
    hub: &LocalMesh,
    server: &MemoryHistoryServer,
    id: &str,
    start_time: i64,
    document_base: DocumentSnapshot,
) -> Client {
    let id = ClientId::from(id);
    let document = Arc::new(SpyDocument::new(&id, document_base));
    let identity = ClientSession::with_identity(
        id.clone(),
        start_time,
        ClientProfile::new(format!("user-{}", id)).with_avatar(format!("{}.png", id)),
    );
    let options = SessionOptions::new("doc", identity.profile.clone())
        .with_config(config())
        .with_identity(identity);

    // one registry per client: each would live in its own process
    let session = CollabSession::start(
        document.clone(),
        Arc::new(hub.endpoint()),
        Arc::new(server.clone()),
        Arc::new(SessionRegistry::new()),
        options,
    )
    .await
    .expect("session starts");

    Client {
        id,
        session,
        document,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn synced_pair(hub: &LocalMesh, server: &MemoryHistoryServer) -> (Client, Client) {
    let a = start_client(hub, server, "100", 1, base()).await;
    let b = start_client(hub, server, "200", 2, base()).await;
    wait_until("both synced", || {
        a.session.sync_phase() == SyncPhase::Synced && b.session.sync_phase() == SyncPhase::Synced
    })
    .await;
    (a, b)
}

#[tokio::test]
async fn test_two_clients_happy_path() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());

    let a = start_client(&hub, &server, "100", 1, base()).await;
    a.commit("a1 ");
    assert_eq!(a.session.peer_count(), 0);

    let b = start_client(&hub, &server, "200", 2, base()).await;
    wait_until("b synced with a's snapshot", || {
        b.session.sync_phase() == SyncPhase::Synced && b.content() == "a1 "
    })
    .await;
    wait_until("a synced as donor", || a.session.sync_phase() == SyncPhase::Synced).await;
    assert_eq!(a.document.snapshots_served(), 1);
    assert_eq!(b.document.snapshots_served(), 0);

    let a2 = a.commit("a2 ");
    wait_until("b received a2", || b.has_step(&a2)).await;

    let b1 = b.commit("b1");
    wait_until("a received b1", || a.has_step(&b1)).await;

    assert_eq!(a.content(), "a1 a2 b1");
    assert_eq!(a.content(), b.content());
    assert_eq!(a.document.branch_ids(), b.document.branch_ids());
}

#[tokio::test]
async fn test_simultaneous_join_single_snapshot_transfer() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());

    let (a, b) = tokio::join!(
        start_client(&hub, &server, "100", 5, base()),
        start_client(&hub, &server, "200", 5, base()),
    );
    wait_until("both synced", || {
        a.session.sync_phase() == SyncPhase::Synced && b.session.sync_phase() == SyncPhase::Synced
    })
    .await;

    // equal start times: the smaller id is first and only serves
    assert_eq!(a.document.snapshots_served(), 1);
    assert_eq!(b.document.snapshots_served(), 0);
}

#[tokio::test]
async fn test_peer_profiles_and_selection() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());
    let (a, b) = synced_pair(&hub, &server).await;

    wait_until("profile cached", || {
        b.session
            .peers()
            .iter()
            .any(|p| p.display_name.as_deref() == Some("user-100"))
    })
    .await;

    a.document
        .inner
        .set_selection(Selection::new(json!(1), json!(4)));

    wait_until("selection rendered on b", || {
        b.document.inner.remote_selection(&a.id).is_some()
    })
    .await;
    let rendered = b.document.inner.remote_selection(&a.id).unwrap();
    assert_eq!(rendered.selection, Selection::new(json!(1), json!(4)));
    assert_eq!(rendered.client_name.as_deref(), Some("user-100"));
    assert_eq!(rendered.client_avatar_url.as_deref(), Some("100.png"));

    a.session.stop().await;
    wait_until("cursor removed", || {
        b.document.inner.remote_selection_count() == 0
    })
    .await;
}

#[tokio::test]
async fn test_stop_twice_leaves_no_peers() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());
    let (a, b) = synced_pair(&hub, &server).await;

    b.session.stop().await;
    b.session.stop().await;

    assert_eq!(b.session.peer_count(), 0);
    wait_until("a dropped b", || a.session.peer_count() == 0).await;

    // a keeps editing alone
    a.commit("still here");
    assert_eq!(a.content(), "still here");
}

#[tokio::test]
async fn test_stale_donor_falls_back_to_server_copy() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(DocumentSnapshot::new(
        vec![StepId::from("fresh-root"), StepId::from("saved")],
        "server copy",
    ));

    let a = start_client(&hub, &server, "100", 1, base()).await;
    let a1 = a.commit("a1");
    let b = start_client(
        &hub,
        &server,
        "200",
        2,
        DocumentSnapshot::new(vec![StepId::from("fresh-root")], ""),
    )
    .await;

    wait_until("b synced", || b.session.sync_phase() == SyncPhase::Synced).await;
    assert_eq!(b.content(), "server copy");
    assert!(!b.has_step(&a1));
    assert!(server.fetch_calls() >= 1);
}

#[tokio::test]
async fn test_gap_backfilled_from_origin() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());
    let (a, b) = synced_pair(&hub, &server).await;

    a.session.network_signal(NetworkSignal::BrowserOffline).await;
    let a1 = a.commit("a1 ");
    a.session.network_signal(NetworkSignal::BrowserOnline).await;
    assert!(a.session.is_online());
    assert!(!b.has_step(&a1));

    let a2 = a.commit("a2");
    wait_until("b backfilled", || b.has_step(&a2)).await;

    assert!(b.has_step(&a1));
    assert_eq!(b.content(), "a1 a2");
}

#[tokio::test]
async fn test_missing_steps_sentinel_leaves_step_unapplied() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());
    let (a, b) = synced_pair(&hub, &server).await;

    for client in [&a, &b] {
        client
            .session
            .network_signal(NetworkSignal::BrowserOffline)
            .await;
    }
    a.commit("a1");
    b.commit("b1");
    for client in [&a, &b] {
        client
            .session
            .network_signal(NetworkSignal::BrowserOnline)
            .await;
    }

    // b asks a for steps since b1, which a never saw
    let a2 = a.commit("a2");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!b.has_step(&a2));
    assert_eq!(b.content(), "b1");
    assert_eq!(b.session.peer_count(), 1);
}

#[tokio::test]
async fn test_conflict_adopts_server_copy_and_rejoins() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());
    let (a, _b) = synced_pair(&hub, &server).await;
    assert_eq!(hub.join_count(&a.id), 1);

    let reports = Arc::new(Mutex::new(Vec::new()));
    {
        let reports = reports.clone();
        a.session
            .on_conflict(move |report| reports.lock().push(report.clone()));
    }
    let mut events = a.session.events();

    a.session.network_signal(NetworkSignal::BrowserOffline).await;
    a.commit("unsynced edit");
    let server_copy = DocumentSnapshot::new(
        vec![StepId::from("root"), StepId::from("saved-elsewhere")],
        "authoritative",
    );
    server.set_document(server_copy.clone());
    a.session.network_signal(NetworkSignal::BrowserOnline).await;

    assert_eq!(a.document.snapshot(), server_copy);
    assert_eq!(a.content(), "authoritative");
    assert_eq!(hub.join_count(&a.id), 2);

    let reports = reports.lock().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].discarded_local.content, "unsynced edit");

    let mut saw_conflict = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CollabEvent::Conflict(_)) {
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);
}

#[tokio::test]
async fn test_offline_online_without_divergence() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());
    let (a, b) = synced_pair(&hub, &server).await;
    let conflicts = Arc::new(AtomicUsize::new(0));
    {
        let conflicts = conflicts.clone();
        a.session.on_conflict(move |_| {
            conflicts.fetch_add(1, Ordering::SeqCst);
        });
    }

    hub.set_link_state(&a.id, &b.id, ConnectionState::Failed);
    wait_until("a detects silent disconnect", || !a.session.is_online()).await;

    a.commit("edited offline");
    let save = {
        let session = a.session.clone();
        tokio::spawn(async move { session.save().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!save.is_finished());
    assert_eq!(server.saves(), 0);

    hub.reconnect(&a.id, &b.id);
    a.session
        .network_signal(NetworkSignal::UserActivity {
            navigator_online: true,
        })
        .await;

    assert!(a.session.is_online());
    save.await.unwrap().unwrap();
    assert_eq!(server.saves(), 1);
    assert_eq!(server.document().content, "edited offline");
    assert_eq!(conflicts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_back_online_after_peer_left_for_good() {
    let hub = LocalMesh::new();
    let server = MemoryHistoryServer::new(base());
    let (a, b) = synced_pair(&hub, &server).await;

    hub.set_link_state(&a.id, &b.id, ConnectionState::Failed);
    b.session.stop().await;
    wait_until("a goes offline", || !a.session.is_online()).await;
    let joins = hub.join_count(&a.id);

    a.commit("edited alone");
    a.session
        .network_signal(NetworkSignal::UserActivity {
            navigator_online: true,
        })
        .await;

    // several grace periods with nobody to talk to
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(a.session.is_online());
    assert_eq!(a.session.peer_count(), 0);
    assert_eq!(hub.join_count(&a.id), joins + 1);
    tokio::time::timeout(Duration::from_secs(1), a.session.save())
        .await
        .expect("save finishes while online")
        .unwrap();
    assert_eq!(server.document().content, "edited alone");
}
