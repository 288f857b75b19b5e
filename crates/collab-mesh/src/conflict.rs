/// Divergence between the local branch and the server copy, and how it is reported
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::transport::IceServer;
use crate::{CollaborationError, DocumentSnapshot, Result, StepId};

/// The authoritative persisted copy of the document
#[async_trait]
pub trait HistoryServer: Send + Sync {
    /// `None` if the server history is a prefix of `history_ids`, otherwise
    /// the server copy the client must adopt
    async fn ensure_common_history(
        &self,
        history_ids: Vec<StepId>,
    ) -> Result<Option<DocumentSnapshot>>;

    async fn fetch_document(&self) -> Result<DocumentSnapshot>;

    async fn save_document(&self, snapshot: DocumentSnapshot) -> Result<()>;

    async fn ice_servers(&self) -> Result<Vec<IceServer>>;
}

/// Histories agree when the server head appears somewhere in the local branch
pub fn histories_agree(server_ids: &[StepId], local_ids: &[StepId]) -> bool {
    match server_ids.last() {
        Some(head) => local_ids.contains(head),
        None => true,
    }
}

/// What happened when the local branch lost against the server copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    /// Server copy that was adopted
    pub server: DocumentSnapshot,

    /// Local state that was discarded
    pub discarded_local: DocumentSnapshot,

    pub detected_at: chrono::DateTime<chrono::Utc>,
}

impl ConflictReport {
    pub fn new(server: DocumentSnapshot, discarded_local: DocumentSnapshot) -> Self {
        Self {
            server,
            discarded_local,
            detected_at: chrono::Utc::now(),
        }
    }

    /// Local step ids that did not survive adoption
    pub fn lost_local_changes(&self) -> Vec<StepId> {
        self.discarded_local
            .history_ids
            .iter()
            .filter(|id| !self.server.history_ids.contains(id))
            .cloned()
            .collect()
    }
}

type ConflictHandler = Arc<dyn Fn(&ConflictReport) + Send + Sync>;

/// Callbacks registered through `on_conflict`
#[derive(Clone, Default)]
pub struct ConflictHandlers {
    handlers: Arc<Mutex<Vec<ConflictHandler>>>,
}

impl ConflictHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, handler: F)
    where
        F: Fn(&ConflictReport) + Send + Sync + 'static,
    {
        self.handlers.lock().push(Arc::new(handler));
    }

    /// Handlers run outside the lock and may register further handlers
    pub fn notify(&self, report: &ConflictReport) {
        let handlers: Vec<ConflictHandler> = self.handlers.lock().clone();
        for handler in handlers {
            handler(report);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct MemoryServerState {
    document: DocumentSnapshot,
    ice_servers: Vec<IceServer>,
    unreachable: bool,
    ensure_calls: usize,
    fetch_calls: usize,
    ice_calls: usize,
    saves: usize,
}

/// In-memory server copy for tests and local demos
#[derive(Clone, Default)]
pub struct MemoryHistoryServer {
    state: Arc<Mutex<MemoryServerState>>,
}

impl MemoryHistoryServer {
    pub fn new(document: DocumentSnapshot) -> Self {
        let server = Self::default();
        server.state.lock().document = document;
        server
    }

    pub fn with_ice_servers(self, ice_servers: Vec<IceServer>) -> Self {
        self.state.lock().ice_servers = ice_servers;
        self
    }

    pub fn set_document(&self, document: DocumentSnapshot) {
        self.state.lock().document = document;
    }

    pub fn document(&self) -> DocumentSnapshot {
        self.state.lock().document.clone()
    }

    /// Make every call fail with a network error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn ensure_calls(&self) -> usize {
        self.state.lock().ensure_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetch_calls
    }

    pub fn ice_calls(&self) -> usize {
        self.state.lock().ice_calls
    }

    pub fn saves(&self) -> usize {
        self.state.lock().saves
    }

    fn check_reachable(state: &MemoryServerState) -> Result<()> {
        if state.unreachable {
            return Err(CollaborationError::NetworkError(
                "server unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryServer for MemoryHistoryServer {
    async fn ensure_common_history(
        &self,
        history_ids: Vec<StepId>,
    ) -> Result<Option<DocumentSnapshot>> {
        let mut state = self.state.lock();
        state.ensure_calls += 1;
        Self::check_reachable(&state)?;

        if histories_agree(&state.document.history_ids, &history_ids) {
            Ok(None)
        } else {
            Ok(Some(state.document.clone()))
        }
    }

    async fn fetch_document(&self) -> Result<DocumentSnapshot> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        Self::check_reachable(&state)?;
        Ok(state.document.clone())
    }

    async fn save_document(&self, snapshot: DocumentSnapshot) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_reachable(&state)?;
        state.saves += 1;
        state.document = snapshot;
        Ok(())
    }

    async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        let mut state = self.state.lock();
        state.ice_calls += 1;
        Self::check_reachable(&state)?;
        Ok(state.ice_servers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(names: &[&str]) -> Vec<StepId> {
        names.iter().map(|n| StepId::from(*n)).collect()
    }

    #[test]
    fn test_histories_agree_when_server_head_is_local() {
        assert!(histories_agree(&ids(&["a", "b"]), &ids(&["a", "b", "c"])));
        assert!(histories_agree(&ids(&["a", "b"]), &ids(&["a", "b"])));
        assert!(histories_agree(&[], &ids(&["a"])));
    }

    #[test]
    fn test_histories_diverge_when_server_moved_on() {
        assert!(!histories_agree(&ids(&["a", "x"]), &ids(&["a", "b"])));
        assert!(!histories_agree(&ids(&["a"]), &[]));
    }

    #[test]
    fn test_lost_local_changes() {
        let report = ConflictReport::new(
            DocumentSnapshot::new(ids(&["a", "x"]), "server"),
            DocumentSnapshot::new(ids(&["a", "b", "c"]), "local"),
        );

        assert_eq!(report.lost_local_changes(), ids(&["b", "c"]));
    }

    #[test]
    fn test_handlers_all_notified() {
        let handlers = ConflictHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = count.clone();
            handlers.add(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let report = ConflictReport::new(
            DocumentSnapshot::new(ids(&["x"]), ""),
            DocumentSnapshot::new(ids(&["a"]), ""),
        );
        handlers.notify(&report);

        assert_eq!(handlers.len(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_may_register_another() {
        let handlers = ConflictHandlers::new();
        {
            let registry = handlers.clone();
            handlers.add(move |_| registry.add(|_| {}));
        }

        let report = ConflictReport::new(
            DocumentSnapshot::new(ids(&["x"]), ""),
            DocumentSnapshot::new(ids(&["a"]), ""),
        );
        handlers.notify(&report);

        assert_eq!(handlers.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_server_reports_divergence() {
        let server = MemoryHistoryServer::new(DocumentSnapshot::new(ids(&["a", "x"]), "srv"));

        let agreed = server
            .ensure_common_history(ids(&["a", "x", "y"]))
            .await
            .unwrap();
        assert_eq!(agreed, None);

        let diverged = server.ensure_common_history(ids(&["a", "b"])).await.unwrap();
        assert_eq!(diverged.map(|d| d.content), Some("srv".to_string()));
        assert_eq!(server.ensure_calls(), 2);
    }

    #[tokio::test]
    async fn test_memory_server_unreachable() {
        let server = MemoryHistoryServer::new(DocumentSnapshot::new(ids(&["a"]), ""));
        server.set_unreachable(true);

        assert!(matches!(
            server.fetch_document().await,
            Err(CollaborationError::NetworkError(_))
        ));
    }
}
