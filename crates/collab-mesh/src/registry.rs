/// Active collaboration sessions and process-lifetime transport bootstrap data
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::transport::IceServer;
use crate::{CollaborationError, HistoryServer, Result};

/// Tracks which documents already have a collaboration channel open.
///
/// Passed explicitly into `CollabSession::start` so tests can use independent
/// registries. Also caches the ICE server list, fetched once per registry.
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashSet<String>>,
    ice_servers: OnceCell<Vec<IceServer>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, document_id: &str) -> Result<()> {
        let mut active = self.active.lock();
        if !active.insert(document_id.to_string()) {
            return Err(CollaborationError::AlreadyCollaborating(
                document_id.to_string(),
            ));
        }
        info!(document_id, "collaboration session registered");
        Ok(())
    }

    /// Returns whether the document was registered
    pub fn unregister(&self, document_id: &str) -> bool {
        let removed = self.active.lock().remove(document_id);
        if removed {
            info!(document_id, "collaboration session unregistered");
        }
        removed
    }

    pub fn is_active(&self, document_id: &str) -> bool {
        self.active.lock().contains(document_id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ICE servers, fetched from `server` on first use and cached afterwards.
    /// A failed fetch is not cached.
    pub async fn ice_servers(&self, server: &dyn HistoryServer) -> Result<Vec<IceServer>> {
        let servers = self
            .ice_servers
            .get_or_try_init(|| async {
                debug!("fetching ice servers");
                server.ice_servers().await
            })
            .await?;
        Ok(servers.clone())
    }
}
