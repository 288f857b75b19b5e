/// Request/response correlation over one-way channels
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{CollaborationError, RequestId, Response, Result};

type Reply = Result<Response>;

#[derive(Default)]
struct Inner {
    next_id: RequestId,
    waiting: HashMap<RequestId, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Outstanding requests keyed by id. Each id resolves at most once.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id and the receiver its response lands on
    pub fn register(&self) -> Result<(RequestId, oneshot::Receiver<Reply>)> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CollaborationError::SessionStopped);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = oneshot::channel();
        inner.waiting.insert(id, tx);
        Ok((id, rx))
    }

    /// Complete request `id`. Unknown or already-resolved ids are ignored.
    pub fn resolve(&self, id: RequestId, response: Response) -> bool {
        let Some(tx) = self.inner.lock().waiting.remove(&id) else {
            trace!(request_id = id, "dropping response for unknown request");
            return false;
        };
        let reply = match response {
            Response::Error { message } => Err(CollaborationError::Protocol(message)),
            other => Ok(other),
        };
        tx.send(reply).is_ok()
    }

    pub fn forget(&self, id: RequestId) {
        self.inner.lock().waiting.remove(&id);
    }

    /// Wait for the response to `id`, giving up after `timeout`
    pub async fn wait(
        &self,
        id: RequestId,
        rx: oneshot::Receiver<Reply>,
        timeout: Duration,
        what: &str,
    ) -> Result<Response> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(CollaborationError::Cancelled),
            Err(_) => {
                self.forget(id);
                Err(CollaborationError::Timeout(what.to_string()))
            }
        }
    }

    /// Fail every outstanding request and refuse new ones
    pub fn cancel_all(&self) {
        let waiting = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.waiting)
        };
        for (_, tx) in waiting {
            let _ = tx.send(Err(CollaborationError::Cancelled));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
