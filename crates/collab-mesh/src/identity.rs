/// Client identity and the snapshot-donor tie-break
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::ClientId;

/// Display information other peers show next to our cursor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl ClientProfile {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// Identity of the local editing session. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: ClientId,

    /// Wall-clock session start (ms since epoch)
    pub start_time: i64,

    pub profile: ClientProfile,
}

impl ClientSession {
    /// Create a session with a fresh random id and the current time
    pub fn new(profile: ClientProfile) -> Self {
        Self {
            client_id: generate_client_id(),
            start_time: chrono::Utc::now().timestamp_millis(),
            profile,
        }
    }

    pub fn with_identity(client_id: ClientId, start_time: i64, profile: ClientProfile) -> Self {
        Self {
            client_id,
            start_time,
            profile,
        }
    }

    pub fn ordering_key(&self) -> (i64, &ClientId) {
        (self.start_time, &self.client_id)
    }
}

/// Large random integer rendered as a string
pub fn generate_client_id() -> ClientId {
    ClientId(uuid::Uuid::new_v4().as_u128().to_string())
}

/// Total order over `(start_time, client_id)`: the older session comes first,
/// ties go to the lexicographically smaller id.
pub fn compare_clients(
    a_start: i64,
    a_id: &ClientId,
    b_start: i64,
    b_id: &ClientId,
) -> Ordering {
    a_start.cmp(&b_start).then_with(|| a_id.cmp(b_id))
}

/// Whether `local` should act as snapshot donor towards `remote`
pub fn is_client_first(local_start: i64, local_id: &ClientId, remote_start: i64, remote_id: &ClientId) -> bool {
    compare_clients(local_start, local_id, remote_start, remote_id) == Ordering::Less
}
