//! Peer-to-peer collaborative editing synchronization.
//!
//! Keeps several editors of the same rich-text document consistent without a
//! central server ordering every edit: a mesh of direct peer channels with
//! signaling over a relay, snapshot transfer and step backfill between peers,
//! live step and selection broadcast, and an online/offline heuristic that
//! checks the local history against the server copy on reconnection.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod config;
pub use config::*;

mod identity;
pub use identity::*;

pub mod message;
pub use message::{Envelope, Notification, Request, Response, SelectionUpdate};

pub mod document;
pub use document::*;

pub mod transport;
pub use transport::{Transport, TransportBootstrap, TransportEvent};

mod rpc;
pub use rpc::PendingRequests;

mod registry;
pub use registry::*;

mod peer;
pub use peer::*;

mod sync;
pub use sync::*;

mod presence;
pub use presence::*;

mod conflict;
pub use conflict::*;

mod connectivity;
pub use connectivity::*;

mod session;
pub use session::*;

#[derive(Debug, Clone, Error)]
pub enum CollaborationError {
    /// A specific peer did not answer, or has no open channel.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(ClientId),

    /// The relay channel itself is down; no new connections can be formed.
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// The snapshot donor's history no longer contains our root step.
    #[error("stale snapshot from {0}")]
    StaleSnapshot(ClientId),

    /// The origin answered `get_missing_steps` with the `-1` sentinel.
    #[error("missing steps unavailable from {0}")]
    MissingStepsUnavailable(ClientId),

    /// Local and server branches diverged.
    #[error("history conflict: local branch diverged from the server copy")]
    HistoryConflict,

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("document already has an active collaboration session: {0}")]
    AlreadyCollaborating(String),

    #[error("session stopped")]
    SessionStopped,

    #[error("save rejected: {0}")]
    SaveRejected(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CollaborationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Reserved id the relay server answers to.
pub const SERVER_CLIENT_ID: &str = "server";

/// Identifier of one editing session (one browser tab, one editor).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn server() -> Self {
        Self(SERVER_CLIENT_ID.to_string())
    }

    pub fn is_server(&self) -> bool {
        self.0 == SERVER_CLIENT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a history step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Correlates a response with the request that caused it.
pub type RequestId = u64;
