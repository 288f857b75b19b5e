//! Wire envelope shared by the relay channel and direct peer channels.
//!
//! Every message is `{type, fromClientId, toClientId?, requestId?, ...}` where
//! the body is a typed `{name, payload}` union. Adding a message kind means
//! adding a variant, and every dispatcher matches exhaustively.

use serde::{Deserialize, Serialize};

use crate::transport::IceServer;
use crate::{
    ClientId, DocumentSnapshot, HistoryStep, MissingSteps, RequestId, Result, Selection, StepId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Request {
        from_client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_client_id: Option<ClientId>,
        request_id: RequestId,
        message: Request,
    },

    #[serde(rename_all = "camelCase")]
    Notification {
        from_client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_client_id: Option<ClientId>,
        message: Notification,
    },

    #[serde(rename_all = "camelCase")]
    Response {
        from_client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_client_id: Option<ClientId>,
        request_id: RequestId,
        message: Response,
    },
}

impl Envelope {
    pub fn from_client_id(&self) -> &ClientId {
        match self {
            Envelope::Request { from_client_id, .. }
            | Envelope::Notification { from_client_id, .. }
            | Envelope::Response { from_client_id, .. } => from_client_id,
        }
    }

    pub fn to_client_id(&self) -> Option<&ClientId> {
        match self {
            Envelope::Request { to_client_id, .. }
            | Envelope::Notification { to_client_id, .. }
            | Envelope::Response { to_client_id, .. } => to_client_id.as_ref(),
        }
    }

    /// Message name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::Request { message, .. } => message.name(),
            Envelope::Notification { message, .. } => message.name(),
            Envelope::Response { message, .. } => message.name(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages that expect exactly one response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "snake_case")]
pub enum Request {
    /// Handshake sent when a channel opens; answered with the session start time
    Hello,

    GetHistoryFromSnapshot,

    #[serde(rename_all = "camelCase")]
    GetMissingSteps {
        from_step_id: StepId,
        to_step_id: StepId,
    },

    GetClientName,

    GetClientAvatar,

    // Addressed to the server
    #[serde(rename_all = "camelCase")]
    EnsureCommonHistory { history_ids: Vec<StepId> },

    FetchDocument,

    SaveDocument(DocumentSnapshot),

    GetIceServers,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello => "hello",
            Request::GetHistoryFromSnapshot => "get_history_from_snapshot",
            Request::GetMissingSteps { .. } => "get_missing_steps",
            Request::GetClientName => "get_client_name",
            Request::GetClientAvatar => "get_client_avatar",
            Request::EnsureCommonHistory { .. } => "ensure_common_history",
            Request::FetchDocument => "fetch_document",
            Request::SaveDocument(_) => "save_document",
            Request::GetIceServers => "get_ice_servers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "snake_case")]
pub enum Response {
    #[serde(rename_all = "camelCase")]
    Hello { start_time: i64 },

    #[serde(rename_all = "camelCase")]
    HistoryFromSnapshot {
        steps: Vec<HistoryStep>,
        history_ids: Vec<StepId>,
        #[serde(default)]
        selection: Option<Selection>,
    },

    MissingSteps(MissingSteps),

    ClientName(String),

    ClientAvatar(Option<String>),

    /// `None` when the histories agree, otherwise the server copy to adopt
    CommonHistory(Option<DocumentSnapshot>),

    Document(DocumentSnapshot),

    Saved,

    IceServers(Vec<IceServer>),

    Error { message: String },
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Hello { .. } => "hello",
            Response::HistoryFromSnapshot { .. } => "history_from_snapshot",
            Response::MissingSteps(_) => "missing_steps",
            Response::ClientName(_) => "client_name",
            Response::ClientAvatar(_) => "client_avatar",
            Response::CommonHistory(_) => "common_history",
            Response::Document(_) => "document",
            Response::Saved => "saved",
            Response::IceServers(_) => "ice_servers",
            Response::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

/// Fire-and-forget messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    /// Announces a new client so existing peers open channels to it
    #[serde(rename_all = "camelCase")]
    Join { start_time: i64 },

    HistoryStep(HistoryStep),

    SelectionUpdate(SelectionUpdate),

    /// The sender is tearing its session down
    Disconnect,

    /// Sent by the relay when a member's socket closes
    #[serde(rename_all = "camelCase")]
    PeerLeft { client_id: ClientId },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Join { .. } => "join",
            Notification::HistoryStep(_) => "history_step",
            Notification::SelectionUpdate(_) => "selection_update",
            Notification::Disconnect => "disconnect",
            Notification::PeerLeft { .. } => "peer_left",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionUpdate {
    pub client_id: ClientId,
    pub anchor: serde_json::Value,
    pub focus: serde_json::Value,
}

impl SelectionUpdate {
    pub fn new(client_id: ClientId, selection: Selection) -> Self {
        Self {
            client_id,
            anchor: selection.anchor,
            focus: selection.focus,
        }
    }

    pub fn selection(&self) -> Selection {
        Selection::new(self.anchor.clone(), self.focus.clone())
    }
}
