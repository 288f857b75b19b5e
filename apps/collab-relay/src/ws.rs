/// One WebSocket connection: `ws://host/<document_id>?client_id=<id>`
use collab_mesh::ClientId;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::room::Relay;
use crate::store::is_valid_document_id;

/// Room membership requested by the connecting client
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    pub document_id: String,
    pub client_id: ClientId,
}

pub fn parse_membership(uri: &Uri) -> Result<Membership, String> {
    let document_id = uri.path().trim_start_matches('/');
    if !is_valid_document_id(document_id) {
        return Err(format!("invalid document id: {:?}", document_id));
    }

    let client_id = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .find_map(|pair| pair.strip_prefix("client_id="))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "missing client_id".to_string())?;
    let client_id = ClientId::from(client_id);
    if client_id.is_server() {
        return Err(format!("client id {} is reserved", client_id));
    }

    Ok(Membership {
        document_id: document_id.to_string(),
        client_id,
    })
}

fn bad_request(message: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, relay: Arc<Relay>) {
    let mut membership = None;
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        match parse_membership(request.uri()) {
            Ok(parsed) => {
                membership = Some(parsed);
                Ok(response)
            }
            Err(message) => Err(bad_request(message)),
        }
    })
    .await;

    let ws_stream = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let Some(Membership {
        document_id,
        client_id,
    }) = membership
    else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let connection = match relay.join(&document_id, &client_id, tx.clone()).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Rejecting {}: {}", addr, e);
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!("WebSocket connection established: {} as {} in {}", addr, client_id, document_id);

    // Task to send messages to client; a Close from the relay ends the connection
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = tx.closed() => {
                info!("Connection {} for {} replaced", addr, client_id);
                break;
            }
        };
        let Some(msg) = msg else {
            break;
        };
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = relay.route(&document_id, &client_id, &text).await {
                    warn!("Dropping message from {}: {}", client_id, e);
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("Client {} requested close", client_id);
                break;
            }
            _ => {}
        }
    }

    relay.leave(&document_id, &client_id, connection).await;
    send_task.abort();
    info!("Connection closed: {}", addr);
}
