use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::Gateway;
use crate::auth::IdentityGate;
use crate::commands::ServerEvent;
use crate::error::{PollError, PollResult};
use crate::models::AuthPayload;
use crate::rooms::Outbound;

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
}

/// `GET /polls/socket`. The credential is checked before the upgrade, so an
/// unauthenticated client never reaches a room.
pub async fn poll_socket(
    State(gateway): State<Gateway>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> PollResult<Response> {
    let token = IdentityGate::handshake_token(&headers, query.token.as_deref())?;
    let identity = gateway.service().gate().verify(&token)?;
    let ws = ws.ok_or_else(|| PollError::BadRequest("Expected a websocket upgrade".to_string()))?;

    info!("Socket handshake accepted for user {} in poll {}", identity.user_id, identity.poll_id);

    Ok(ws.on_upgrade(move |socket| run_connection(gateway, socket, identity, token)))
}

async fn run_connection(gateway: Gateway, socket: WebSocket, identity: AuthPayload, token: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Writer: the only task that touches the sink
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(event) => {
                    let text = match serde_json::to_string(event.as_ref()) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode server event: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let connection = match gateway.connect(identity, token, tx.clone()).await {
        Ok(connection) => connection,
        Err(err) => {
            let _ = tx.send(Outbound::Event(Arc::new(ServerEvent::from(&err))));
            let _ = tx.send(Outbound::Close);
            drop(tx);
            let _ = writer.await;
            return;
        }
    };
    drop(tx);

    let (actions, _action_worker) = gateway.spawn_actions(Arc::clone(&connection));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Queued, not awaited, so a disconnect never waits behind an action
                if actions.send(text).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                let err = PollError::BadRequest("Binary frames are not supported".to_string());
                connection.handle.send(Arc::new(ServerEvent::from(&err)));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Socket error on connection {}: {}", connection.handle.id, e);
                break;
            }
        }
    }

    gateway.disconnect(&connection).await;
    // Frames already queued still run against the store and reach whoever is left in the room
    drop(actions);
    writer.abort();
}
