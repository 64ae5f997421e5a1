//! WebSocket endpoint: one task per connection.
//!
//! Authentication happens at the external gateway; this endpoint trusts the
//! `user_id` query parameter.  Frame handling is strictly sequential per
//! connection, so a client's own frames are processed in the order it sent
//! them.  A malformed frame produces an `error` frame and the socket stays
//! open; only close, transport error, or the stale-connection sweep end the
//! session.

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_shared::envelope::ClientFrame;
use courier_shared::{ConnectionId, PresenceStatus, ServerFrame, UserId};

use crate::api::AppState;
use crate::error::ServerError;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: UserId,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params.user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let connection_id = ConnectionId::new();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let first = state.registry.register(connection_id, user_id, tx.clone()).await;
    info!(connection = %connection_id, user = %user_id, first, "connection opened");

    let _ = tx.send(ServerFrame::ConnectionAck {
        connection_id,
        user_id,
    });

    if first {
        state.service.set_presence(user_id, PresenceStatus::Online).await;
    }
    let flushed = state.broadcaster.flush_offline(user_id).await;
    if flushed > 0 {
        debug!(user = %user_id, count = flushed, "delivered queued events on connect");
    }

    // Outgoing pump: everything addressed to this connection funnels through
    // the mpsc channel, interleaved with heartbeat frames.
    let heartbeat_interval = state.config.heartbeat_interval;
    let pump = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await; // the first tick fires immediately
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = heartbeat.tick() => ServerFrame::Heartbeat {
                    timestamp: Utc::now(),
                },
            };
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "frame serialization failed");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "transport error");
                break;
            }
        };
        state.registry.touch(connection_id).await;
        state.presence.heartbeat(user_id).await;

        match message {
            Message::Text(text) => {
                let frame = match ClientFrame::from_json(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = tx.send(ServerFrame::Error {
                            message: format!("malformed frame: {e}"),
                        });
                        continue;
                    }
                };
                if let Err(e) = handle_frame(&state, connection_id, user_id, frame, &tx).await {
                    let _ = tx.send(match e {
                        ServerError::Blocked { user_id } => ServerFrame::UserBlocked { user_id },
                        other => ServerFrame::Error {
                            message: other.to_string(),
                        },
                    });
                }
            }
            Message::Close(_) => break,
            // Axum answers protocol-level pings itself; both directions just
            // count as activity.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    pump.abort();
    if let Some((_, last)) = state.registry.unregister(connection_id).await {
        info!(connection = %connection_id, user = %user_id, last, "connection closed");
        if last {
            state.service.set_presence(user_id, PresenceStatus::Offline).await;
        }
    }
}

async fn handle_frame(
    state: &AppState,
    connection_id: ConnectionId,
    user_id: UserId,
    frame: ClientFrame,
    tx: &mpsc::UnboundedSender<ServerFrame>,
) -> Result<(), ServerError> {
    match frame {
        ClientFrame::Message(send) => {
            let view = state.service.send_message(user_id, &send).await?;
            let _ = tx.send(ServerFrame::MessageSent(view));
        }
        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => {
            state.service.set_typing(user_id, conversation_id, is_typing).await?;
        }
        ClientFrame::ReadReceipt {
            conversation_id,
            message_ids,
        } => {
            state.service.mark_read(user_id, conversation_id, &message_ids).await?;
        }
        ClientFrame::JoinConversation { conversation_id } => {
            state.service.ensure_participant(user_id, conversation_id).await?;
            state.registry.join_conversation(connection_id, conversation_id).await;
            let _ = tx.send(ServerFrame::ConversationJoined {
                conversation_id,
                user_id,
            });
            // Snapshot so a late joiner sees who is mid-keystroke.
            let users = state.service.typing_users(conversation_id).await;
            if !users.is_empty() {
                let _ = tx.send(ServerFrame::TypingUsers {
                    conversation_id,
                    users,
                });
            }
        }
        ClientFrame::LeaveConversation { conversation_id } => {
            state.registry.leave_conversation(connection_id, conversation_id).await;
            let _ = tx.send(ServerFrame::ConversationLeft {
                conversation_id,
                user_id,
            });
        }
        ClientFrame::Presence { status } => {
            state.service.set_presence(user_id, status).await;
        }
        ClientFrame::Reaction {
            conversation_id,
            message_id,
            emoji,
            op,
        } => {
            state
                .service
                .react(user_id, conversation_id, message_id, &emoji, op)
                .await?;
        }
        ClientFrame::Ping => {
            let _ = tx.send(ServerFrame::Pong {
                timestamp: Utc::now(),
            });
        }
    }
    Ok(())
}
