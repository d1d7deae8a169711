//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a WebSocket capture
//! session. It validates the session, then dispatches protocol messages to
//! the capture orchestrator.

use crate::web::{
    capture,
    protocol::{ClientMessage, ServerMessage},
    rest::DraftResponse,
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use behavior_log_core::domain::MessageRole;
use behavior_log_core::ports::IncidentStore;
use futures::{
    stream::{SplitSink, SplitStream, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>) {
    info!("New WebSocket capture connection established.");

    let (mut sender, mut receiver) = socket.split();

    // --- 1. Initialization Phase ---
    let Some((conversation_id, user_id)) =
        init_session(&app_state, &mut sender, &mut receiver).await
    else {
        return;
    };

    // --- 2. Capture Loop ---
    while let Some(Ok(frame)) = receiver.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => {
                info!("Client closed capture session for conversation {}", conversation_id);
                break;
            }
            // Binary, ping, and pong frames carry nothing for this protocol.
            _ => continue,
        };

        let parsed = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable client message: {}", e);
                if send_message(
                    &mut sender,
                    &ServerMessage::Error {
                        message: format!("Unrecognized message: {}", e),
                    },
                )
                .await
                .is_err()
                {
                    break;
                }
                continue;
            }
        };

        let reply = dispatch(&app_state, user_id, conversation_id, parsed).await;
        if send_message(&mut sender, &reply).await.is_err() {
            warn!("Client disconnected mid-session for conversation {}", conversation_id);
            break;
        }
    }
}

/// Waits for the mandatory `Init` message and validates the conversation.
async fn init_session(
    app_state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
) -> Option<(Uuid, Uuid)> {
    let Some(Ok(Message::Text(init_json))) = receiver.next().await else {
        error!("Client disconnected before sending Init message.");
        return None;
    };

    match serde_json::from_str::<ClientMessage>(&init_json) {
        Ok(ClientMessage::Init {
            conversation_id,
            user_id,
        }) => {
            match app_state.db.get_conversation_by_id(conversation_id).await {
                Ok(conversation) if conversation.user_id == user_id => {
                    info!("Capture session initialized for conversation {}", conversation_id);
                }
                Ok(_) => {
                    error!(
                        "Conversation {} does not belong to user {}",
                        conversation_id, user_id
                    );
                    let _ = send_message(
                        sender,
                        &ServerMessage::Error {
                            message: "Conversation not found.".to_string(),
                        },
                    )
                    .await;
                    return None;
                }
                Err(e) => {
                    error!("Failed to load conversation: {:?}", e);
                    let _ = send_message(
                        sender,
                        &ServerMessage::Error {
                            message: "Failed to load conversation.".to_string(),
                        },
                    )
                    .await;
                    return None;
                }
            }

            if send_message(sender, &ServerMessage::ConversationReady { conversation_id })
                .await
                .is_err()
            {
                error!("Failed to send ConversationReady message.");
                return None;
            }
            Some((conversation_id, user_id))
        }
        _ => {
            error!("First message was not a valid Init message.");
            None
        }
    }
}

/// Routes one protocol message through the orchestrator. Errors become
/// `ServerMessage::Error` replies; the session stays open.
async fn dispatch(
    app_state: &AppState,
    user_id: Uuid,
    conversation_id: Uuid,
    message: ClientMessage,
) -> ServerMessage {
    match message {
        ClientMessage::Init { .. } => ServerMessage::Error {
            message: "Session is already initialized.".to_string(),
        },
        ClientMessage::Turn { role, content } => {
            let role = match role.as_deref().map(MessageRole::parse) {
                None => MessageRole::User,
                Some(Some(role)) => role,
                Some(None) => {
                    return ServerMessage::Error {
                        message: "Invalid message role.".to_string(),
                    }
                }
            };
            match capture::append_turn(app_state, user_id, conversation_id, role, &content).await
            {
                Ok(message) => ServerMessage::TurnRecorded {
                    message_id: message.id,
                },
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            }
        }
        ClientMessage::Finalize => {
            match capture::derive_draft(app_state, user_id, conversation_id).await {
                Ok(outcome) => ServerMessage::DraftUpdated {
                    draft: DraftResponse::from_outcome(outcome),
                },
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            }
        }
        ClientMessage::CloseConversation => {
            match capture::close_conversation(app_state, user_id, conversation_id).await {
                Ok(_) => ServerMessage::ConversationClosed,
                Err(e) => ServerMessage::Error {
                    message: e.to_string(),
                },
            }
        }
    }
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message)
        .map_err(|e| axum::Error::new(e))?;
    sender.send(Message::Text(json.into())).await
}
