//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the capture client and the
//! API server for live incident-capture sessions.

use crate::web::rest::DraftResponse;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Initializes a capture session. This must be the first message sent on
    /// the connection. Identity arrives here because browsers cannot attach
    /// headers to a WebSocket upgrade; authentication itself lives outside
    /// this service.
    Init {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    /// One dialogue turn to append. `role` defaults to "user".
    Turn {
        role: Option<String>,
        content: String,
    },

    /// Runs extraction over everything said so far and updates the draft.
    Finalize,

    /// Closes the conversation. Idempotent.
    CloseConversation,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms successful session initialization.
    ConversationReady { conversation_id: Uuid },

    /// Confirms a turn was appended.
    TurnRecorded { message_id: Uuid },

    /// The draft after a finalize round, with the extraction diagnostic.
    DraftUpdated { draft: DraftResponse },

    /// Confirms the conversation is closed.
    ConversationClosed,

    /// Reports an error to the client. Recoverable errors (a locked record,
    /// a lost race) leave the session open.
    Error { message: String },
}
