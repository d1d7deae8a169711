pub mod capture;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the main WebSocket handler to make it easily accessible
// to the binary that will build the web server router.
pub use rest::{
    append_turn_handler, close_conversation_handler, create_conversation_handler,
    create_student_handler, derive_draft_handler, get_incident_handler,
    list_edit_history_handler, redact_handler, sign_incident_handler, update_incident_handler,
};
pub use ws_handler::ws_handler;
