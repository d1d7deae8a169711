//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use behavior_log_core::ports::{FieldExtractionService, IncidentStore};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn IncidentStore>,
    pub config: Arc<Config>,
    pub extraction_adapter: Arc<dyn FieldExtractionService>,
}
