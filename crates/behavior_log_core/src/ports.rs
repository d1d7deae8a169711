//! crates/behavior_log_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::{
    Conversation, EditHistoryEntry, FieldChange, Incident, IncidentFields, Message, MessageRole,
    Student, User,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// The caller lost an optimistic-concurrency race; it must re-read and
    /// retry against the latest state or give up, never overwrite blindly.
    #[error("Concurrent write conflict: {0}")]
    Conflict(String),
    /// The mutation was rolled back because its audit entry could not be
    /// written. Surfaced distinctly: an unaudited mutation must never commit.
    #[error("Audit entry write failed: {0}")]
    AuditWrite(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// The fields of a new audit entry. The id and creation timestamp are set by
/// the store when the entry is persisted.
#[derive(Debug, Clone)]
pub struct NewEditHistoryEntry {
    pub incident_id: Uuid,
    pub user_id: Uuid,
    pub changed_fields: BTreeMap<String, FieldChange>,
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    // --- User Management ---
    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<User>;

    // --- Student Management ---
    async fn create_student(
        &self,
        user_id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> PortResult<Student>;

    async fn get_student_by_id(&self, student_id: Uuid) -> PortResult<Student>;

    // --- Conversation Management (Capture Sessions) ---
    async fn create_conversation(
        &self,
        user_id: Uuid,
        student_id: Option<Uuid>,
    ) -> PortResult<Conversation>;

    async fn get_conversation_by_id(&self, conversation_id: Uuid) -> PortResult<Conversation>;

    /// One-way transition to `closed`. Closing an already-closed conversation
    /// is a no-op that returns the closed row.
    async fn close_conversation(&self, conversation_id: Uuid) -> PortResult<Conversation>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> PortResult<Message>;

    /// Messages in dialogue order (creation order).
    async fn get_messages_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> PortResult<Vec<Message>>;

    // --- Incident Management ---
    async fn create_incident(
        &self,
        user_id: Uuid,
        student_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        fields: IncidentFields,
    ) -> PortResult<Incident>;

    async fn get_incident_by_id(&self, incident_id: Uuid) -> PortResult<Incident>;

    /// The single draft derived from a conversation, if one exists.
    async fn find_draft_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> PortResult<Option<Incident>>;

    /// Persists a mutated incident and its audit entry in one atomic unit.
    ///
    /// The write is a compare-and-set on `expected_version`: if the stored
    /// version moved on, the call fails with [`PortError::Conflict`] and
    /// nothing is written. The audit entry is inserted strictly after the
    /// mutation within the same transaction; if that insert fails the whole
    /// unit rolls back and [`PortError::AuditWrite`] is returned.
    async fn update_incident(
        &self,
        incident: &Incident,
        expected_version: i32,
        entry: NewEditHistoryEntry,
    ) -> PortResult<Incident>;

    /// The append-only audit trail for an incident, oldest first.
    async fn list_edit_history(&self, incident_id: Uuid) -> PortResult<Vec<EditHistoryEntry>>;
}

#[async_trait]
pub trait FieldExtractionService: Send + Sync {
    /// Reduces an ordered dialogue to candidate structured fields.
    ///
    /// The current draft fields are provided so the extractor can focus on
    /// what is still unknown; the returned candidates are raw and unredacted.
    /// Semantic quality is not part of this contract, only the data shape.
    async fn extract_fields(
        &self,
        turns: &[Message],
        current: &IncidentFields,
    ) -> PortResult<IncidentFields>;
}
