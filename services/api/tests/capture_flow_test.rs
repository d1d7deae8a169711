//! Integration tests for the capture orchestrator against in-memory ports.
//!
//! These drive the full pipeline (turns -> extraction -> redaction -> state
//! machine -> audited store writes) without Postgres or an LLM: the store is
//! a hash-map implementation of `IncidentStore` with the same CAS semantics
//! as the SQL adapter, and the extractor is a deterministic keyword stub.

use api_lib::config::Config;
use api_lib::error::ApiError;
use api_lib::web::{capture, state::AppState};
use async_trait::async_trait;
use behavior_log_core::domain::{
    Conversation, ConversationStatus, EditHistoryEntry, Incident, IncidentFields, IncidentStatus,
    Message, MessageRole, Student, User,
};
use behavior_log_core::extraction::ExtractionSignal;
use behavior_log_core::incident::{IncidentError, IncidentPatch, SignatureRequest};
use behavior_log_core::ports::{
    FieldExtractionService, IncidentStore, NewEditHistoryEntry, PortError, PortResult,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

//=========================================================================================
// In-Memory Store
//=========================================================================================

#[derive(Default)]
struct MemoryStore {
    users: Mutex<HashMap<Uuid, User>>,
    students: Mutex<HashMap<Uuid, Student>>,
    conversations: Mutex<HashMap<Uuid, Conversation>>,
    messages: Mutex<Vec<Message>>,
    incidents: Mutex<HashMap<Uuid, Incident>>,
    history: Mutex<Vec<EditHistoryEntry>>,
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<User> {
        let mut users = self.users.lock().unwrap();
        let user = users.entry(user_id).or_insert(User {
            user_id,
            email: None,
        });
        Ok(user.clone())
    }

    async fn create_student(
        &self,
        user_id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> PortResult<Student> {
        let student = Student {
            id: Uuid::new_v4(),
            user_id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        };
        self.students
            .lock()
            .unwrap()
            .insert(student.id, student.clone());
        Ok(student)
    }

    async fn get_student_by_id(&self, student_id: Uuid) -> PortResult<Student> {
        self.students
            .lock()
            .unwrap()
            .get(&student_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Student {} not found", student_id)))
    }

    async fn create_conversation(
        &self,
        user_id: Uuid,
        student_id: Option<Uuid>,
    ) -> PortResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user_id,
            student_id,
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation_by_id(&self, conversation_id: Uuid) -> PortResult<Conversation> {
        self.conversations
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| {
                PortError::NotFound(format!("Conversation {} not found", conversation_id))
            })
    }

    async fn close_conversation(&self, conversation_id: Uuid) -> PortResult<Conversation> {
        let mut conversations = self.conversations.lock().unwrap();
        let conversation = conversations.get_mut(&conversation_id).ok_or_else(|| {
            PortError::NotFound(format!("Conversation {} not found", conversation_id))
        })?;
        conversation.status = ConversationStatus::Closed;
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> PortResult<Message> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn get_messages_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> PortResult<Vec<Message>> {
        // Insertion order is the dialogue order.
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn create_incident(
        &self,
        user_id: Uuid,
        student_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        fields: IncidentFields,
    ) -> PortResult<Incident> {
        let mut incidents = self.incidents.lock().unwrap();
        // Mirror the one-draft-per-conversation unique index.
        if let Some(conversation_id) = conversation_id {
            let duplicate = incidents.values().any(|i| {
                i.conversation_id == Some(conversation_id) && i.status == IncidentStatus::Draft
            });
            if duplicate {
                return Err(PortError::Conflict(format!(
                    "Conversation {} already has a draft",
                    conversation_id
                )));
            }
        }
        let now = Utc::now();
        let incident = Incident {
            id: Uuid::new_v4(),
            user_id,
            student_id,
            conversation_id,
            status: IncidentStatus::Draft,
            fields,
            teacher_signature: None,
            teacher_signed_at: None,
            parent_signature: None,
            parent_signed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        incidents.insert(incident.id, incident.clone());
        Ok(incident)
    }

    async fn get_incident_by_id(&self, incident_id: Uuid) -> PortResult<Incident> {
        self.incidents
            .lock()
            .unwrap()
            .get(&incident_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Incident {} not found", incident_id)))
    }

    async fn find_draft_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> PortResult<Option<Incident>> {
        Ok(self
            .incidents
            .lock()
            .unwrap()
            .values()
            .find(|i| {
                i.conversation_id == Some(conversation_id) && i.status == IncidentStatus::Draft
            })
            .cloned())
    }

    async fn update_incident(
        &self,
        incident: &Incident,
        expected_version: i32,
        entry: NewEditHistoryEntry,
    ) -> PortResult<Incident> {
        let mut incidents = self.incidents.lock().unwrap();
        let stored = incidents
            .get_mut(&incident.id)
            .ok_or_else(|| PortError::NotFound(format!("Incident {} not found", incident.id)))?;
        if stored.version != expected_version {
            return Err(PortError::Conflict(format!(
                "Incident {} moved to version {} while version {} was expected",
                incident.id, stored.version, expected_version
            )));
        }

        let mut updated = incident.clone();
        updated.version = expected_version + 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();

        // Mutation and audit entry commit together, as in the SQL adapter.
        self.history.lock().unwrap().push(EditHistoryEntry {
            id: Uuid::new_v4(),
            incident_id: entry.incident_id,
            user_id: entry.user_id,
            changed_fields: entry.changed_fields,
            created_at: Utc::now(),
        });
        Ok(updated)
    }

    async fn list_edit_history(&self, incident_id: Uuid) -> PortResult<Vec<EditHistoryEntry>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.incident_id == incident_id)
            .cloned()
            .collect())
    }
}

//=========================================================================================
// Extractor Stubs
//=========================================================================================

/// Deterministic keyword heuristics standing in for the LLM adapter.
struct KeywordExtractor;

#[async_trait]
impl FieldExtractionService for KeywordExtractor {
    async fn extract_fields(
        &self,
        turns: &[Message],
        _current: &IncidentFields,
    ) -> PortResult<IncidentFields> {
        let mut fields = IncidentFields::default();
        for turn in turns {
            if turn.role != MessageRole::User {
                continue;
            }
            let lowered = turn.content.to_lowercase();
            if lowered.contains("hit") {
                fields.behavior = Some(turn.content.clone());
                fields.incident_type = Some("aggression".to_string());
            }
            if lowered.contains("during math") {
                fields.location = Some("Math classroom".to_string());
            }
        }
        Ok(fields)
    }
}

struct FailingExtractor;

#[async_trait]
impl FieldExtractionService for FailingExtractor {
    async fn extract_fields(
        &self,
        _turns: &[Message],
        _current: &IncidentFields,
    ) -> PortResult<IncidentFields> {
        Err(PortError::Unexpected("model unavailable".to_string()))
    }
}

//=========================================================================================
// Fixture
//=========================================================================================

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        database_url: "postgres://unused".to_string(),
        log_level: tracing::Level::INFO,
        openai_api_key: None,
        extraction_model: "stub".to_string(),
    }
}

fn app_state(extractor: Arc<dyn FieldExtractionService>) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let state = Arc::new(AppState {
        db: store.clone(),
        config: Arc::new(test_config()),
        extraction_adapter: extractor,
    });
    (state, store)
}

/// A user, a student named Emma Smith, and an active conversation about her.
async fn capture_session(state: &AppState) -> (Uuid, Student, Conversation) {
    let user_id = Uuid::new_v4();
    state.db.get_or_create_user(user_id).await.unwrap();
    let student = state
        .db
        .create_student(user_id, "Emma", "Smith")
        .await
        .unwrap();
    let conversation = state
        .db
        .create_conversation(user_id, Some(student.id))
        .await
        .unwrap();
    (user_id, student, conversation)
}

//=========================================================================================
// Tests
//=========================================================================================

#[tokio::test]
async fn end_to_end_capture_sign_and_lock() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "It happened during math",
    )
    .await
    .unwrap();

    let outcome = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap();
    assert_eq!(outcome.signal, ExtractionSignal::Updated);

    let draft = outcome.incident;
    // Behavior and location were extracted, and the transcript-derived
    // behavior text had the student's name redacted on the way in.
    assert_eq!(draft.fields.behavior.as_deref(), Some("[Student] hit the desk"));
    assert_eq!(draft.fields.location.as_deref(), Some("Math classroom"));
    assert_eq!(draft.status, IncidentStatus::Draft);

    let signature = SignatureRequest {
        teacher_signature: "Ms. Rivera".to_string(),
        parent_signature: None,
    };
    let signed = capture::sign_incident(&state, user_id, draft.id, &signature)
        .await
        .unwrap();
    assert_eq!(signed.status, IncidentStatus::Signed);
    assert!(signed.teacher_signed_at.is_some());

    // The record is now locked against regular mutation.
    let patch = IncidentPatch {
        notes: Some("added later".to_string()),
        ..IncidentPatch::default()
    };
    let err = capture::update_incident(&state, user_id, draft.id, &patch)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApiError::Incident(IncidentError::Locked { .. })
    ));
}

#[tokio::test]
async fn update_writes_exactly_one_audit_entry_per_changed_field() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    let draft = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap()
        .incident;
    let entries_before = capture::list_edit_history(&state, user_id, draft.id)
        .await
        .unwrap()
        .len();

    let patch = IncidentPatch {
        location: Some("Hallway".to_string()),
        ..IncidentPatch::default()
    };
    capture::update_incident(&state, user_id, draft.id, &patch)
        .await
        .unwrap();

    let entries = capture::list_edit_history(&state, user_id, draft.id)
        .await
        .unwrap();
    assert_eq!(entries.len(), entries_before + 1);

    let with_location: Vec<_> = entries
        .iter()
        .filter(|e| e.changed_fields.contains_key("location"))
        .collect();
    assert_eq!(with_location.len(), 1);
    let change = &with_location[0].changed_fields["location"];
    assert_eq!(change.before, serde_json::Value::Null);
    assert_eq!(change.after, serde_json::json!("Hallway"));
}

#[tokio::test]
async fn noop_update_writes_no_audit_entry() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    let draft = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap()
        .incident;
    let before = capture::list_edit_history(&state, user_id, draft.id)
        .await
        .unwrap()
        .len();

    // Re-asserting the current value changes nothing.
    let patch = IncidentPatch {
        behavior: draft.fields.behavior.clone(),
        ..IncidentPatch::default()
    };
    let unchanged = capture::update_incident(&state, user_id, draft.id, &patch)
        .await
        .unwrap();
    assert_eq!(unchanged.version, draft.version);

    let after = capture::list_edit_history(&state, user_id, draft.id)
        .await
        .unwrap()
        .len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn locked_update_produces_no_audit_entry() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    let draft = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap()
        .incident;
    let signature = SignatureRequest {
        teacher_signature: "Ms. Rivera".to_string(),
        parent_signature: None,
    };
    capture::sign_incident(&state, user_id, draft.id, &signature)
        .await
        .unwrap();
    let before = capture::list_edit_history(&state, user_id, draft.id)
        .await
        .unwrap()
        .len();

    let patch = IncidentPatch {
        notes: Some("tamper attempt".to_string()),
        ..IncidentPatch::default()
    };
    capture::update_incident(&state, user_id, draft.id, &patch)
        .await
        .unwrap_err();

    let after = capture::list_edit_history(&state, user_id, draft.id)
        .await
        .unwrap()
        .len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn signing_appends_the_distinguished_entry() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    let draft = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap()
        .incident;
    let signature = SignatureRequest {
        teacher_signature: "Ms. Rivera".to_string(),
        parent_signature: None,
    };
    capture::sign_incident(&state, user_id, draft.id, &signature)
        .await
        .unwrap();

    let entries = capture::list_edit_history(&state, user_id, draft.id)
        .await
        .unwrap();
    let signing: Vec<_> = entries.iter().filter(|e| e.is_signing_entry()).collect();
    assert_eq!(signing.len(), 1);
}

#[tokio::test]
async fn sign_with_missing_mandatory_fields_leaves_draft() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    // No turns: the draft materializes empty.
    let outcome = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap();
    assert_eq!(outcome.signal, ExtractionSignal::NothingNew);
    let draft = outcome.incident;

    let signature = SignatureRequest {
        teacher_signature: "Ms. Rivera".to_string(),
        parent_signature: None,
    };
    let err = capture::sign_incident(&state, user_id, draft.id, &signature)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApiError::Incident(IncidentError::Validation { .. })
    ));

    let reloaded = state.db.get_incident_by_id(draft.id).await.unwrap();
    assert_eq!(reloaded.status, IncidentStatus::Draft);
}

#[tokio::test]
async fn derive_draft_is_idempotent_across_triggers() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();

    let first = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap();
    assert_eq!(first.signal, ExtractionSignal::Updated);
    let history_after_first = capture::list_edit_history(&state, user_id, first.incident.id)
        .await
        .unwrap()
        .len();

    let second = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap();
    assert_eq!(second.signal, ExtractionSignal::NothingNew);
    assert_eq!(second.incident.id, first.incident.id);

    let history_after_second = capture::list_edit_history(&state, user_id, first.incident.id)
        .await
        .unwrap()
        .len();
    assert_eq!(history_after_first, history_after_second);
}

#[tokio::test]
async fn extraction_failure_is_a_signal_not_an_error() {
    let (state, _) = app_state(Arc::new(FailingExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();

    let outcome = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap();
    match outcome.signal {
        ExtractionSignal::Failed { reason } => assert!(reason.contains("model unavailable")),
        other => panic!("expected Failed, got {other:?}"),
    }
    // The draft still materialized, empty and mutable.
    assert_eq!(outcome.incident.status, IncidentStatus::Draft);
    assert_eq!(outcome.incident.fields, IncidentFields::default());
}

#[tokio::test]
async fn stale_version_write_is_a_conflict() {
    let (state, store) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    let draft = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap()
        .incident;

    // Two writers read the same version; the second commit must lose.
    let (updated, changes) = draft
        .apply_patch(&IncidentPatch {
            location: Some("Hallway".to_string()),
            ..IncidentPatch::default()
        })
        .unwrap();
    store
        .update_incident(
            &updated,
            draft.version,
            NewEditHistoryEntry {
                incident_id: draft.id,
                user_id,
                changed_fields: changes,
            },
        )
        .await
        .unwrap();

    let (stale, stale_changes) = draft
        .apply_patch(&IncidentPatch {
            location: Some("Playground".to_string()),
            ..IncidentPatch::default()
        })
        .unwrap();
    let err = store
        .update_incident(
            &stale,
            draft.version,
            NewEditHistoryEntry {
                incident_id: draft.id,
                user_id,
                changed_fields: stale_changes,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PortError::Conflict(_)));
}

#[tokio::test]
async fn closing_is_idempotent_and_blocks_new_turns() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    let closed = capture::close_conversation(&state, user_id, conversation.id)
        .await
        .unwrap();
    assert_eq!(closed.status, ConversationStatus::Closed);

    // Closing again is a no-op, not an error.
    let closed_again = capture::close_conversation(&state, user_id, conversation.id)
        .await
        .unwrap();
    assert_eq!(closed_again.status, ConversationStatus::Closed);

    let err = capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "too late",
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        ApiError::Incident(IncidentError::ConversationClosed(_))
    ));
}

#[tokio::test]
async fn records_are_invisible_to_other_users() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;
    let stranger = Uuid::new_v4();

    let err = capture::append_turn(
        &state,
        stranger,
        conversation.id,
        MessageRole::User,
        "hello",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::Port(PortError::NotFound(_))));

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    let draft = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap()
        .incident;
    let err = capture::incident_by_id(&state, stranger, draft.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Port(PortError::NotFound(_))));
}

#[tokio::test]
async fn redacted_view_strips_names_from_manual_edits() {
    let (state, _) = app_state(Arc::new(KeywordExtractor));
    let (user_id, _, conversation) = capture_session(&state).await;

    capture::append_turn(
        &state,
        user_id,
        conversation.id,
        MessageRole::User,
        "Emma hit the desk",
    )
    .await
    .unwrap();
    let draft = capture::derive_draft(&state, user_id, conversation.id)
        .await
        .unwrap()
        .incident;

    // A manual edit can reintroduce the name; the stored record keeps it.
    let patch = IncidentPatch {
        notes: Some("Emma Smith calmed down after five minutes".to_string()),
        ..IncidentPatch::default()
    };
    let updated = capture::update_incident(&state, user_id, draft.id, &patch)
        .await
        .unwrap();
    assert!(updated.fields.notes.as_deref().unwrap().contains("Emma Smith"));

    // The redacted view strips it on the way out.
    let redacted = capture::redacted_incident(&state, user_id, draft.id)
        .await
        .unwrap();
    assert_eq!(
        redacted.fields.notes.as_deref(),
        Some("[Student] calmed down after five minutes")
    );

    // The stored record is untouched by the redacted read.
    let reloaded = state.db.get_incident_by_id(draft.id).await.unwrap();
    assert!(reloaded.fields.notes.as_deref().unwrap().contains("Emma Smith"));
}
