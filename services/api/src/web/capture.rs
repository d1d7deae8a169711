//! services/api/src/web/capture.rs
//!
//! The capture-session orchestrator. Ties one conversation to at most one
//! draft incident and runs the pipeline: turns in arrival order, extraction
//! on the explicit derive-draft trigger, redaction of transcript-derived
//! text, state-machine mutation, and the audited store write.

use crate::error::ApiError;
use crate::web::state::AppState;
use behavior_log_core::domain::{
    Conversation, ConversationStatus, EditHistoryEntry, Incident, IncidentFields, Message,
    MessageRole,
};
use behavior_log_core::extraction::{merge_into_patch, ExtractionSignal, MergeOutcome};
use behavior_log_core::incident::{IncidentError, IncidentPatch, SignatureRequest};
use behavior_log_core::ports::{
    FieldExtractionService, IncidentStore, NewEditHistoryEntry, PortError,
};
use behavior_log_core::redaction::redact;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

/// The result of a derive-draft round: the current draft plus the diagnostic
/// telling the caller whether extraction changed anything, found nothing new,
/// or failed.
#[derive(Debug)]
pub struct DraftOutcome {
    pub incident: Incident,
    pub signal: ExtractionSignal,
}

//=========================================================================================
// Conversation Operations
//=========================================================================================

/// Appends one dialogue turn. Turns are only accepted while the conversation
/// is active.
pub async fn append_turn(
    app_state: &AppState,
    user_id: Uuid,
    conversation_id: Uuid,
    role: MessageRole,
    content: &str,
) -> Result<Message, ApiError> {
    let conversation = owned_conversation(app_state, user_id, conversation_id).await?;
    if conversation.status == ConversationStatus::Closed {
        return Err(IncidentError::ConversationClosed(conversation_id).into());
    }

    let message = app_state
        .db
        .append_message(conversation_id, role, content)
        .await?;
    Ok(message)
}

/// Closes the conversation. Idempotent: closing a closed conversation simply
/// returns the closed row.
pub async fn close_conversation(
    app_state: &AppState,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Result<Conversation, ApiError> {
    owned_conversation(app_state, user_id, conversation_id).await?;
    let conversation = app_state.db.close_conversation(conversation_id).await?;
    Ok(conversation)
}

//=========================================================================================
// Derive Draft (the Extraction Trigger)
//=========================================================================================

/// Runs one extraction round over the full turn history and folds the result
/// into the conversation's draft incident, creating the draft on first call.
///
/// Extraction failures are not fatal: the draft is returned unchanged with a
/// `Failed` signal so the caller can retry or prompt for clarification.
pub async fn derive_draft(
    app_state: &AppState,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Result<DraftOutcome, ApiError> {
    let conversation = owned_conversation(app_state, user_id, conversation_id).await?;
    let turns = app_state
        .db
        .get_messages_for_conversation(conversation_id)
        .await?;
    let existing = app_state
        .db
        .find_draft_for_conversation(conversation_id)
        .await?;
    let current_fields = existing
        .as_ref()
        .map(|incident| incident.fields.clone())
        .unwrap_or_default();

    let extracted = match app_state
        .extraction_adapter
        .extract_fields(&turns, &current_fields)
        .await
    {
        Ok(extracted) => extracted,
        Err(e) => {
            warn!("Extraction failed for conversation {}: {}", conversation_id, e);
            let incident = match existing {
                Some(incident) => incident,
                None => materialize_draft(app_state, &conversation, IncidentFields::default()).await?,
            };
            return Ok(DraftOutcome {
                incident,
                signal: ExtractionSignal::Failed {
                    reason: e.to_string(),
                },
            });
        }
    };

    // Strip the student's name from everything that echoes the transcript
    // before it ever reaches the record.
    let extracted = redact_extracted(app_state, &conversation, extracted).await?;

    match merge_into_patch(&current_fields, &extracted) {
        MergeOutcome::NothingNew => {
            info!(
                "Extraction found nothing new for conversation {}",
                conversation_id
            );
            let incident = match existing {
                Some(incident) => incident,
                None => materialize_draft(app_state, &conversation, IncidentFields::default()).await?,
            };
            Ok(DraftOutcome {
                incident,
                signal: ExtractionSignal::NothingNew,
            })
        }
        MergeOutcome::Updated(patch) => match existing {
            Some(draft) => {
                let (updated, changes) = draft.apply_patch(&patch)?;
                if changes.is_empty() {
                    return Ok(DraftOutcome {
                        incident: draft,
                        signal: ExtractionSignal::NothingNew,
                    });
                }
                let entry = NewEditHistoryEntry {
                    incident_id: draft.id,
                    user_id,
                    changed_fields: changes,
                };
                let incident = app_state
                    .db
                    .update_incident(&updated, draft.version, entry)
                    .await?;
                info!(
                    "Draft {} updated from conversation {}",
                    incident.id, conversation_id
                );
                Ok(DraftOutcome {
                    incident,
                    signal: ExtractionSignal::Updated,
                })
            }
            None => {
                let mut fields = IncidentFields::default();
                fields.apply_patch(&patch);
                let incident = materialize_draft(app_state, &conversation, fields).await?;
                info!(
                    "Draft {} created from conversation {}",
                    incident.id, conversation_id
                );
                Ok(DraftOutcome {
                    incident,
                    signal: ExtractionSignal::Updated,
                })
            }
        },
    }
}

/// Creates the conversation's draft row. A concurrent creator loses on the
/// one-draft-per-conversation index and we fall back to the winner's row.
async fn materialize_draft(
    app_state: &AppState,
    conversation: &Conversation,
    fields: IncidentFields,
) -> Result<Incident, ApiError> {
    match app_state
        .db
        .create_incident(
            conversation.user_id,
            conversation.student_id,
            Some(conversation.id),
            fields,
        )
        .await
    {
        Ok(incident) => Ok(incident),
        Err(PortError::Conflict(_)) => {
            let existing = app_state
                .db
                .find_draft_for_conversation(conversation.id)
                .await?;
            existing.ok_or_else(|| {
                ApiError::Internal(format!(
                    "Draft for conversation {} vanished after creation conflict",
                    conversation.id
                ))
            })
        }
        Err(e) => Err(e.into()),
    }
}

async fn redact_extracted(
    app_state: &AppState,
    conversation: &Conversation,
    mut extracted: IncidentFields,
) -> Result<IncidentFields, ApiError> {
    let Some(student_id) = conversation.student_id else {
        return Ok(extracted);
    };
    let student = app_state.db.get_student_by_id(student_id).await?;
    let identifiers = student.redaction_identifiers();

    for slot in [
        &mut extracted.antecedent,
        &mut extracted.behavior,
        &mut extracted.consequence,
        &mut extracted.incident_type,
        &mut extracted.location,
        &mut extracted.intervention,
        &mut extracted.notes,
    ] {
        if let Some(text) = slot.take() {
            *slot = Some(redact(&text, &identifiers)?);
        }
    }
    Ok(extracted)
}

//=========================================================================================
// Incident Mutation Operations
//=========================================================================================

/// Applies a manual field patch to a draft incident, recording the diff as an
/// audit entry. A no-op patch writes nothing and returns the record as-is.
pub async fn update_incident(
    app_state: &AppState,
    user_id: Uuid,
    incident_id: Uuid,
    patch: &IncidentPatch,
) -> Result<Incident, ApiError> {
    let incident = owned_incident(app_state, user_id, incident_id).await?;
    let (updated, changes) = incident.apply_patch(patch)?;
    if changes.is_empty() {
        return Ok(incident);
    }

    let entry = NewEditHistoryEntry {
        incident_id,
        user_id,
        changed_fields: changes,
    };
    let incident = app_state
        .db
        .update_incident(&updated, incident.version, entry)
        .await?;
    Ok(incident)
}

/// Signs a draft incident, making it immutable. The audit trail receives the
/// distinguished signing entry via the status flip in the diff.
pub async fn sign_incident(
    app_state: &AppState,
    user_id: Uuid,
    incident_id: Uuid,
    signature: &SignatureRequest,
) -> Result<Incident, ApiError> {
    let incident = owned_incident(app_state, user_id, incident_id).await?;
    let (signed, changes) = incident.sign(signature, Utc::now())?;

    let entry = NewEditHistoryEntry {
        incident_id,
        user_id,
        changed_fields: changes,
    };
    let incident = app_state
        .db
        .update_incident(&signed, incident.version, entry)
        .await?;
    info!("Incident {} signed by user {}", incident_id, user_id);
    Ok(incident)
}

/// The append-only audit trail, oldest first.
pub async fn list_edit_history(
    app_state: &AppState,
    user_id: Uuid,
    incident_id: Uuid,
) -> Result<Vec<EditHistoryEntry>, ApiError> {
    owned_incident(app_state, user_id, incident_id).await?;
    let entries = app_state.db.list_edit_history(incident_id).await?;
    Ok(entries)
}

/// Fetches an incident as stored (the unredacted teacher view).
pub async fn incident_by_id(
    app_state: &AppState,
    user_id: Uuid,
    incident_id: Uuid,
) -> Result<Incident, ApiError> {
    owned_incident(app_state, user_id, incident_id).await
}

/// Fetches an incident with the student's name stripped from every free-text
/// field, for secondary viewers. The stored record is untouched.
pub async fn redacted_incident(
    app_state: &AppState,
    user_id: Uuid,
    incident_id: Uuid,
) -> Result<Incident, ApiError> {
    let mut incident = owned_incident(app_state, user_id, incident_id).await?;
    let Some(student_id) = incident.student_id else {
        return Ok(incident);
    };
    let student = app_state.db.get_student_by_id(student_id).await?;
    let identifiers = student.redaction_identifiers();

    for slot in [
        &mut incident.fields.antecedent,
        &mut incident.fields.behavior,
        &mut incident.fields.consequence,
        &mut incident.fields.incident_type,
        &mut incident.fields.location,
        &mut incident.fields.intervention,
        &mut incident.fields.notes,
    ] {
        if let Some(text) = slot.take() {
            *slot = Some(redact(&text, &identifiers)?);
        }
    }
    Ok(incident)
}

//=========================================================================================
// Ownership Checks
//=========================================================================================

async fn owned_conversation(
    app_state: &AppState,
    user_id: Uuid,
    conversation_id: Uuid,
) -> Result<Conversation, ApiError> {
    let conversation = app_state.db.get_conversation_by_id(conversation_id).await?;
    if conversation.user_id != user_id {
        // Reported as not-found so record ids don't leak across users.
        return Err(PortError::NotFound(format!(
            "Conversation {} not found",
            conversation_id
        ))
        .into());
    }
    Ok(conversation)
}

async fn owned_incident(
    app_state: &AppState,
    user_id: Uuid,
    incident_id: Uuid,
) -> Result<Incident, ApiError> {
    let incident = app_state.db.get_incident_by_id(incident_id).await?;
    if incident.user_id != user_id {
        return Err(PortError::NotFound(format!("Incident {} not found", incident_id)).into());
    }
    Ok(incident)
}
