//! crates/behavior_log_core/src/incident.rs
//!
//! The incident state machine: `draft` -> `signed`, terminal. Mutations are
//! expressed as patches applied to a draft; every successful application
//! yields the exact changed-fields diff that the store persists as an audit
//! entry alongside the mutation.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::domain::{FieldChange, FunctionOfBehavior, Incident, IncidentFields, IncidentStatus};

//=========================================================================================
// Errors
//=========================================================================================

/// A state-machine violation, reported synchronously with enough detail for a
/// user-facing message.
#[derive(Debug, thiserror::Error)]
pub enum IncidentError {
    /// The record is signed and locked; the attempted transition is named so
    /// the caller can tell the user exactly what was rejected.
    #[error("Incident is {} and locked; cannot {attempted}", .status.as_str())]
    Locked {
        status: IncidentStatus,
        attempted: &'static str,
    },

    /// Signing requires the mandatory fields to be populated.
    #[error("Cannot sign incident; missing mandatory fields: {}", .missing.join(", "))]
    Validation { missing: Vec<&'static str> },

    /// Turns can only be appended while the conversation is active.
    #[error("Conversation {0} is closed and no longer accepts turns")]
    ConversationClosed(Uuid),
}

//=========================================================================================
// Patch
//=========================================================================================

/// A field-level change set for a draft incident. `None` leaves a field
/// untouched; for text fields, a whitespace-only value clears the field.
#[derive(Debug, Clone, Default)]
pub struct IncidentPatch {
    pub student_id: Option<Uuid>,
    pub antecedent: Option<String>,
    pub behavior: Option<String>,
    pub consequence: Option<String>,
    pub incident_type: Option<String>,
    pub functions_of_behavior: Option<BTreeSet<FunctionOfBehavior>>,
    pub occurred_on: Option<NaiveDate>,
    pub occurred_time: Option<NaiveTime>,
    pub location: Option<String>,
    pub duration_minutes: Option<i32>,
    pub intervention: Option<String>,
    pub notes: Option<String>,
}

impl IncidentPatch {
    pub fn is_empty(&self) -> bool {
        self.student_id.is_none()
            && self.antecedent.is_none()
            && self.behavior.is_none()
            && self.consequence.is_none()
            && self.incident_type.is_none()
            && self.functions_of_behavior.is_none()
            && self.occurred_on.is_none()
            && self.occurred_time.is_none()
            && self.location.is_none()
            && self.duration_minutes.is_none()
            && self.intervention.is_none()
            && self.notes.is_none()
    }
}

/// The signatures supplied by the sign operation. The parent signature is
/// optional and co-recorded at signing time when present.
#[derive(Debug, Clone)]
pub struct SignatureRequest {
    pub teacher_signature: String,
    pub parent_signature: Option<String>,
}

//=========================================================================================
// Transitions
//=========================================================================================

impl Incident {
    /// Applies a patch to a draft incident.
    ///
    /// Returns the updated incident together with the changed-fields diff
    /// (per-field value equality; unchanged fields are excluded). An empty
    /// diff means the patch was a no-op and the caller must not persist or
    /// audit anything. Rejects with [`IncidentError::Locked`] once signed.
    pub fn apply_patch(
        &self,
        patch: &IncidentPatch,
    ) -> Result<(Incident, BTreeMap<String, FieldChange>), IncidentError> {
        if self.status != IncidentStatus::Draft {
            return Err(IncidentError::Locked {
                status: self.status,
                attempted: "update",
            });
        }

        let mut updated = self.clone();
        if let Some(student_id) = patch.student_id {
            updated.student_id = Some(student_id);
        }
        updated.fields.apply_patch(patch);

        let changes = diff(self, &updated);
        Ok((updated, changes))
    }

    /// Signs a draft incident, transitioning it to its terminal state.
    ///
    /// Legal only while `draft` and only when the mandatory fields (student,
    /// incident type, behavior) and the teacher signature are non-empty. The
    /// returned diff includes the status flip, which is what marks the audit
    /// entry as the distinguished signing entry.
    pub fn sign(
        &self,
        signature: &SignatureRequest,
        signed_at: DateTime<Utc>,
    ) -> Result<(Incident, BTreeMap<String, FieldChange>), IncidentError> {
        if self.status != IncidentStatus::Draft {
            return Err(IncidentError::Locked {
                status: self.status,
                attempted: "sign",
            });
        }

        let mut missing = Vec::new();
        if self.student_id.is_none() {
            missing.push("student");
        }
        if is_blank(&self.fields.incident_type) {
            missing.push("incident_type");
        }
        if is_blank(&self.fields.behavior) {
            missing.push("behavior");
        }
        if signature.teacher_signature.trim().is_empty() {
            missing.push("teacher_signature");
        }
        if !missing.is_empty() {
            return Err(IncidentError::Validation { missing });
        }

        let mut updated = self.clone();
        updated.status = IncidentStatus::Signed;
        updated.teacher_signature = Some(signature.teacher_signature.trim().to_string());
        updated.teacher_signed_at = Some(signed_at);
        if let Some(parent_signature) = &signature.parent_signature {
            if !parent_signature.trim().is_empty() {
                updated.parent_signature = Some(parent_signature.trim().to_string());
                updated.parent_signed_at = Some(signed_at);
            }
        }

        let changes = diff(self, &updated);
        Ok((updated, changes))
    }
}

impl IncidentFields {
    /// Applies the field-level parts of a patch. Used both when mutating an
    /// existing draft and when materializing the first draft from extraction.
    pub fn apply_patch(&mut self, patch: &IncidentPatch) {
        apply_text(&mut self.antecedent, &patch.antecedent);
        apply_text(&mut self.behavior, &patch.behavior);
        apply_text(&mut self.consequence, &patch.consequence);
        apply_text(&mut self.incident_type, &patch.incident_type);
        if let Some(functions) = &patch.functions_of_behavior {
            self.functions_of_behavior = functions.clone();
        }
        if let Some(occurred_on) = patch.occurred_on {
            self.occurred_on = Some(occurred_on);
        }
        if let Some(occurred_time) = patch.occurred_time {
            self.occurred_time = Some(occurred_time);
        }
        apply_text(&mut self.location, &patch.location);
        if let Some(duration) = patch.duration_minutes {
            self.duration_minutes = Some(duration);
        }
        apply_text(&mut self.intervention, &patch.intervention);
        apply_text(&mut self.notes, &patch.notes);
    }
}

fn apply_text(slot: &mut Option<String>, value: &Option<String>) {
    if let Some(value) = value {
        let trimmed = value.trim();
        *slot = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

//=========================================================================================
// Diff Computation
//=========================================================================================

/// Computes the changed-fields map between two versions of an incident,
/// restricted to fields that differ by value.
pub fn diff(before: &Incident, after: &Incident) -> BTreeMap<String, FieldChange> {
    let before_map = snapshot(before);
    let after_map = snapshot(after);

    let mut changes = BTreeMap::new();
    for (name, after_value) in after_map {
        let before_value = before_map.get(name).cloned().unwrap_or(Value::Null);
        if before_value != after_value {
            changes.insert(
                name.to_string(),
                FieldChange {
                    before: before_value,
                    after: after_value,
                },
            );
        }
    }
    changes
}

/// Flattens an incident into a JSON value per auditable field. Uses stable
/// string encodings for dates and times so diffs survive serialization.
fn snapshot(incident: &Incident) -> BTreeMap<&'static str, Value> {
    let fields = &incident.fields;
    let mut map = BTreeMap::new();
    map.insert("status", json!(incident.status.as_str()));
    map.insert("student_id", json_opt(incident.student_id.map(|id| id.to_string())));
    map.insert("antecedent", json_opt(fields.antecedent.clone()));
    map.insert("behavior", json_opt(fields.behavior.clone()));
    map.insert("consequence", json_opt(fields.consequence.clone()));
    map.insert("incident_type", json_opt(fields.incident_type.clone()));
    map.insert(
        "functions_of_behavior",
        Value::Array(
            fields
                .functions_of_behavior
                .iter()
                .map(|f| json!(f.as_str()))
                .collect(),
        ),
    );
    map.insert(
        "occurred_on",
        json_opt(fields.occurred_on.map(|d| d.format("%Y-%m-%d").to_string())),
    );
    map.insert(
        "occurred_time",
        json_opt(fields.occurred_time.map(|t| t.format("%H:%M:%S").to_string())),
    );
    map.insert("location", json_opt(fields.location.clone()));
    map.insert(
        "duration_minutes",
        fields.duration_minutes.map(|d| json!(d)).unwrap_or(Value::Null),
    );
    map.insert("intervention", json_opt(fields.intervention.clone()));
    map.insert("notes", json_opt(fields.notes.clone()));
    map.insert("teacher_signature", json_opt(incident.teacher_signature.clone()));
    map.insert(
        "teacher_signed_at",
        json_opt(incident.teacher_signed_at.map(|t| t.to_rfc3339())),
    );
    map.insert("parent_signature", json_opt(incident.parent_signature.clone()));
    map.insert(
        "parent_signed_at",
        json_opt(incident.parent_signed_at.map(|t| t.to_rfc3339())),
    );
    map
}

fn json_opt(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}
