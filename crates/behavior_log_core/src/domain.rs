//! crates/behavior_log_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or HTTP representation.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// Represents a user (a teacher documenting incidents) - used throughout app
#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub email: Option<String>, // Optional because old users won't have it
}

/// A student a teacher documents incidents for. The student's name parts are
/// the redaction identifiers used when text is prepared for secondary viewers.
#[derive(Debug, Clone)]
pub struct Student {
    pub id: Uuid,
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

impl Student {
    /// The identifiers to strip from transcript-derived text: the full name,
    /// first name, and last name.
    pub fn redaction_identifiers(&self) -> Vec<String> {
        vec![
            format!("{} {}", self.first_name, self.last_name),
            self.first_name.clone(),
            self.last_name.clone(),
        ]
    }
}

/// A capture conversation. Mutable only while `Active`; closing is one-way.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub student_id: Option<Uuid>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Active,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConversationStatus::Active),
            "closed" => Some(ConversationStatus::Closed),
            _ => None,
        }
    }
}

/// A single dialogue turn. Immutable once created; creation order is the
/// sequence the extractor consumes.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// The hypothesized function of a behavior, per the standard ABA categories.
/// Modeled as a set on the incident: insertion order irrelevant, duplicates
/// collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionOfBehavior {
    Attention,
    Escape,
    Tangible,
    Sensory,
}

impl FunctionOfBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionOfBehavior::Attention => "attention",
            FunctionOfBehavior::Escape => "escape",
            FunctionOfBehavior::Tangible => "tangible",
            FunctionOfBehavior::Sensory => "sensory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attention" => Some(FunctionOfBehavior::Attention),
            "escape" => Some(FunctionOfBehavior::Escape),
            "tangible" => Some(FunctionOfBehavior::Tangible),
            "sensory" => Some(FunctionOfBehavior::Sensory),
            _ => None,
        }
    }
}

/// The structured content fields of an ABC incident record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentFields {
    pub antecedent: Option<String>,
    pub behavior: Option<String>,
    pub consequence: Option<String>,
    pub incident_type: Option<String>,
    pub functions_of_behavior: BTreeSet<FunctionOfBehavior>,
    pub occurred_on: Option<NaiveDate>,
    pub occurred_time: Option<NaiveTime>,
    pub location: Option<String>,
    pub duration_minutes: Option<i32>,
    pub intervention: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentStatus {
    Draft,
    Signed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Draft => "draft",
            IncidentStatus::Signed => "signed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(IncidentStatus::Draft),
            "signed" => Some(IncidentStatus::Signed),
            _ => None,
        }
    }
}

/// An incident record. `version` is the optimistic-concurrency token: every
/// committed mutation increments it, and writers must present the version
/// they read.
#[derive(Debug, Clone)]
pub struct Incident {
    pub id: Uuid,
    pub user_id: Uuid,
    pub student_id: Option<Uuid>,
    /// Weak reference: the originating conversation may be closed or deleted
    /// independently of the incident.
    pub conversation_id: Option<Uuid>,
    pub status: IncidentStatus,
    pub fields: IncidentFields,
    pub teacher_signature: Option<String>,
    pub teacher_signed_at: Option<DateTime<Utc>>,
    pub parent_signature: Option<String>,
    pub parent_signed_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A before/after value pair for one field of an incident.
/// `before` is JSON null when the field was newly set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// One append-only audit record: the exact fields a successful mutation
/// changed, keyed by field name. Never edited or deleted after the fact.
#[derive(Debug, Clone)]
pub struct EditHistoryEntry {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub user_id: Uuid,
    pub changed_fields: BTreeMap<String, FieldChange>,
    pub created_at: DateTime<Utc>,
}

impl EditHistoryEntry {
    /// The entry recorded for the sign transition carries the status flip in
    /// its changed-fields map.
    pub fn is_signing_entry(&self) -> bool {
        self.changed_fields
            .get("status")
            .map(|c| c.after == serde_json::Value::String("signed".to_string()))
            .unwrap_or(false)
    }
}
