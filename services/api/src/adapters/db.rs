//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `IncidentStore` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use behavior_log_core::domain::{
    Conversation, ConversationStatus, EditHistoryEntry, FieldChange, Incident, IncidentFields,
    IncidentStatus, Message, MessageRole, Student, User,
};
use behavior_log_core::domain::FunctionOfBehavior;
use behavior_log_core::ports::{IncidentStore, NewEditHistoryEntry, PortError, PortResult};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{FromRow, PgPool};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `IncidentStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// Unique violations surface as conflicts so callers retry against the
/// winning row instead of treating the race as an outage.
fn conflict_on_unique(e: sqlx::Error) -> PortError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return PortError::Conflict(db_err.to_string());
        }
    }
    unexpected(e)
}

fn not_found_or(e: sqlx::Error, what: &str, id: Uuid) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound(format!("{} {} not found", what, id)),
        _ => unexpected(e),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    email: Option<String>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            email: self.email,
        }
    }
}

#[derive(FromRow)]
struct StudentRecord {
    id: Uuid,
    user_id: Uuid,
    first_name: String,
    last_name: String,
}
impl StudentRecord {
    fn to_domain(self) -> Student {
        Student {
            id: self.id,
            user_id: self.user_id,
            first_name: self.first_name,
            last_name: self.last_name,
        }
    }
}

#[derive(FromRow)]
struct ConversationRecord {
    id: Uuid,
    user_id: Uuid,
    student_id: Option<Uuid>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl ConversationRecord {
    fn to_domain(self) -> PortResult<Conversation> {
        let status = ConversationStatus::parse(&self.status).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown conversation status '{}'", self.status))
        })?;
        Ok(Conversation {
            id: self.id,
            user_id: self.user_id,
            student_id: self.student_id,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}
impl MessageRecord {
    fn to_domain(self) -> PortResult<Message> {
        let role = MessageRole::parse(&self.role).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown message role '{}'", self.role))
        })?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            content: self.content,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct IncidentRecord {
    id: Uuid,
    user_id: Uuid,
    student_id: Option<Uuid>,
    conversation_id: Option<Uuid>,
    status: String,
    antecedent: Option<String>,
    behavior: Option<String>,
    consequence: Option<String>,
    incident_type: Option<String>,
    functions_of_behavior: Vec<String>,
    occurred_on: Option<NaiveDate>,
    occurred_time: Option<NaiveTime>,
    location: Option<String>,
    duration_minutes: Option<i32>,
    intervention: Option<String>,
    notes: Option<String>,
    teacher_signature: Option<String>,
    teacher_signed_at: Option<DateTime<Utc>>,
    parent_signature: Option<String>,
    parent_signed_at: Option<DateTime<Utc>>,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl IncidentRecord {
    fn to_domain(self) -> PortResult<Incident> {
        let status = IncidentStatus::parse(&self.status).ok_or_else(|| {
            PortError::Unexpected(format!("Unknown incident status '{}'", self.status))
        })?;
        let mut functions = BTreeSet::new();
        for raw in &self.functions_of_behavior {
            let function = FunctionOfBehavior::parse(raw).ok_or_else(|| {
                PortError::Unexpected(format!("Unknown function of behavior '{}'", raw))
            })?;
            functions.insert(function);
        }
        Ok(Incident {
            id: self.id,
            user_id: self.user_id,
            student_id: self.student_id,
            conversation_id: self.conversation_id,
            status,
            fields: IncidentFields {
                antecedent: self.antecedent,
                behavior: self.behavior,
                consequence: self.consequence,
                incident_type: self.incident_type,
                functions_of_behavior: functions,
                occurred_on: self.occurred_on,
                occurred_time: self.occurred_time,
                location: self.location,
                duration_minutes: self.duration_minutes,
                intervention: self.intervention,
                notes: self.notes,
            },
            teacher_signature: self.teacher_signature,
            teacher_signed_at: self.teacher_signed_at,
            parent_signature: self.parent_signature,
            parent_signed_at: self.parent_signed_at,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EditHistoryRecord {
    id: Uuid,
    incident_id: Uuid,
    user_id: Uuid,
    changed_fields: serde_json::Value,
    created_at: DateTime<Utc>,
}
impl EditHistoryRecord {
    fn to_domain(self) -> PortResult<EditHistoryEntry> {
        let changed_fields: BTreeMap<String, FieldChange> =
            serde_json::from_value(self.changed_fields).map_err(|e| {
                PortError::Unexpected(format!("Malformed changed-fields map: {}", e))
            })?;
        Ok(EditHistoryEntry {
            id: self.id,
            incident_id: self.incident_id,
            user_id: self.user_id,
            changed_fields,
            created_at: self.created_at,
        })
    }
}

fn functions_to_vec(functions: &BTreeSet<FunctionOfBehavior>) -> Vec<String> {
    functions.iter().map(|f| f.as_str().to_string()).collect()
}

const INCIDENT_COLUMNS: &str = "id, user_id, student_id, conversation_id, status, antecedent, \
     behavior, consequence, incident_type, functions_of_behavior, occurred_on, occurred_time, \
     location, duration_minutes, intervention, notes, teacher_signature, teacher_signed_at, \
     parent_signature, parent_signed_at, version, created_at, updated_at";

//=========================================================================================
// `IncidentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl IncidentStore for DbAdapter {
    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<User> {
        sqlx::query("INSERT INTO users (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;

        let record =
            sqlx::query_as::<_, UserRecord>("SELECT user_id, email FROM users WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| not_found_or(e, "User", user_id))?;

        Ok(record.to_domain())
    }

    async fn create_student(
        &self,
        user_id: Uuid,
        first_name: &str,
        last_name: &str,
    ) -> PortResult<Student> {
        let record = sqlx::query_as::<_, StudentRecord>(
            "INSERT INTO students (id, user_id, first_name, last_name) VALUES ($1, $2, $3, $4) \
             RETURNING id, user_id, first_name, last_name",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(first_name)
        .bind(last_name)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.to_domain())
    }

    async fn get_student_by_id(&self, student_id: Uuid) -> PortResult<Student> {
        let record = sqlx::query_as::<_, StudentRecord>(
            "SELECT id, user_id, first_name, last_name FROM students WHERE id = $1",
        )
        .bind(student_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| not_found_or(e, "Student", student_id))?;
        Ok(record.to_domain())
    }

    async fn create_conversation(
        &self,
        user_id: Uuid,
        student_id: Option<Uuid>,
    ) -> PortResult<Conversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "INSERT INTO conversations (id, user_id, student_id) VALUES ($1, $2, $3) \
             RETURNING id, user_id, student_id, status, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(student_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_conversation_by_id(&self, conversation_id: Uuid) -> PortResult<Conversation> {
        let record = sqlx::query_as::<_, ConversationRecord>(
            "SELECT id, user_id, student_id, status, created_at, updated_at \
             FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| not_found_or(e, "Conversation", conversation_id))?;
        record.to_domain()
    }

    async fn close_conversation(&self, conversation_id: Uuid) -> PortResult<Conversation> {
        // One-way and idempotent: closing a closed conversation leaves the row as-is.
        let record = sqlx::query_as::<_, ConversationRecord>(
            "UPDATE conversations SET status = 'closed', updated_at = NOW() \
             WHERE id = $1 \
             RETURNING id, user_id, student_id, status, created_at, updated_at",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| not_found_or(e, "Conversation", conversation_id))?;
        record.to_domain()
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> PortResult<Message> {
        let record = sqlx::query_as::<_, MessageRecord>(
            "INSERT INTO messages (id, conversation_id, role, content) VALUES ($1, $2, $3, $4) \
             RETURNING id, conversation_id, role, content, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_messages_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> PortResult<Vec<Message>> {
        // seq is a serial column so simultaneous inserts still have a total order.
        let records = sqlx::query_as::<_, MessageRecord>(
            "SELECT id, conversation_id, role, content, created_at \
             FROM messages WHERE conversation_id = $1 ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn create_incident(
        &self,
        user_id: Uuid,
        student_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        fields: IncidentFields,
    ) -> PortResult<Incident> {
        let sql = format!(
            "INSERT INTO incidents (id, user_id, student_id, conversation_id, status, antecedent, \
             behavior, consequence, incident_type, functions_of_behavior, occurred_on, \
             occurred_time, location, duration_minutes, intervention, notes) \
             VALUES ($1, $2, $3, $4, 'draft', $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {INCIDENT_COLUMNS}"
        );
        let record = sqlx::query_as::<_, IncidentRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(student_id)
            .bind(conversation_id)
            .bind(&fields.antecedent)
            .bind(&fields.behavior)
            .bind(&fields.consequence)
            .bind(&fields.incident_type)
            .bind(functions_to_vec(&fields.functions_of_behavior))
            .bind(fields.occurred_on)
            .bind(fields.occurred_time)
            .bind(&fields.location)
            .bind(fields.duration_minutes)
            .bind(&fields.intervention)
            .bind(&fields.notes)
            .fetch_one(&self.pool)
            .await
            .map_err(conflict_on_unique)?;
        record.to_domain()
    }

    async fn get_incident_by_id(&self, incident_id: Uuid) -> PortResult<Incident> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1");
        let record = sqlx::query_as::<_, IncidentRecord>(&sql)
            .bind(incident_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| not_found_or(e, "Incident", incident_id))?;
        record.to_domain()
    }

    async fn find_draft_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> PortResult<Option<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents \
             WHERE conversation_id = $1 AND status = 'draft'"
        );
        let record = sqlx::query_as::<_, IncidentRecord>(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        record.map(|r| r.to_domain()).transpose()
    }

    async fn update_incident(
        &self,
        incident: &Incident,
        expected_version: i32,
        entry: NewEditHistoryEntry,
    ) -> PortResult<Incident> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        // Compare-and-set on the version column serializes writers per incident.
        let sql = format!(
            "UPDATE incidents SET student_id = $3, status = $4, antecedent = $5, behavior = $6, \
             consequence = $7, incident_type = $8, functions_of_behavior = $9, occurred_on = $10, \
             occurred_time = $11, location = $12, duration_minutes = $13, intervention = $14, \
             notes = $15, teacher_signature = $16, teacher_signed_at = $17, \
             parent_signature = $18, parent_signed_at = $19, version = version + 1, \
             updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {INCIDENT_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, IncidentRecord>(&sql)
            .bind(incident.id)
            .bind(expected_version)
            .bind(incident.student_id)
            .bind(incident.status.as_str())
            .bind(&incident.fields.antecedent)
            .bind(&incident.fields.behavior)
            .bind(&incident.fields.consequence)
            .bind(&incident.fields.incident_type)
            .bind(functions_to_vec(&incident.fields.functions_of_behavior))
            .bind(incident.fields.occurred_on)
            .bind(incident.fields.occurred_time)
            .bind(&incident.fields.location)
            .bind(incident.fields.duration_minutes)
            .bind(&incident.fields.intervention)
            .bind(&incident.fields.notes)
            .bind(&incident.teacher_signature)
            .bind(incident.teacher_signed_at)
            .bind(&incident.parent_signature)
            .bind(incident.parent_signed_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unexpected)?;

        let updated = match updated {
            Some(record) => record,
            None => {
                // Distinguish a lost race from a deleted record.
                let exists = sqlx::query_scalar::<_, i32>(
                    "SELECT version FROM incidents WHERE id = $1",
                )
                .bind(incident.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unexpected)?;
                return Err(match exists {
                    Some(actual) => PortError::Conflict(format!(
                        "Incident {} moved to version {} while version {} was expected",
                        incident.id, actual, expected_version
                    )),
                    None => PortError::NotFound(format!("Incident {} not found", incident.id)),
                });
            }
        };

        // The audit row rides in the same transaction: if it cannot be
        // written, the mutation rolls back with it.
        let changed_fields = serde_json::to_value(&entry.changed_fields)
            .map_err(|e| PortError::AuditWrite(e.to_string()))?;
        sqlx::query(
            "INSERT INTO incident_edit_history (id, incident_id, user_id, changed_fields) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(entry.incident_id)
        .bind(entry.user_id)
        .bind(changed_fields)
        .execute(&mut *tx)
        .await
        .map_err(|e| PortError::AuditWrite(e.to_string()))?;

        tx.commit().await.map_err(unexpected)?;
        updated.to_domain()
    }

    async fn list_edit_history(&self, incident_id: Uuid) -> PortResult<Vec<EditHistoryEntry>> {
        let records = sqlx::query_as::<_, EditHistoryRecord>(
            "SELECT id, incident_id, user_id, changed_fields, created_at \
             FROM incident_edit_history WHERE incident_id = $1 ORDER BY created_at ASC, seq ASC",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }
}
