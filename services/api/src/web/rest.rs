//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::error::ApiError;
use crate::web::capture;
use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use behavior_log_core::domain::{
    EditHistoryEntry, FunctionOfBehavior, Incident, Message, MessageRole,
};
use behavior_log_core::extraction::ExtractionSignal;
use behavior_log_core::incident::{IncidentError, IncidentPatch, SignatureRequest};
use behavior_log_core::ports::{IncidentStore, PortError};
use behavior_log_core::redaction::redact;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_conversation_handler,
        append_turn_handler,
        derive_draft_handler,
        update_incident_handler,
        sign_incident_handler,
        list_edit_history_handler,
        redact_handler,
    ),
    components(
        schemas(
            CreateStudentRequest,
            StudentResponse,
            CreateConversationRequest,
            ConversationResponse,
            AppendTurnRequest,
            MessageResponse,
            DraftResponse,
            IncidentPayload,
            UpdateIncidentRequest,
            SignIncidentRequest,
            EditHistoryPayload,
            RedactRequest,
            RedactResponse,
        )
    ),
    tags(
        (name = "Behavior Log API", description = "API endpoints for the incident capture and redaction pipeline.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateStudentRequest {
    pub first_name: String,
    pub last_name: String,
}

#[derive(Serialize, ToSchema)]
pub struct StudentResponse {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateConversationRequest {
    /// The student this capture session is about, when already known.
    pub student_id: Option<Uuid>,
}

#[derive(Serialize, ToSchema)]
pub struct ConversationResponse {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub student_id: Option<Uuid>,
    pub status: String,
}

#[derive(Deserialize, ToSchema)]
pub struct AppendTurnRequest {
    /// "user", "assistant", or "system"; defaults to "user".
    pub role: Option<String>,
    pub content: String,
}

#[derive(Serialize, ToSchema)]
pub struct MessageResponse {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.id,
            conversation_id: message.conversation_id,
            role: message.role.as_str().to_string(),
            content: message.content,
            created_at: message.created_at,
        }
    }
}

/// The full wire representation of an incident record.
#[derive(Serialize, Clone, Debug, ToSchema)]
pub struct IncidentPayload {
    pub id: Uuid,
    pub user_id: Uuid,
    pub student_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub status: String,
    pub antecedent: Option<String>,
    pub behavior: Option<String>,
    pub consequence: Option<String>,
    pub incident_type: Option<String>,
    pub functions_of_behavior: Vec<String>,
    pub occurred_on: Option<NaiveDate>,
    pub occurred_time: Option<NaiveTime>,
    pub location: Option<String>,
    pub duration_minutes: Option<i32>,
    pub intervention: Option<String>,
    pub notes: Option<String>,
    pub teacher_signature: Option<String>,
    pub teacher_signed_at: Option<DateTime<Utc>>,
    pub parent_signature: Option<String>,
    pub parent_signed_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Incident> for IncidentPayload {
    fn from(incident: Incident) -> Self {
        Self {
            id: incident.id,
            user_id: incident.user_id,
            student_id: incident.student_id,
            conversation_id: incident.conversation_id,
            status: incident.status.as_str().to_string(),
            antecedent: incident.fields.antecedent,
            behavior: incident.fields.behavior,
            consequence: incident.fields.consequence,
            incident_type: incident.fields.incident_type,
            functions_of_behavior: incident
                .fields
                .functions_of_behavior
                .iter()
                .map(|f| f.as_str().to_string())
                .collect(),
            occurred_on: incident.fields.occurred_on,
            occurred_time: incident.fields.occurred_time,
            location: incident.fields.location,
            duration_minutes: incident.fields.duration_minutes,
            intervention: incident.fields.intervention,
            notes: incident.fields.notes,
            teacher_signature: incident.teacher_signature,
            teacher_signed_at: incident.teacher_signed_at,
            parent_signature: incident.parent_signature,
            parent_signed_at: incident.parent_signed_at,
            version: incident.version,
            created_at: incident.created_at,
            updated_at: incident.updated_at,
        }
    }
}

/// The draft returned by a derive-draft round, with the extraction diagnostic.
#[derive(Serialize, Debug, ToSchema)]
pub struct DraftResponse {
    pub incident: IncidentPayload,
    /// "updated", "nothing_new", or "failed".
    pub extraction: String,
    pub extraction_error: Option<String>,
}

impl DraftResponse {
    pub fn from_outcome(outcome: capture::DraftOutcome) -> Self {
        let extraction = outcome.signal.as_str().to_string();
        let extraction_error = match outcome.signal {
            ExtractionSignal::Failed { reason } => Some(reason),
            _ => None,
        };
        Self {
            incident: outcome.incident.into(),
            extraction,
            extraction_error,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateIncidentRequest {
    pub student_id: Option<Uuid>,
    pub antecedent: Option<String>,
    pub behavior: Option<String>,
    pub consequence: Option<String>,
    pub incident_type: Option<String>,
    pub functions_of_behavior: Option<Vec<String>>,
    pub occurred_on: Option<NaiveDate>,
    pub occurred_time: Option<NaiveTime>,
    pub location: Option<String>,
    pub duration_minutes: Option<i32>,
    pub intervention: Option<String>,
    pub notes: Option<String>,
}

impl UpdateIncidentRequest {
    fn into_patch(self) -> Result<IncidentPatch, (StatusCode, String)> {
        let functions_of_behavior = match self.functions_of_behavior {
            Some(raw) => {
                let mut parsed = BTreeSet::new();
                for name in raw {
                    let function = FunctionOfBehavior::parse(name.trim()).ok_or_else(|| {
                        (
                            StatusCode::BAD_REQUEST,
                            format!("Unknown function of behavior: '{}'", name),
                        )
                    })?;
                    parsed.insert(function);
                }
                Some(parsed)
            }
            None => None,
        };
        Ok(IncidentPatch {
            student_id: self.student_id,
            antecedent: self.antecedent,
            behavior: self.behavior,
            consequence: self.consequence,
            incident_type: self.incident_type,
            functions_of_behavior,
            occurred_on: self.occurred_on,
            occurred_time: self.occurred_time,
            location: self.location,
            duration_minutes: self.duration_minutes,
            intervention: self.intervention,
            notes: self.notes,
        })
    }
}

#[derive(Deserialize, ToSchema)]
pub struct SignIncidentRequest {
    pub teacher_signature: String,
    pub parent_signature: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct EditHistoryPayload {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub user_id: Uuid,
    /// Field name -> {before, after} pairs for exactly the fields that changed.
    #[schema(value_type = Object)]
    pub changed_fields: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<EditHistoryEntry> for EditHistoryPayload {
    fn from(entry: EditHistoryEntry) -> Self {
        Self {
            id: entry.id,
            incident_id: entry.incident_id,
            user_id: entry.user_id,
            changed_fields: serde_json::to_value(&entry.changed_fields).unwrap_or_default(),
            created_at: entry.created_at,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct RedactRequest {
    pub text: String,
    pub identifiers: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct RedactResponse {
    pub text: String,
}

#[derive(Deserialize)]
pub struct IncidentViewQuery {
    /// Pass "redacted" to receive the record prepared for secondary viewers.
    pub view: Option<String>,
}

//=========================================================================================
// Shared Handler Helpers
//=========================================================================================

/// Extracts the acting user from the `x-user-id` header.
fn user_id_from_headers(headers: &HeaderMap) -> Result<Uuid, (StatusCode, String)> {
    let user_id_str = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                "x-user-id header is required".to_string(),
            )
        })?;

    Uuid::parse_str(user_id_str).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "Invalid x-user-id format".to_string(),
        )
    })
}

/// Maps service errors onto distinct HTTP statuses: 404 unknown record,
/// 409 lost race, 422 validation, 423 locked record.
pub fn error_response(e: ApiError) -> (StatusCode, String) {
    match &e {
        ApiError::Port(PortError::NotFound(message)) => {
            (StatusCode::NOT_FOUND, message.clone())
        }
        ApiError::Port(PortError::Conflict(message)) => {
            (StatusCode::CONFLICT, message.clone())
        }
        ApiError::Port(PortError::AuditWrite(message)) => {
            // Worse than a plain failure: flagged for operator reconciliation.
            error!("Audit write failure: {}", message);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Mutation rolled back; audit entry could not be written: {}", message),
            )
        }
        ApiError::Incident(IncidentError::Locked { .. }) => {
            (StatusCode::LOCKED, e.to_string())
        }
        ApiError::Incident(IncidentError::Validation { .. })
        | ApiError::Incident(IncidentError::ConversationClosed(_)) => {
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        ApiError::Redaction(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        _ => {
            error!("Unhandled service error: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred".to_string(),
            )
        }
    }
}

fn parse_role(role: Option<&str>) -> Result<MessageRole, (StatusCode, String)> {
    match role {
        None => Ok(MessageRole::User),
        Some(raw) => MessageRole::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("Invalid message role: '{}'", raw),
            )
        }),
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Register a student for the acting user.
pub async fn create_student_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateStudentRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;
    if body.first_name.trim().is_empty() || body.last_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Student first and last name are required".to_string(),
        ));
    }

    let db = &app_state.db;
    let result = async {
        db.get_or_create_user(user_id).await?;
        db.create_student(user_id, body.first_name.trim(), body.last_name.trim())
            .await
    }
    .await;

    match result {
        Ok(student) => Ok((
            StatusCode::CREATED,
            Json(StudentResponse {
                id: student.id,
                first_name: student.first_name,
                last_name: student.last_name,
            }),
        )),
        Err(e) => Err(error_response(e.into())),
    }
}

/// Start a capture session.
///
/// A `x-user-id` header is required to associate the conversation with a user.
#[utoipa::path(
    post,
    path = "/conversations",
    request_body = CreateConversationRequest,
    responses(
        (status = 201, description = "Conversation created successfully", body = ConversationResponse),
        (status = 400, description = "Bad request (e.g., missing header)"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn create_conversation_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;

    let db = &app_state.db;
    let result = async {
        db.get_or_create_user(user_id).await?;
        db.create_conversation(user_id, body.student_id).await
    }
    .await;

    match result {
        Ok(conversation) => Ok((
            StatusCode::CREATED,
            Json(ConversationResponse {
                conversation_id: conversation.id,
                user_id: conversation.user_id,
                student_id: conversation.student_id,
                status: conversation.status.as_str().to_string(),
            }),
        )),
        Err(e) => Err(error_response(e.into())),
    }
}

/// Append one dialogue turn to an active conversation.
#[utoipa::path(
    post,
    path = "/conversations/{id}/messages",
    request_body = AppendTurnRequest,
    responses(
        (status = 201, description = "Turn recorded", body = MessageResponse),
        (status = 404, description = "Conversation not found"),
        (status = 422, description = "Conversation is closed")
    ),
    params(
        ("id" = Uuid, Path, description = "The conversation ID."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn append_turn_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<AppendTurnRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;
    let role = parse_role(body.role.as_deref())?;

    match capture::append_turn(&app_state, user_id, conversation_id, role, &body.content).await {
        Ok(message) => Ok((StatusCode::CREATED, Json(MessageResponse::from(message)))),
        Err(e) => Err(error_response(e)),
    }
}

/// Run extraction over the conversation and fold the result into its draft.
#[utoipa::path(
    post,
    path = "/conversations/{id}/draft",
    responses(
        (status = 200, description = "Current draft with extraction diagnostic", body = DraftResponse),
        (status = 404, description = "Conversation not found"),
        (status = 409, description = "Lost a concurrent-update race")
    ),
    params(
        ("id" = Uuid, Path, description = "The conversation ID."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn derive_draft_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;

    match capture::derive_draft(&app_state, user_id, conversation_id).await {
        Ok(outcome) => Ok(Json(DraftResponse::from_outcome(outcome))),
        Err(e) => Err(error_response(e)),
    }
}

/// Close a conversation. Idempotent.
pub async fn close_conversation_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;

    match capture::close_conversation(&app_state, user_id, conversation_id).await {
        Ok(conversation) => Ok(Json(ConversationResponse {
            conversation_id: conversation.id,
            user_id: conversation.user_id,
            student_id: conversation.student_id,
            status: conversation.status.as_str().to_string(),
        })),
        Err(e) => Err(error_response(e)),
    }
}

/// Fetch an incident, optionally pre-redacted for secondary viewers.
pub async fn get_incident_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(incident_id): Path<Uuid>,
    Query(query): Query<IncidentViewQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;

    let result = if query.view.as_deref() == Some("redacted") {
        capture::redacted_incident(&app_state, user_id, incident_id).await
    } else {
        capture::incident_by_id(&app_state, user_id, incident_id).await
    };

    match result {
        Ok(incident) => Ok(Json(IncidentPayload::from(incident))),
        Err(e) => Err(error_response(e)),
    }
}

/// Apply a manual field patch to a draft incident.
#[utoipa::path(
    patch,
    path = "/incidents/{id}",
    request_body = UpdateIncidentRequest,
    responses(
        (status = 200, description = "Updated incident", body = IncidentPayload),
        (status = 404, description = "Incident not found"),
        (status = 409, description = "Lost a concurrent-update race"),
        (status = 423, description = "Incident is signed and locked")
    ),
    params(
        ("id" = Uuid, Path, description = "The incident ID."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn update_incident_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(incident_id): Path<Uuid>,
    Json(body): Json<UpdateIncidentRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;
    let patch = body.into_patch()?;

    match capture::update_incident(&app_state, user_id, incident_id, &patch).await {
        Ok(incident) => Ok(Json(IncidentPayload::from(incident))),
        Err(e) => Err(error_response(e)),
    }
}

/// Sign a draft incident, making it immutable.
#[utoipa::path(
    post,
    path = "/incidents/{id}/sign",
    request_body = SignIncidentRequest,
    responses(
        (status = 200, description = "Signed incident", body = IncidentPayload),
        (status = 404, description = "Incident not found"),
        (status = 422, description = "Mandatory fields missing"),
        (status = 423, description = "Incident is already signed")
    ),
    params(
        ("id" = Uuid, Path, description = "The incident ID."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn sign_incident_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(incident_id): Path<Uuid>,
    Json(body): Json<SignIncidentRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;
    let signature = SignatureRequest {
        teacher_signature: body.teacher_signature,
        parent_signature: body.parent_signature,
    };

    match capture::sign_incident(&app_state, user_id, incident_id, &signature).await {
        Ok(incident) => Ok(Json(IncidentPayload::from(incident))),
        Err(e) => Err(error_response(e)),
    }
}

/// List the append-only audit trail for an incident, oldest first.
#[utoipa::path(
    get,
    path = "/incidents/{id}/history",
    responses(
        (status = 200, description = "Audit trail", body = [EditHistoryPayload]),
        (status = 404, description = "Incident not found")
    ),
    params(
        ("id" = Uuid, Path, description = "The incident ID."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn list_edit_history_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(incident_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from_headers(&headers)?;

    match capture::list_edit_history(&app_state, user_id, incident_id).await {
        Ok(entries) => Ok(Json(
            entries
                .into_iter()
                .map(EditHistoryPayload::from)
                .collect::<Vec<_>>(),
        )),
        Err(e) => Err(error_response(e)),
    }
}

/// Redact ad-hoc text with a caller-supplied identifier list.
#[utoipa::path(
    post,
    path = "/redact",
    request_body = RedactRequest,
    responses(
        (status = 200, description = "Redacted text", body = RedactResponse),
        (status = 400, description = "Malformed identifier list")
    )
)]
pub async fn redact_handler(
    Json(body): Json<RedactRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match redact(&body.text, &body.identifiers) {
        Ok(text) => Ok(Json(RedactResponse { text })),
        Err(e) => Err(error_response(e.into())),
    }
}
