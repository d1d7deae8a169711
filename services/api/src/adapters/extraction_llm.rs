//! services/api/src/adapters/extraction_llm.rs
//!
//! This module contains the adapter for the field-extracting LLM.
//! It implements the `FieldExtractionService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use behavior_log_core::{
    domain::{FunctionOfBehavior, IncidentFields, Message},
    ports::{FieldExtractionService, PortError, PortResult},
};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::warn;

const EXTRACTION_INSTRUCTIONS: &str = r#"You are a documentation assistant for classroom behavioral incidents. You receive the transcript of a conversation in which a teacher describes an incident, plus the fields already captured on the incident form.

Extract any of the following fields you can from the transcript and reply with ONLY a JSON object (no prose, no code fences) using exactly these keys:
- "antecedent": what happened immediately before the behavior, or null
- "behavior": the observable behavior itself, or null
- "consequence": what happened immediately after, or null
- "incident_type": a short category such as "aggression", "elopement", "property destruction", or null
- "functions_of_behavior": an array with any of "attention", "escape", "tangible", "sensory" (empty array if unknown)
- "occurred_on": the date in YYYY-MM-DD form, or null
- "occurred_time": the time of day in HH:MM form, or null
- "location": where it happened, or null
- "duration_minutes": an integer number of minutes, or null
- "intervention": what the adult did in response, or null
- "notes": any other relevant detail, or null

Use null for anything the transcript does not state. Do not invent details. Do not repeat values that are already captured unless the transcript corrects them."#;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `FieldExtractionService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiExtractionAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiExtractionAdapter {
    /// Creates a new `OpenAiExtractionAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

//=========================================================================================
// Wire Format for the Model's Reply
//=========================================================================================

#[derive(Debug, Deserialize)]
struct ExtractedFieldsWire {
    antecedent: Option<String>,
    behavior: Option<String>,
    consequence: Option<String>,
    incident_type: Option<String>,
    #[serde(default)]
    functions_of_behavior: Vec<String>,
    occurred_on: Option<String>,
    occurred_time: Option<String>,
    location: Option<String>,
    duration_minutes: Option<i32>,
    intervention: Option<String>,
    notes: Option<String>,
}

impl ExtractedFieldsWire {
    fn to_domain(self) -> IncidentFields {
        let mut functions = BTreeSet::new();
        for raw in &self.functions_of_behavior {
            match FunctionOfBehavior::parse(raw.trim()) {
                Some(function) => {
                    functions.insert(function);
                }
                None => warn!("Extractor returned unknown function of behavior '{}'", raw),
            }
        }
        IncidentFields {
            antecedent: self.antecedent,
            behavior: self.behavior,
            consequence: self.consequence,
            incident_type: self.incident_type,
            functions_of_behavior: functions,
            occurred_on: self
                .occurred_on
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok()),
            occurred_time: self.occurred_time.as_deref().and_then(parse_time),
            location: self.location,
            duration_minutes: self.duration_minutes,
            intervention: self.intervention,
            notes: self.notes,
        }
    }
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

/// Models sometimes wrap JSON in a markdown fence despite instructions.
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn render_transcript(turns: &[Message]) -> String {
    turns
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_known_fields(current: &IncidentFields) -> String {
    let mut lines = Vec::new();
    let mut push = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            lines.push(format!("{}: {}", name, value));
        }
    };
    push("antecedent", &current.antecedent);
    push("behavior", &current.behavior);
    push("consequence", &current.consequence);
    push("incident_type", &current.incident_type);
    push("location", &current.location);
    push("intervention", &current.intervention);
    push("notes", &current.notes);
    if lines.is_empty() {
        "(none yet)".to_string()
    } else {
        lines.join("\n")
    }
}

//=========================================================================================
// `FieldExtractionService` Trait Implementation
//=========================================================================================

#[async_trait]
impl FieldExtractionService for OpenAiExtractionAdapter {
    /// Reduces the dialogue to candidate structured fields via one chat completion.
    async fn extract_fields(
        &self,
        turns: &[Message],
        current: &IncidentFields,
    ) -> PortResult<IncidentFields> {
        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(EXTRACTION_INSTRUCTIONS)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(format!(
                    "ALREADY CAPTURED:\n{}\n\nTRANSCRIPT:\n{}",
                    render_known_fields(current),
                    render_transcript(turns)
                ))
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        // Call the API and manually map the error if it occurs, which respects the orphan rule.
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        let Some(choice) = response.choices.into_iter().next() else {
            return Err(PortError::Unexpected(
                "Extraction LLM returned no choices in its response.".to_string(),
            ));
        };
        let Some(content) = choice.message.content else {
            return Err(PortError::Unexpected(
                "Extraction LLM response contained no text content.".to_string(),
            ));
        };

        let wire: ExtractedFieldsWire = serde_json::from_str(strip_code_fence(&content))
            .map_err(|e| {
                PortError::Unexpected(format!("Extraction LLM reply was not valid JSON: {}", e))
            })?;
        Ok(wire.to_domain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fences() {
        let fenced = "```json\n{\"behavior\": null}\n```";
        assert_eq!(strip_code_fence(fenced), "{\"behavior\": null}");
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn wire_conversion_drops_unknown_functions_and_bad_dates() {
        let wire: ExtractedFieldsWire = serde_json::from_str(
            r#"{
                "antecedent": null,
                "behavior": "Hit the desk",
                "consequence": null,
                "incident_type": "aggression",
                "functions_of_behavior": ["escape", "mystery"],
                "occurred_on": "not-a-date",
                "occurred_time": "10:30",
                "location": null,
                "duration_minutes": 5,
                "intervention": null,
                "notes": null
            }"#,
        )
        .unwrap();

        let fields = wire.to_domain();
        assert_eq!(fields.behavior.as_deref(), Some("Hit the desk"));
        assert_eq!(fields.functions_of_behavior.len(), 1);
        assert_eq!(fields.occurred_on, None);
        assert!(fields.occurred_time.is_some());
        assert_eq!(fields.duration_minutes, Some(5));
    }
}
