//! crates/behavior_log_core/src/extraction.rs
//!
//! The merge policy applied to extractor output. The turn-sequence to
//! raw-fields step itself lives behind the `FieldExtractionService` port;
//! this module owns the pure rules for folding a candidate field set into
//! the current draft.

use std::collections::BTreeSet;

use crate::domain::{FunctionOfBehavior, IncidentFields};
use crate::incident::IncidentPatch;

/// The result of merging extractor output into the current draft fields.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// At least one field gained a new value; the patch holds exactly those.
    Updated(IncidentPatch),
    /// Every candidate value was empty or already present.
    NothingNew,
}

/// The diagnostic the orchestrator reports after an extraction round, so the
/// caller can decide whether to retry, prompt for clarification, or proceed
/// with partial data. An extraction failure is a signal, never a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionSignal {
    Updated,
    NothingNew,
    Failed { reason: String },
}

impl ExtractionSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionSignal::Updated => "updated",
            ExtractionSignal::NothingNew => "nothing_new",
            ExtractionSignal::Failed { .. } => "failed",
        }
    }
}

/// Folds extractor output into a patch against the current draft fields.
///
/// Accumulation is monotonic: an empty or missing candidate value never
/// clobbers a populated field, while a non-empty candidate may overwrite.
/// Functions of behavior merge by set union. Applying the same extraction
/// twice yields `NothingNew` the second time, which keeps the pipeline
/// idempotent regardless of how often the trigger fires.
pub fn merge_into_patch(current: &IncidentFields, extracted: &IncidentFields) -> MergeOutcome {
    let mut patch = IncidentPatch::default();

    patch.antecedent = merged_text(&current.antecedent, &extracted.antecedent);
    patch.behavior = merged_text(&current.behavior, &extracted.behavior);
    patch.consequence = merged_text(&current.consequence, &extracted.consequence);
    patch.incident_type = merged_text(&current.incident_type, &extracted.incident_type);
    patch.location = merged_text(&current.location, &extracted.location);
    patch.intervention = merged_text(&current.intervention, &extracted.intervention);
    patch.notes = merged_text(&current.notes, &extracted.notes);

    let union: BTreeSet<FunctionOfBehavior> = current
        .functions_of_behavior
        .union(&extracted.functions_of_behavior)
        .copied()
        .collect();
    if union != current.functions_of_behavior {
        patch.functions_of_behavior = Some(union);
    }

    if let Some(occurred_on) = extracted.occurred_on {
        if current.occurred_on != Some(occurred_on) {
            patch.occurred_on = Some(occurred_on);
        }
    }
    if let Some(occurred_time) = extracted.occurred_time {
        if current.occurred_time != Some(occurred_time) {
            patch.occurred_time = Some(occurred_time);
        }
    }
    if let Some(duration) = extracted.duration_minutes {
        if current.duration_minutes != Some(duration) {
            patch.duration_minutes = Some(duration);
        }
    }

    if patch.is_empty() {
        MergeOutcome::NothingNew
    } else {
        MergeOutcome::Updated(patch)
    }
}

/// A candidate text value survives only when non-blank and different from
/// what the draft already holds.
fn merged_text(current: &Option<String>, candidate: &Option<String>) -> Option<String> {
    let candidate = candidate.as_deref().map(str::trim).unwrap_or("");
    if candidate.is_empty() {
        return None;
    }
    if current.as_deref() == Some(candidate) {
        return None;
    }
    Some(candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extracted_with_behavior(behavior: &str) -> IncidentFields {
        IncidentFields {
            behavior: Some(behavior.to_string()),
            ..IncidentFields::default()
        }
    }

    #[test]
    fn empty_candidates_never_clobber_populated_fields() {
        let current = IncidentFields {
            behavior: Some("Hit the desk".to_string()),
            location: Some("Math classroom".to_string()),
            ..IncidentFields::default()
        };
        let extracted = IncidentFields {
            behavior: None,
            location: Some("   ".to_string()),
            ..IncidentFields::default()
        };

        match merge_into_patch(&current, &extracted) {
            MergeOutcome::NothingNew => {}
            MergeOutcome::Updated(patch) => panic!("expected NothingNew, got {patch:?}"),
        }
    }

    #[test]
    fn non_empty_candidate_may_overwrite() {
        let current = extracted_with_behavior("Hit the desk");
        let extracted = extracted_with_behavior("Hit the desk repeatedly");

        match merge_into_patch(&current, &extracted) {
            MergeOutcome::Updated(patch) => {
                assert_eq!(patch.behavior.as_deref(), Some("Hit the desk repeatedly"));
            }
            MergeOutcome::NothingNew => panic!("expected an update"),
        }
    }

    #[test]
    fn functions_of_behavior_merge_by_union() {
        let mut current = IncidentFields::default();
        current.functions_of_behavior.insert(FunctionOfBehavior::Escape);

        let mut extracted = IncidentFields::default();
        extracted.functions_of_behavior.insert(FunctionOfBehavior::Escape);
        extracted.functions_of_behavior.insert(FunctionOfBehavior::Attention);

        match merge_into_patch(&current, &extracted) {
            MergeOutcome::Updated(patch) => {
                let union = patch.functions_of_behavior.unwrap();
                assert!(union.contains(&FunctionOfBehavior::Escape));
                assert!(union.contains(&FunctionOfBehavior::Attention));
            }
            MergeOutcome::NothingNew => panic!("expected a union update"),
        }
    }

    #[test]
    fn merging_the_same_extraction_twice_is_nothing_new() {
        let current = IncidentFields::default();
        let extracted = extracted_with_behavior("Hit the desk");

        let applied = match merge_into_patch(&current, &extracted) {
            MergeOutcome::Updated(patch) => IncidentFields {
                behavior: patch.behavior,
                ..current
            },
            MergeOutcome::NothingNew => panic!("first merge must update"),
        };

        match merge_into_patch(&applied, &extracted) {
            MergeOutcome::NothingNew => {}
            MergeOutcome::Updated(patch) => panic!("expected NothingNew, got {patch:?}"),
        }
    }

    #[test]
    fn identical_set_produces_no_patch_entry() {
        let mut current = IncidentFields::default();
        current.functions_of_behavior.insert(FunctionOfBehavior::Sensory);
        let mut extracted = IncidentFields::default();
        extracted.functions_of_behavior.insert(FunctionOfBehavior::Sensory);

        assert!(matches!(
            merge_into_patch(&current, &extracted),
            MergeOutcome::NothingNew
        ));
    }

    #[test]
    fn candidate_dates_and_duration_are_taken_when_new() {
        let current = IncidentFields::default();
        let extracted = IncidentFields {
            occurred_on: Some(chrono::NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()),
            duration_minutes: Some(10),
            ..IncidentFields::default()
        };

        match merge_into_patch(&current, &extracted) {
            MergeOutcome::Updated(patch) => {
                assert!(patch.occurred_on.is_some());
                assert_eq!(patch.duration_minutes, Some(10));
            }
            MergeOutcome::NothingNew => panic!("expected an update"),
        }
    }
}
