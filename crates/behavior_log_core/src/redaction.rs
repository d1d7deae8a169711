//! crates/behavior_log_core/src/redaction.rs
//!
//! Strips student-identifying names from free text. Every case-insensitive,
//! whole-word occurrence of an identifier is replaced with the fixed
//! `[Student]` placeholder. Matching is literal (identifiers are escaped, not
//! interpreted as patterns), single-pass, non-overlapping, and leftmost-first.

use regex::Regex;

/// The fixed token substituted for every matched identifier.
pub const REDACTION_PLACEHOLDER: &str = "[Student]";

/// An error while building the redaction pattern. Should not occur for any
/// identifier list that survives normalization, but is surfaced rather than
/// panicking in the caller.
#[derive(Debug, thiserror::Error)]
pub enum RedactionError {
    #[error("Failed to build redaction pattern: {0}")]
    Pattern(String),
}

/// Replaces every whole-word, case-insensitive occurrence of any identifier
/// in `text` with [`REDACTION_PLACEHOLDER`].
///
/// Identifiers are trimmed; whitespace-only entries are ignored and
/// duplicates (case-insensitive) are collapsed. Longer identifiers take
/// precedence over their prefixes, so "Emma Smith" is consumed before "Emma"
/// can match inside it. An empty `text` or an empty identifier list is a
/// no-op. Text that already contains the placeholder passes through
/// unchanged, which makes the function idempotent.
pub fn redact(text: &str, identifiers: &[String]) -> Result<String, RedactionError> {
    if text.is_empty() {
        return Ok(text.to_string());
    }

    let mut seen_lowercase: Vec<String> = Vec::new();
    let mut cleaned: Vec<&str> = Vec::new();
    for identifier in identifiers {
        let trimmed = identifier.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lowered = trimmed.to_lowercase();
        if seen_lowercase.contains(&lowered) {
            continue;
        }
        seen_lowercase.push(lowered);
        cleaned.push(trimmed);
    }
    if cleaned.is_empty() {
        return Ok(text.to_string());
    }

    // Longest first, so a full name is consumed before its parts.
    cleaned.sort_by(|a, b| b.len().cmp(&a.len()));

    let alternatives = cleaned
        .iter()
        .map(|identifier| bounded_literal(identifier))
        .collect::<Vec<_>>()
        .join("|");

    // The placeholder itself is the first alternative and is passed through
    // untouched, so re-running redaction over its own output is stable even
    // when an identifier happens to spell "Student".
    let pattern = format!(r"\[Student\]|(?i:{})", alternatives);
    let matcher =
        Regex::new(&pattern).map_err(|e| RedactionError::Pattern(e.to_string()))?;

    let redacted = matcher.replace_all(text, |caps: &regex::Captures<'_>| {
        let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if matched == REDACTION_PLACEHOLDER {
            matched.to_string()
        } else {
            REDACTION_PLACEHOLDER.to_string()
        }
    });

    Ok(redacted.into_owned())
}

/// Escapes an identifier for literal matching and anchors it with `\b` on
/// each side whose edge character is a word character. An edge that is
/// already a non-word character (a period, a parenthesis) needs no boundary
/// assertion, and `\b` would reject valid matches there.
fn bounded_literal(identifier: &str) -> String {
    let escaped = regex::escape(identifier);
    let starts_word = identifier
        .chars()
        .next()
        .map(|c| c.is_alphanumeric() || c == '_')
        .unwrap_or(false);
    let ends_word = identifier
        .chars()
        .last()
        .map(|c| c.is_alphanumeric() || c == '_')
        .unwrap_or(false);

    match (starts_word, ends_word) {
        (true, true) => format!(r"\b{}\b", escaped),
        (true, false) => format!(r"\b{}", escaped),
        (false, true) => format!(r"{}\b", escaped),
        (false, false) => escaped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn replaces_whole_words_case_insensitively() {
        let out = redact("emma pushed EMMA's chair", &ids(&["Emma"])).unwrap();
        assert_eq!(out, "[Student] pushed [Student]'s chair");
    }

    #[test]
    fn does_not_match_inside_longer_words() {
        let out = redact("Emma hit Emmaline", &ids(&["Emma"])).unwrap();
        assert_eq!(out, "[Student] hit Emmaline");
    }

    #[test]
    fn empty_identifier_list_is_a_no_op() {
        let out = redact("Emma hit the desk", &[]).unwrap();
        assert_eq!(out, "Emma hit the desk");
    }

    #[test]
    fn empty_text_is_a_no_op() {
        let out = redact("", &ids(&["Emma"])).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn whitespace_only_identifiers_are_ignored() {
        let out = redact("Emma hit the desk", &ids(&["   ", "\t"])).unwrap();
        assert_eq!(out, "Emma hit the desk");
    }

    #[test]
    fn duplicate_identifiers_are_collapsed() {
        let out = redact("Emma and Emma", &ids(&["Emma", "emma", "EMMA"])).unwrap();
        assert_eq!(out, "[Student] and [Student]");
    }

    #[test]
    fn full_name_wins_over_its_parts() {
        let out = redact(
            "Emma Smith spoke while Emma listened",
            &ids(&["Emma", "Emma Smith"]),
        )
        .unwrap();
        assert_eq!(out, "[Student] spoke while [Student] listened");
    }

    #[test]
    fn special_characters_match_literally() {
        let out = redact("Talked with J.R. after lunch", &ids(&["J.R."])).unwrap();
        assert_eq!(out, "Talked with [Student] after lunch");
        // A period in the identifier must not act as a wildcard.
        let out = redact("JxRx stayed calm", &ids(&["J.R."])).unwrap();
        assert_eq!(out, "JxRx stayed calm");
    }

    #[test]
    fn idempotent_on_its_own_output() {
        let identifiers = ids(&["Emma", "Emma Smith"]);
        let once = redact("Emma Smith shoved Emma's desk", &identifiers).unwrap();
        let twice = redact(&once, &identifiers).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn idempotent_when_identifier_spells_the_placeholder_word() {
        let identifiers = ids(&["Student"]);
        let once = redact("Student left the room", &identifiers).unwrap();
        assert_eq!(once, "[Student] left the room");
        let twice = redact(&once, &identifiers).unwrap();
        assert_eq!(once, twice);
    }
}
