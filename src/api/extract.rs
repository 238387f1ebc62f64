//! Field extraction for the service's small JSON response bodies.
//!
//! A body that parses as a JSON object is read structurally, looking only at the
//! requested top-level fields. Bodies that do not parse fall back to marker
//! search: the value of `field` spans from just after the first `"field":` to the
//! next requested marker, or to the last `}` for the final field. A quoted span
//! has its wrapping quotes removed; escapes are left as they are on that path.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("field `{0}` not found in response")]
    FieldNotFound(String),

    #[error("field `{0}` has an empty value span")]
    MalformedSpan(String),
}

/// Response of `/api/transcribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionResult {
    pub text: String,
}

impl TranscriptionResult {
    pub fn parse(body: &str) -> Result<Self, ExtractError> {
        let text = extract_field(body, "text")?;
        Ok(Self { text })
    }
}

/// Response of `/api/speech-to-answer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerResult {
    pub transcription: String,
    pub answer: String,
}

impl AnswerResult {
    /// Both fields or an error; never one half.
    pub fn parse(body: &str) -> Result<Self, ExtractError> {
        let [transcription, answer] = extract_fields(body, ["transcription", "answer"])?;
        Ok(Self {
            transcription,
            answer,
        })
    }
}

pub fn extract_field(body: &str, field: &str) -> Result<String, ExtractError> {
    let [value] = extract_fields(body, [field])?;
    Ok(value)
}

/// Extract `fields` in the order the endpoint documents them.
pub fn extract_fields<const N: usize>(
    body: &str,
    fields: [&str; N],
) -> Result<[String; N], ExtractError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => {
            let mut values = Vec::with_capacity(N);
            for field in fields {
                let value = match map.get(field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Err(ExtractError::FieldNotFound(field.to_string())),
                };
                values.push(value);
            }
            Ok(into_array(values))
        }
        _ => {
            tracing::debug!("Response is not a JSON object, falling back to marker search");
            extract_by_markers(body, fields)
        }
    }
}

fn extract_by_markers<const N: usize>(
    body: &str,
    fields: [&str; N],
) -> Result<[String; N], ExtractError> {
    let mut values = Vec::with_capacity(N);

    for (i, field) in fields.iter().enumerate() {
        let marker = format!("\"{}\":", field);
        let start = body
            .find(&marker)
            .map(|idx| idx + marker.len())
            .ok_or_else(|| ExtractError::FieldNotFound(field.to_string()))?;

        let end = match fields.get(i + 1) {
            Some(next) => {
                let next_marker = format!("\"{}\":", next);
                body[start..]
                    .find(&next_marker)
                    .map(|idx| start + idx)
                    .ok_or_else(|| ExtractError::FieldNotFound(next.to_string()))?
            }
            None => body
                .rfind('}')
                .ok_or_else(|| ExtractError::MalformedSpan(field.to_string()))?,
        };

        if end <= start {
            return Err(ExtractError::MalformedSpan(field.to_string()));
        }

        let mut span = body[start..end].trim();
        if i + 1 < N {
            span = span.strip_suffix(',').unwrap_or(span).trim_end();
        }
        values.push(strip_quotes(span).to_string());
    }

    Ok(into_array(values))
}

fn strip_quotes(span: &str) -> &str {
    if span.len() >= 2 && span.starts_with('"') && span.ends_with('"') {
        &span[1..span.len() - 1]
    } else {
        span
    }
}

fn into_array<const N: usize>(values: Vec<String>) -> [String; N] {
    let mut iter = values.into_iter();
    std::array::from_fn(|_| iter.next().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trips() {
        for s in ["", "hello", "what is X", "привет мир", "a,b:c", "tabs\tand spaces "] {
            let body = serde_json::json!({ "text": s }).to_string();
            assert_eq!(extract_field(&body, "text").unwrap(), s);
        }
    }

    #[test]
    fn combined_answer_scenario() {
        let body = r#"{"transcription":"what is X","answer":"X is Y"}"#;
        let result = AnswerResult::parse(body).unwrap();
        assert_eq!(result.transcription, "what is X");
        assert_eq!(result.answer, "X is Y");
    }

    #[test]
    fn structural_path_decodes_escapes_and_any_order() {
        let body = r#"{"answer":"say \"hi\"","transcription":"line\nbreak"}"#;
        let result = AnswerResult::parse(body).unwrap();
        assert_eq!(result.transcription, "line\nbreak");
        assert_eq!(result.answer, "say \"hi\"");
    }

    #[test]
    fn missing_field_is_reported() {
        assert_eq!(
            TranscriptionResult::parse(r#"{"detail":"bad file"}"#),
            Err(ExtractError::FieldNotFound("text".to_string()))
        );
        assert_eq!(
            AnswerResult::parse(r#"{"transcription":"only half"}"#),
            Err(ExtractError::FieldNotFound("answer".to_string()))
        );
    }

    #[test]
    fn non_string_values_are_rendered() {
        assert_eq!(extract_field(r#"{"text": 42}"#, "text").unwrap(), "42");
    }

    #[test]
    fn marker_fallback_for_non_json_bodies() {
        // Trailing garbage after the object makes this invalid JSON.
        let body = r#"{"text": "hello there"} ok"#;
        assert_eq!(extract_field(body, "text").unwrap(), "hello there");
    }

    #[test]
    fn marker_fallback_splits_pairs() {
        let body = r#"{"transcription": "what is X" , "answer": "X is Y" trailing}"#;
        let result = AnswerResult::parse(body).unwrap();
        assert_eq!(result.transcription, "what is X");
        assert_eq!(result.answer, "\"X is Y\" trailing");
    }

    #[test]
    fn marker_fallback_unquoted_value() {
        let body = "{\"text\": plain words}";
        assert_eq!(extract_field(body, "text").unwrap(), "plain words");
    }

    #[test]
    fn empty_span_is_malformed() {
        assert_eq!(
            extract_field("{\"text\":}", "text"),
            Err(ExtractError::MalformedSpan("text".to_string()))
        );
        assert_eq!(
            extract_field("\"text\": no closing brace", "text"),
            Err(ExtractError::MalformedSpan("text".to_string()))
        );
    }

    #[test]
    fn marker_fallback_missing_field() {
        assert_eq!(
            extract_field("not json at all", "text"),
            Err(ExtractError::FieldNotFound("text".to_string()))
        );
    }
}
