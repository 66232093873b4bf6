//! Streamed reply fragments.

use serde_json::Value;

/// One content part of a structured event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentPart {
    /// Text carried by the part, if any.
    pub text: Option<String>,
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

/// One unit of a streamed reply, decoded once at the stream boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// Structured event exposing content parts.
    TextEvent { parts: Vec<ContentPart> },
    /// Plain text chunk.
    RawText(String),
    /// Any other event kind; skipped during aggregation.
    Unknown(Value),
}

impl Fragment {
    /// Decode a JSON event.
    ///
    /// An object with a `content.parts` array becomes [`Fragment::TextEvent`],
    /// a JSON string becomes [`Fragment::RawText`], anything else is
    /// [`Fragment::Unknown`].
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => Self::RawText(text),
            Value::Object(map) => {
                let parts: Option<Vec<ContentPart>> = map
                    .get("content")
                    .and_then(|content| content.get("parts"))
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .map(|part| ContentPart {
                                text: part.get("text").and_then(Value::as_str).map(str::to_string),
                            })
                            .collect()
                    });
                match parts {
                    Some(parts) => Self::TextEvent { parts },
                    None => Self::Unknown(Value::Object(map)),
                }
            }
            other => Self::Unknown(other),
        }
    }

    /// Convenience constructor for a single-part text event.
    #[must_use]
    pub fn text_event(text: impl Into<String>) -> Self {
        Self::TextEvent {
            parts: vec![ContentPart::text(text)],
        }
    }
}
