use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The user-visible error envelope: `{error: {message, type}, proxy_note}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ErrorPayload {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                message: message.into(),
                error_type: error_type.into(),
            },
            proxy_note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.proxy_note = Some(note.into());
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        // Serialization of this shape cannot fail.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Attach a proxy note to an upstream body relayed verbatim. Falls back
    /// to wrapping the raw text when the body is not a JSON object.
    pub fn annotate_upstream(body: &[u8], note: &str) -> Bytes {
        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.insert(
                    "proxy_note".to_string(),
                    serde_json::Value::String(note.to_string()),
                );
                Bytes::from(serde_json::to_vec(&map).unwrap_or_default())
            }
            _ => {
                let text = String::from_utf8_lossy(body).into_owned();
                ErrorPayload::new("upstream_error", text)
                    .with_note(note)
                    .to_bytes()
            }
        }
    }
}
