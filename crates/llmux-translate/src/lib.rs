pub mod request;
pub mod response;
pub mod stream;
pub mod tokens;

use llmux_common::Dialect;

/// Failures inside the pure translation layer. `Unsupported` marks a pair
/// the dialect tables do not cover; `Schema` is a validation failure on the
/// inbound body and surfaces as a 400.
#[derive(Debug, Clone, PartialEq)]
pub enum TranslateError {
    Unsupported { from: Dialect, to: Dialect },
    Schema(String),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::Unsupported { from, to } => {
                write!(f, "no translation from {from} to {to}")
            }
            TranslateError::Schema(message) => write!(f, "invalid request body: {message}"),
        }
    }
}

impl std::error::Error for TranslateError {}
