//! API response structures

use serde::{Deserialize, Serialize};

use super::ApiError;

/// Outcome of a non-streaming generation.
///
/// Failures never escape the generation entry point: they land in `error`
/// and `text` is left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// The generated content
    pub text: String,
    /// Description of the failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(error: &ApiError) -> Self {
        Self {
            text: String::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl From<Result<String, ApiError>> for GenerationResult {
    fn from(result: Result<String, ApiError>) -> Self {
        match result {
            Ok(text) if text.is_empty() => Self::failed(&ApiError::EmptyResponse),
            Ok(text) => Self::ok(text),
            Err(e) => Self::failed(&e),
        }
    }
}
