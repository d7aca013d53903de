//! Fragment identity and the per-fragment task record

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a fragment, independent of any single attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(String);

impl FragmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh id of the form `streaming-<unix millis>-<9 chars>`
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!(
            "streaming-{}-{}",
            Utc::now().timestamp_millis(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FragmentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for FragmentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What the presentation surface shows for one fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub id: FragmentId,
    pub title: String,
    /// Generated text accumulated for the current attempt
    pub content: String,
    pub is_generating: bool,
    /// Set when the user stopped the attempt; cleared on restart
    pub was_stopped: bool,
    /// Failure message of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether regeneration parameters are stored for this fragment
    pub has_params: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationTask {
    /// A task whose first attempt is starting
    pub fn new(id: FragmentId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            content: String::new(),
            is_generating: true,
            was_stopped: false,
            error: None,
            has_params: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reset for a new attempt under the same id
    pub fn restart(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.content.clear();
        self.is_generating = true;
        self.was_stopped = false;
        self.error = None;
        self.touch();
    }

    pub fn append(&mut self, text: &str) {
        self.content.push_str(text);
        self.touch();
    }

    pub fn complete(&mut self) {
        self.is_generating = false;
        self.touch();
    }

    pub fn mark_stopped(&mut self) {
        self.is_generating = false;
        self.was_stopped = true;
        self.touch();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.is_generating = false;
        self.error = Some(message.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
