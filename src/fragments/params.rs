//! Parameters a fragment is (re)generated from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The editing operation that produced a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Expand,
    Condense,
    Rewrite,
}

impl GenerationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationKind::Expand => "expand",
            GenerationKind::Condense => "condense",
            GenerationKind::Rewrite => "rewrite",
        }
    }

    /// Title shown on the fragment's surface
    pub fn title(&self) -> &'static str {
        match self {
            GenerationKind::Expand => "Expanded passage",
            GenerationKind::Condense => "Condensed passage",
            GenerationKind::Rewrite => "Rewritten passage",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "expand" => Ok(GenerationKind::Expand),
            "condense" => Ok(GenerationKind::Condense),
            "rewrite" => Ok(GenerationKind::Rewrite),
            other => Err(format!("Unknown generation kind: {}", other)),
        }
    }
}

/// Source parameters stored per fragment.
///
/// The conversation is rebuilt from these on every regeneration, so any
/// manuscript context they point at is read fresh each time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    #[serde(rename = "type")]
    pub kind: GenerationKind,
    pub selected_text: String,
    pub chapter_id: String,
    pub book_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_prompt: Option<String>,
}

impl GenerationParams {
    pub fn new(
        kind: GenerationKind,
        selected_text: impl Into<String>,
        book_id: impl Into<String>,
        chapter_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            selected_text: selected_text.into(),
            chapter_id: chapter_id.into(),
            book_id: book_id.into(),
            rewrite_prompt: None,
        }
    }

    pub fn with_rewrite_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.rewrite_prompt = Some(prompt.into());
        self
    }

    pub fn title(&self) -> &'static str {
        self.kind.title()
    }
}
