//! Conversation rebuild from stored generation parameters

use super::{GenerationKind, GenerationParams};
use crate::api::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("Rewrite requires an instruction")]
    MissingRewriteInstruction,

    #[error("Chapter {0} has no outline; write one before expanding")]
    MissingOutline(String),

    #[error("Manuscript not found: book {book_id}, chapter {chapter_id}")]
    NotFound { book_id: String, chapter_id: String },

    #[error("Manuscript source error: {0}")]
    Source(String),
}

/// Builds the conversation sent for a fragment.
///
/// Called on every start and regeneration; implementations must not cache
/// the result.
#[async_trait]
pub trait ConversationBuilder: Send + Sync {
    async fn build(&self, params: &GenerationParams) -> Result<Vec<ChatMessage>, PromptError>;
}

/// Current state of the manuscript around a selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManuscriptContext {
    pub book_title: String,
    #[serde(default)]
    pub settings: Option<String>,
    #[serde(default)]
    pub chapter_outline: Option<String>,
    #[serde(default)]
    pub chapter_text: String,
}

#[async_trait]
pub trait ManuscriptSource: Send + Sync {
    async fn context(&self, book_id: &str, chapter_id: &str)
        -> Result<ManuscriptContext, PromptError>;
}

/// Manuscript source backed by a single in-memory context
#[derive(Debug, Default)]
pub struct StaticManuscript {
    context: RwLock<ManuscriptContext>,
}

impl StaticManuscript {
    pub fn new(context: ManuscriptContext) -> Self {
        Self {
            context: RwLock::new(context),
        }
    }

    /// Swap in a newer version of the manuscript
    pub fn replace(&self, context: ManuscriptContext) {
        if let Ok(mut current) = self.context.write() {
            *current = context;
        }
    }
}

#[async_trait]
impl ManuscriptSource for StaticManuscript {
    async fn context(
        &self,
        _book_id: &str,
        _chapter_id: &str,
    ) -> Result<ManuscriptContext, PromptError> {
        self.context
            .read()
            .map(|context| context.clone())
            .map_err(|e| PromptError::Source(e.to_string()))
    }
}

/// Default builder: a system turn describing the manuscript followed by a
/// user turn with the operation and the selected passage
pub struct InstructionBuilder<S> {
    source: S,
}

impl<S: ManuscriptSource> InstructionBuilder<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

fn system_prompt(context: &ManuscriptContext) -> String {
    let mut sections = vec![format!(
        "You are a fiction editor working on the novel \"{}\".",
        context.book_title
    )];
    if let Some(settings) = context.settings.as_deref().filter(|s| !s.is_empty()) {
        sections.push(format!("Story settings:\n{}", settings));
    }
    if let Some(outline) = context.chapter_outline.as_deref().filter(|s| !s.is_empty()) {
        sections.push(format!("Chapter outline:\n{}", outline));
    }
    if !context.chapter_text.is_empty() {
        sections.push(format!("Current chapter:\n{}", context.chapter_text));
    }
    sections.join("\n\n")
}

fn instruction(params: &GenerationParams) -> Result<String, PromptError> {
    let instruction = match params.kind {
        GenerationKind::Expand => {
            "Expand the passage below with richer detail, keeping its voice and following the chapter outline.".to_string()
        }
        GenerationKind::Condense => {
            "Condense the passage below, keeping every plot point and the author's voice.".to_string()
        }
        GenerationKind::Rewrite => {
            let prompt = params
                .rewrite_prompt
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or(PromptError::MissingRewriteInstruction)?;
            format!("Rewrite the passage below. Instruction: {}", prompt)
        }
    };
    Ok(format!("{}\n\nPassage:\n{}", instruction, params.selected_text))
}

#[async_trait]
impl<S: ManuscriptSource> ConversationBuilder for InstructionBuilder<S> {
    async fn build(&self, params: &GenerationParams) -> Result<Vec<ChatMessage>, PromptError> {
        let user = instruction(params)?;
        let context = self
            .source
            .context(&params.book_id, &params.chapter_id)
            .await?;

        let has_outline = context
            .chapter_outline
            .as_deref()
            .map(|o| !o.trim().is_empty())
            .unwrap_or(false);
        if params.kind == GenerationKind::Expand && !has_outline {
            return Err(PromptError::MissingOutline(params.chapter_id.clone()));
        }

        Ok(vec![
            ChatMessage::system(system_prompt(&context)),
            ChatMessage::user(user),
        ])
    }
}
