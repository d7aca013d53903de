//! Presentation sink capability
//!
//! The registry pushes every task change to a sink that owns the actual
//! surface (a window, a terminal pane). When no sink is configured, or a push
//! fails, the content and title still reach a plain fallback callback so a
//! generation is never silently lost.

use super::GenerationTask;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Presentation surface unavailable: {0}")]
    Unavailable(String),

    #[error("No surface for fragment {0}")]
    UnknownSurface(String),
}

#[async_trait]
pub trait PresentationSink: Send + Sync {
    /// Instantiate a surface showing the task
    async fn create(&self, task: &GenerationTask) -> Result<(), SinkError>;

    /// Push new content/title/flags to the surface for `task.id`
    async fn update(&self, task: &GenerationTask) -> Result<(), SinkError>;

    /// Tear down the surface for a dismissed fragment
    async fn close(&self, id: &str) -> Result<(), SinkError>;
}

/// Receives `(content, title)` when the sink cannot
pub type Fallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
