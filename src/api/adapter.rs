//! Backend selection and the two generation entry points

use super::{
    AnthropicProvider, ApiError, Backend, CustomProvider, GeminiProvider, GenerationRequest,
    GenerationResult, MiniMaxProvider, OpenAiProvider, ProviderConfig, ProviderKind,
};
use crate::session::{GenerationSession, SessionEvent, SessionEvents, SessionHandle};
use std::sync::Arc;
use tracing::{debug, warn};

/// Build the one client matching the configured provider tag
pub fn build_backend(config: &ProviderConfig) -> Result<Arc<dyn Backend>, ApiError> {
    if config.model.trim().is_empty() {
        return Err(ApiError::Config("No model selected".into()));
    }

    let backend: Arc<dyn Backend> = match config.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)),
        ProviderKind::DeepSeek => Arc::new(OpenAiProvider::deepseek(config)),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config)),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(config)),
        ProviderKind::MiniMax => Arc::new(MiniMaxProvider::new(config)),
        ProviderKind::Custom => Arc::new(CustomProvider::new(config)?),
    };
    debug!(provider = %config.provider, model = %config.model, "Backend initialized");
    Ok(backend)
}

/// Provider-agnostic generation front door.
///
/// Neither entry point returns an error: the synchronous path reports
/// failures in [`GenerationResult::error`] and the streaming path through
/// [`SessionEvent::Failed`].
#[derive(Clone)]
pub struct ProviderAdapter {
    backend: Arc<dyn Backend>,
}

impl ProviderAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self, ApiError> {
        Ok(Self::from_backend(build_backend(config)?))
    }

    pub fn from_backend(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.backend.provider_kind()
    }

    /// Run a generation to completion
    pub async fn generate(&self, input: impl Into<GenerationRequest>) -> GenerationResult {
        let request = input.into();
        let result = GenerationResult::from(self.backend.send_request(&request).await);
        if let Some(error) = &result.error {
            warn!(provider = %self.provider_kind(), "Generation failed: {}", error);
        }
        result
    }

    /// Stream a generation, pushing each event into `callback`
    pub fn generate_stream<F>(&self, input: impl Into<GenerationRequest>, callback: F) -> SessionHandle
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        GenerationSession::spawn_with_callback(self.backend.clone(), input.into(), callback)
    }

    /// Stream a generation, consuming events by pulling
    pub fn open_session(&self, input: impl Into<GenerationRequest>) -> (SessionHandle, SessionEvents) {
        GenerationSession::spawn(self.backend.clone(), input.into())
    }
}
