//! Draftsmith - streaming text generation for manuscript editing
//!
//! This library drives chat-completion backends for inline editing tools:
//! a selected passage is expanded, condensed or rewritten, and the result is
//! streamed into a presentation surface while the user can stop it,
//! regenerate it or dismiss it.
//!
//! ## Key Features
//!
//! - **Provider Adapter**: One entry point over OpenAI, Anthropic, Gemini,
//!   DeepSeek, MiniMax and custom OpenAI-compatible endpoints
//! - **Generation Sessions**: Cancellable streams with a single terminal
//!   outcome per session
//! - **Fragment Registry**: Start, stop, stop-all and regenerate concurrent
//!   generations, each pushed to a presentation sink as it changes

pub mod api;
pub mod config;
pub mod fragments;
pub mod session;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use api::{
    ApiError, ChatMessage, GenerationRequest, GenerationResult, ProviderAdapter, ProviderConfig,
    ProviderKind,
};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use fragments::{
    FragmentId, FragmentRegistry, GenerationKind, GenerationParams, GenerationTask,
    RegistryError, StopOutcome,
};
pub use session::{GenerationSession, SessionEvent, SessionHandle, SessionState};
pub use terminal::TerminalSink;
