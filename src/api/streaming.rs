//! Streaming response support for API providers

use super::{ApiError, GenerationRequest};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A chunk of a streaming response, normalized across backends
#[derive(Debug)]
pub enum StreamChunk {
    /// A text delta (partial content)
    TextDelta(String),
    /// The backend signalled end of stream
    Done,
    /// An error occurred during streaming; nothing follows it
    Error(ApiError),
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::TextDelta(_))
    }
}

/// Trait for providers that support streaming responses
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    /// Send a request and return a channel of streaming chunks.
    ///
    /// The receiver yields `TextDelta` chunks in arrival order followed by
    /// exactly one `Done` or `Error`. Once `cancel` fires no further chunk
    /// is sent and the channel simply closes.
    async fn send_streaming(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ApiError>;
}
