//! Server-Sent Events (SSE) parser for streaming API responses
//!
//! Handles three formats:
//! - OpenAI-compatible (OpenAI, DeepSeek, MiniMax, custom endpoints):
//!   `data: {"choices":[{"delta":{"content":"..."}}]}` ending with `data: [DONE]`
//! - Anthropic: `event: content_block_delta` / `data: {"delta":{"text":"..."}}`
//! - Gemini (`alt=sse`): `data: {"candidates":[{"content":{"parts":[{"text":"..."}]}}]}`
//!
//! Any of them may carry an error object instead of a delta, and MiniMax
//! additionally reports failures through a `base_resp` envelope with HTTP 200.

use super::streaming::StreamChunk;
use super::{embedded_error, post_json, ApiError};
use futures_util::{Stream, StreamExt};
use reqwest::RequestBuilder;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The format of SSE events from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseFormat {
    /// OpenAI chat-completions format
    OpenAi,
    /// Anthropic format with event types
    Anthropic,
    /// Gemini `streamGenerateContent` with `alt=sse`
    Gemini,
}

/// Splits a byte stream into lines.
///
/// Bytes are held until a newline arrives, so a multi-byte character split
/// across two network reads is decoded intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline_pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline_pos).collect();
            lines.push(decode_line(&line[..newline_pos]));
        }
        lines
    }

    /// Take whatever is left after the stream ended without a newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

/// Parse a single SSE line into a StreamChunk.
/// Returns None if the line should be skipped (comments, empty lines, event types).
pub fn parse_sse_line(line: &str, format: SseFormat) -> Option<StreamChunk> {
    let line = line.trim();

    // Skip empty lines, SSE comments and event names
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim_start();

    if format == SseFormat::OpenAi && data == "[DONE]" {
        return Some(StreamChunk::Done);
    }

    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return Some(StreamChunk::Error(ApiError::Malformed(format!(
                "JSON parse error: {}",
                e
            ))))
        }
    };

    match format {
        SseFormat::OpenAi => parse_openai_event(&json),
        SseFormat::Anthropic => parse_anthropic_event(&json),
        SseFormat::Gemini => parse_gemini_event(&json),
    }
}

fn parse_openai_event(json: &Value) -> Option<StreamChunk> {
    if let Some(error) = embedded_error(json) {
        return Some(StreamChunk::Error(error));
    }

    json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|content| !content.is_empty())
        .map(|content| StreamChunk::TextDelta(content.to_string()))
}

fn parse_anthropic_event(json: &Value) -> Option<StreamChunk> {
    match json["type"].as_str().unwrap_or("") {
        "content_block_delta" => json["delta"]["text"]
            .as_str()
            .filter(|text| !text.is_empty())
            .map(|text| StreamChunk::TextDelta(text.to_string())),
        "message_stop" => Some(StreamChunk::Done),
        "error" => {
            let message = json["error"]["message"].as_str().unwrap_or("Unknown error");
            Some(StreamChunk::Error(ApiError::Provider {
                code: 0,
                message: message.to_string(),
            }))
        }
        _ => None,
    }
}

fn parse_gemini_event(json: &Value) -> Option<StreamChunk> {
    if let Some(error) = embedded_error(json) {
        return Some(StreamChunk::Error(error));
    }

    if let Some(reason) = json["promptFeedback"]["blockReason"].as_str() {
        return Some(StreamChunk::Error(ApiError::Provider {
            code: 0,
            message: format!("Prompt blocked: {}", reason),
        }));
    }

    let text = gemini_text(json);
    if text.is_empty() {
        None
    } else {
        Some(StreamChunk::TextDelta(text))
    }
}

/// Concatenate the text parts of the first candidate
pub(crate) fn gemini_text(json: &Value) -> String {
    json["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Consume a response body on a background task, forwarding parsed chunks.
///
/// The token is checked before every chunk is forwarded, so nothing reaches
/// the receiver after cancellation even if the transport needs one more read
/// to close.
pub fn spawn_reader<S, B, E>(
    body: S,
    format: SseFormat,
    cancel: CancellationToken,
) -> mpsc::Receiver<StreamChunk>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut body = Box::pin(body);
        let mut buffer = LineBuffer::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    for line in buffer.push(bytes.as_ref()) {
                        if !forward(&tx, &cancel, &line, format).await {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let message = e.to_string();
                    if !cancel.is_cancelled() {
                        let _ = tx
                            .send(StreamChunk::Error(ApiError::Stream(message)))
                            .await;
                    }
                    return;
                }
                None => {
                    if let Some(line) = buffer.finish() {
                        if !forward(&tx, &cancel, &line, format).await {
                            return;
                        }
                    }
                    // If stream ends without a terminator, it still completed
                    if !cancel.is_cancelled() {
                        let _ = tx.send(StreamChunk::Done).await;
                    }
                    return;
                }
            }
        }
    });

    rx
}

/// Forward one line; false means the reader must stop
async fn forward(
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    line: &str,
    format: SseFormat,
) -> bool {
    let Some(chunk) = parse_sse_line(line, format) else {
        return true;
    };
    if cancel.is_cancelled() {
        return false;
    }

    let terminal = chunk.is_terminal();
    if tx.send(chunk).await.is_err() {
        return false; // Receiver dropped
    }
    !terminal
}

/// POST a streaming request and hand the body to [`spawn_reader`]
pub(crate) async fn open_stream(
    builder: RequestBuilder,
    body: &Value,
    format: SseFormat,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<StreamChunk>, ApiError> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ApiError::Aborted),
        response = post_json(builder, body) => response?,
    };

    Ok(spawn_reader(response.bytes_stream(), format, cancel))
}
