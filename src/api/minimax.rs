//! MiniMax provider
//!
//! OpenAI-shaped wire format, but failures can arrive with HTTP 200 inside a
//! `base_resp` envelope, and older models answer with a top-level `reply`.

use super::openai::{chat_body, parse_chat_response};
use super::sse::{open_stream, SseFormat};
use super::streaming::{StreamChunk, StreamingProvider};
use super::{
    embedded_error, post_json, ApiError, ApiProvider, GenerationRequest, ProviderConfig,
    ProviderKind, SamplingParams,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MINIMAX_BASE_URL: &str = "https://api.minimaxi.com/v1";

pub struct MiniMaxProvider {
    url: String,
    api_key: String,
    model: String,
    sampling: SamplingParams,
    client: Client,
}

impl MiniMaxProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            url: format!(
                "{}/chat/completions",
                config.base_url_or(MINIMAX_BASE_URL)
            ),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            sampling: config.sampling(),
            client: Client::new(),
        }
    }

    fn post(&self) -> reqwest::RequestBuilder {
        self.client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

fn parse_minimax_response(json: &Value) -> Result<String, ApiError> {
    if let Some(error) = embedded_error(json) {
        return Err(error);
    }

    let has_choices = json["choices"]
        .as_array()
        .map(|choices| !choices.is_empty())
        .unwrap_or(false);
    if !has_choices {
        return json["reply"]
            .as_str()
            .map(str::to_string)
            .ok_or(ApiError::EmptyResponse);
    }

    parse_chat_response(json)
}

#[async_trait]
impl ApiProvider for MiniMaxProvider {
    async fn send_request(&self, request: &GenerationRequest) -> Result<String, ApiError> {
        let body = chat_body(&self.model, &request.messages, self.sampling);
        let response = post_json(self.post(), &body).await?;
        let json: Value = response.json().await?;
        parse_minimax_response(&json)
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::MiniMax
    }
}

#[async_trait]
impl StreamingProvider for MiniMaxProvider {
    async fn send_streaming(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ApiError> {
        let mut body = chat_body(&self.model, &request.messages, self.sampling);
        body["stream"] = json!(true);

        open_stream(self.post(), &body, SseFormat::OpenAi, cancel).await
    }
}
