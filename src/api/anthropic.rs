//! Anthropic Messages API provider
//!
//! System prompts are folded into the first user turn rather than sent as the
//! top-level `system` field, so the same conversation renders identically on
//! every backend without a system role.

use super::normalize::merge_system_into_first_user;
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

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    url: String,
    api_key: String,
    model: String,
    sampling: SamplingParams,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            url: format!("{}/messages", config.base_url_or(ANTHROPIC_BASE_URL)),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            sampling: config.sampling(),
            client: Client::new(),
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> Value {
        let messages: Vec<Value> = merge_system_into_first_user(&request.messages)
            .iter()
            .map(|msg| {
                json!({
                    "role": msg.role.as_str(),
                    "content": msg.content
                })
            })
            .collect();

        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.sampling.max_tokens,
            "temperature": self.sampling.temperature,
            "top_p": self.sampling.top_p,
        })
    }

    fn post(&self) -> reqwest::RequestBuilder {
        self.client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

fn parse_messages_response(json: &Value) -> Result<String, ApiError> {
    if let Some(error) = embedded_error(json) {
        return Err(error);
    }

    json["content"][0]["text"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ApiError::Malformed("response has no content block".to_string()))
}

#[async_trait]
impl ApiProvider for AnthropicProvider {
    async fn send_request(&self, request: &GenerationRequest) -> Result<String, ApiError> {
        let body = self.build_request(request);
        let response = post_json(self.post(), &body).await?;
        let json: Value = response.json().await?;
        parse_messages_response(&json)
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }
}

#[async_trait]
impl StreamingProvider for AnthropicProvider {
    async fn send_streaming(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ApiError> {
        let mut body = self.build_request(request);
        body["stream"] = json!(true);

        open_stream(self.post(), &body, SseFormat::Anthropic, cancel).await
    }
}
