//! OpenAI chat-completions provider, also used for DeepSeek

use super::sse::{open_stream, SseFormat};
use super::streaming::{StreamChunk, StreamingProvider};
use super::{
    embedded_error, post_json, ApiError, ApiProvider, ChatMessage, GenerationRequest,
    ProviderConfig, ProviderKind, SamplingParams,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// Build a chat-completions request body
pub(crate) fn chat_body(model: &str, messages: &[ChatMessage], sampling: SamplingParams) -> Value {
    let messages: Vec<Value> = messages
        .iter()
        .map(|msg| {
            json!({
                "role": msg.role.as_str(),
                "content": msg.content
            })
        })
        .collect();

    json!({
        "model": model,
        "messages": messages,
        "temperature": sampling.temperature,
        "max_tokens": sampling.max_tokens,
        "top_p": sampling.top_p,
    })
}

/// Extract the generated text from a non-streaming chat-completions body
pub(crate) fn parse_chat_response(json: &Value) -> Result<String, ApiError> {
    if let Some(error) = embedded_error(json) {
        return Err(error);
    }

    let choices = json["choices"]
        .as_array()
        .filter(|choices| !choices.is_empty())
        .ok_or_else(|| ApiError::Malformed("response has no choices".to_string()))?;

    Ok(choices[0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string())
}

/// Provider speaking the OpenAI chat-completions protocol
pub struct OpenAiProvider {
    kind: ProviderKind,
    url: String,
    api_key: String,
    model: String,
    sampling: SamplingParams,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self::with_base(config, ProviderKind::OpenAi, OPENAI_BASE_URL)
    }

    /// DeepSeek exposes the same protocol on its own host
    pub fn deepseek(config: &ProviderConfig) -> Self {
        Self::with_base(config, ProviderKind::DeepSeek, DEEPSEEK_BASE_URL)
    }

    fn with_base(config: &ProviderConfig, kind: ProviderKind, default_base: &str) -> Self {
        Self {
            kind,
            url: format!("{}/chat/completions", config.base_url_or(default_base)),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            sampling: config.sampling(),
            client: Client::new(),
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> Value {
        chat_body(&self.model, &request.messages, self.sampling)
    }

    fn post(&self) -> reqwest::RequestBuilder {
        self.client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

#[async_trait]
impl ApiProvider for OpenAiProvider {
    async fn send_request(&self, request: &GenerationRequest) -> Result<String, ApiError> {
        let body = self.build_request(request);
        let response = post_json(self.post(), &body).await?;
        let json: Value = response.json().await?;
        parse_chat_response(&json)
    }

    fn provider_kind(&self) -> ProviderKind {
        self.kind
    }
}

#[async_trait]
impl StreamingProvider for OpenAiProvider {
    async fn send_streaming(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ApiError> {
        let mut body = self.build_request(request);
        body["stream"] = json!(true);

        open_stream(self.post(), &body, SseFormat::OpenAi, cancel).await
    }
}
