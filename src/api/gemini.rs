//! Google Gemini provider
//!
//! Gemini names the assistant role `model`, takes system prompts through
//! `systemInstruction`, and rejects histories that open with a model turn.
//! The final non-system message is always sent as the new user turn.

use super::normalize::{repair_history, system_text};
use super::sse::{gemini_text, open_stream, SseFormat};
use super::streaming::{StreamChunk, StreamingProvider};
use super::{
    embedded_error, post_json, ApiError, ApiProvider, GenerationRequest, ProviderConfig,
    ProviderKind, Role, SamplingParams,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    base_url: String,
    api_key: String,
    model: String,
    sampling: SamplingParams,
    client: Client,
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        _ => "user",
    }
}

fn content(role: &'static str, text: &str) -> Value {
    json!({
        "role": role,
        "parts": [{"text": text}]
    })
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url_or(GEMINI_BASE_URL).to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            sampling: config.sampling(),
            client: Client::new(),
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> Result<Value, ApiError> {
        let mut turns: Vec<(&'static str, &str)> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| (gemini_role(m.role), m.content.as_str()))
            .collect();

        let (_, last) = turns
            .pop()
            .ok_or_else(|| ApiError::Config("Conversation has no message to send".into()))?;

        let history = repair_history(turns, |(role, _)| *role == "user");
        let mut contents: Vec<Value> = history
            .into_iter()
            .map(|(role, text)| content(role, text))
            .collect();
        contents.push(content("user", last));

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": self.sampling.temperature,
                "maxOutputTokens": self.sampling.max_tokens,
                "topP": self.sampling.top_p,
            }
        });

        if let Some(system) = system_text(&request.messages) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        Ok(body)
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
    }

    fn generate_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }
}

fn parse_generate_response(json: &Value) -> Result<String, ApiError> {
    if let Some(error) = embedded_error(json) {
        return Err(error);
    }
    if let Some(reason) = json["promptFeedback"]["blockReason"].as_str() {
        return Err(ApiError::Provider {
            code: 0,
            message: format!("Prompt blocked: {}", reason),
        });
    }

    Ok(gemini_text(json))
}

#[async_trait]
impl ApiProvider for GeminiProvider {
    async fn send_request(&self, request: &GenerationRequest) -> Result<String, ApiError> {
        let body = self.build_request(request)?;
        let response = post_json(self.post(self.generate_url()), &body).await?;
        let json: Value = response.json().await?;
        parse_generate_response(&json)
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }
}

#[async_trait]
impl StreamingProvider for GeminiProvider {
    async fn send_streaming(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>, ApiError> {
        let body = self.build_request(request)?;
        open_stream(self.post(self.stream_url()), &body, SseFormat::Gemini, cancel).await
    }
}
