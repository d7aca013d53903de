//! User-defined OpenAI-compatible endpoint

use super::openai::{chat_body, parse_chat_response};
use super::sse::{open_stream, SseFormat};
use super::streaming::{StreamChunk, StreamingProvider};
use super::{
    post_json, ApiError, ApiProvider, GenerationRequest, ProviderConfig, ProviderKind,
    SamplingParams,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct CustomProvider {
    name: String,
    url: String,
    api_key: String,
    model: String,
    sampling: SamplingParams,
    client: Client,
}

impl CustomProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ApiError> {
        let endpoint = config.custom.as_ref().ok_or_else(|| {
            ApiError::Config("Custom provider requires an endpoint (domain + path)".into())
        })?;

        Ok(Self {
            name: endpoint.name.clone(),
            url: endpoint.url(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            sampling: config.sampling(),
            client: Client::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn post(&self) -> reqwest::RequestBuilder {
        let builder = self.client.post(&self.url);
        // Self-hosted endpoints often run without auth
        if self.api_key.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

#[async_trait]
impl ApiProvider for CustomProvider {
    async fn send_request(&self, request: &GenerationRequest) -> Result<String, ApiError> {
        let body = chat_body(&self.model, &request.messages, self.sampling);
        let response = post_json(self.post(), &body).await?;
        let json: Value = response.json().await?;
        parse_chat_response(&json)
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }
}

#[async_trait]
impl StreamingProvider for CustomProvider {
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
