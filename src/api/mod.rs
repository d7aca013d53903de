//! Provider abstraction layer for the supported text-generation backends
//!
//! Every backend speaks its own request shape, streaming framing and error
//! schema. The types here normalize all of them into one contract: a
//! conversation goes in, and either a full text or a sequence of
//! [`StreamChunk`]s comes out.

mod adapter;
mod anthropic;
mod custom;
mod gemini;
mod minimax;
pub mod normalize;
mod openai;
mod request;
mod response;
pub mod sse;
mod streaming;

pub use adapter::{build_backend, ProviderAdapter};
pub use anthropic::AnthropicProvider;
pub use custom::CustomProvider;
pub use gemini::GeminiProvider;
pub use minimax::MiniMaxProvider;
pub use openai::OpenAiProvider;
pub use request::{ChatMessage, GenerationRequest, Role};
pub use response::GenerationResult;
pub use streaming::{StreamChunk, StreamingProvider};

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 25000;
pub const DEFAULT_TOP_P: f32 = 0.95;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Provider error ({code}): {message}")]
    Provider { code: i64, message: String },

    #[error("Generation aborted")]
    Aborted,

    #[error("Provider returned no content")]
    EmptyResponse,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ApiError {
    pub fn is_abort(&self) -> bool {
        matches!(self, ApiError::Aborted)
    }
}

/// The closed set of supported backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    DeepSeek,
    MiniMax,
    Custom,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::DeepSeek,
        ProviderKind::MiniMax,
        ProviderKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::MiniMax => "minimax",
            ProviderKind::Custom => "custom",
        }
    }

    /// Environment variable holding this provider's API key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::DeepSeek => "DEEPSEEK_API_KEY",
            ProviderKind::MiniMax => "MINIMAX_API_KEY",
            ProviderKind::Custom => "CUSTOM_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| ApiError::Config(format!("Unknown provider: {}", s)))
    }
}

/// Per-model sampling overrides; unset fields fall back to the defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(alias = "max_tokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(alias = "top_p", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// Fully resolved sampling parameters sent with every request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: DEFAULT_TOP_P,
        }
    }
}

impl From<Option<&ModelParams>> for SamplingParams {
    fn from(params: Option<&ModelParams>) -> Self {
        let defaults = SamplingParams::default();
        match params {
            Some(p) => Self {
                temperature: p.temperature.unwrap_or(defaults.temperature),
                max_tokens: p.max_tokens.unwrap_or(defaults.max_tokens),
                top_p: p.top_p.unwrap_or(defaults.top_p),
            },
            None => defaults,
        }
    }
}

/// A user-defined OpenAI-compatible endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEndpoint {
    pub name: String,
    /// Host, with or without scheme (`https://` is assumed when missing)
    #[serde(alias = "api_domain")]
    pub api_domain: String,
    /// Request path, with or without a leading slash
    #[serde(alias = "api_path")]
    pub api_path: String,
}

impl CustomEndpoint {
    pub fn url(&self) -> String {
        let domain = self.api_domain.trim_end_matches('/');
        let domain = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{}", domain)
        };

        let path = if self.api_path.starts_with('/') {
            self.api_path.clone()
        } else {
            format!("/{}", self.api_path)
        };

        format!("{}{}", domain, path)
    }
}

/// Identifies one backend plus everything needed to call it.
///
/// Immutable once handed to [`build_backend`]; build a fresh one when the
/// user switches provider or model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub model: String,
    /// Overrides the provider's default endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model_configs: HashMap<String, ModelParams>,
    /// Required when `provider` is `custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomEndpoint>,
}

impl ProviderConfig {
    pub fn new(provider: ProviderKind, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            model_configs: HashMap::new(),
            custom: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model_params(mut self, model: impl Into<String>, params: ModelParams) -> Self {
        self.model_configs.insert(model.into(), params);
        self
    }

    pub fn with_custom_endpoint(mut self, endpoint: CustomEndpoint) -> Self {
        self.custom = Some(endpoint);
        self
    }

    /// Sampling parameters for the selected model
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams::from(self.model_configs.get(&self.model))
    }

    pub(crate) fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or(default)
    }
}

/// Trait for providers that return the whole generation at once
#[async_trait]
pub trait ApiProvider: Send + Sync {
    async fn send_request(&self, request: &GenerationRequest) -> Result<String, ApiError>;
    fn provider_kind(&self) -> ProviderKind;
}

/// A backend usable in both synchronous and streaming mode
pub trait Backend: ApiProvider + StreamingProvider {}

impl<T: ApiProvider + StreamingProvider> Backend for T {}

/// Best-effort human readable detail from an error body
pub(crate) fn describe_error_body(body: &str) -> String {
    let json: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return body.to_string(),
    };
    // Gemini wraps errors in a one-element array
    let json = match json {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };

    json["base_resp"]["status_msg"]
        .as_str()
        .filter(|msg| !msg.is_empty())
        .or_else(|| json["error"]["message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

/// Detect an error reported inside an otherwise successful body
pub(crate) fn embedded_error(json: &Value) -> Option<ApiError> {
    if let Some(code) = json["base_resp"]["status_code"].as_i64() {
        if code != 0 {
            let message = json["base_resp"]["status_msg"]
                .as_str()
                .filter(|msg| !msg.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| code.to_string());
            return Some(ApiError::Provider { code, message });
        }
    }

    let error = json.get("error")?;
    if error.is_null() {
        return None;
    }
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(ApiError::Provider {
        code: error["code"].as_i64().unwrap_or(0),
        message,
    })
}

/// Send a JSON POST and turn any non-2xx status into [`ApiError::Status`]
pub(crate) async fn post_json(builder: RequestBuilder, body: &Value) -> Result<Response, ApiError> {
    let response = builder
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message: describe_error_body(&error_text),
    })
}
