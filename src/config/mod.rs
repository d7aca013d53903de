//! Configuration management for draftsmith
//!
//! Supports configuration via:
//! 1. Config file (~/.config/draftsmith/config.toml)
//! 2. Environment variables (DRAFTSMITH_PROVIDER, OPENAI_API_KEY, etc.)
//! 3. CLI arguments (override file/env settings)

use crate::api::{CustomEndpoint, ModelParams, ProviderConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Model used when the config names none
pub fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "gpt-4.1",
        ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
        ProviderKind::Gemini => "gemini-2.0-flash",
        ProviderKind::DeepSeek => "deepseek-chat",
        ProviderKind::MiniMax => "MiniMax-Text-01",
        ProviderKind::Custom => "",
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Selected backend
    pub provider: ProviderSettings,

    /// Per-model sampling overrides, keyed by model id
    pub models: HashMap<String, ModelParams>,

    /// Endpoint for the `custom` provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomEndpoint>,

    /// Terminal output settings
    pub output: OutputSettings,
}

/// Provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// One of openai, anthropic, gemini, deepseek, minimax, custom
    pub name: ProviderKind,

    /// Model id; the provider's default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// API key (can also use the provider's *_API_KEY env var)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Override the provider's endpoint (proxies, gateways)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: ProviderKind::OpenAi,
            model: None,
            api_key: None,
            base_url: None,
        }
    }
}

/// Terminal output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Stream tokens as they arrive
    pub stream: bool,

    /// Show a spinner until the first token
    pub spinner: bool,

    /// Colored status lines
    pub color: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            stream: true,
            spinner: true,
            color: true,
        }
    }
}

impl Config {
    /// Get default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("draftsmith")
            .join("config.toml")
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from specific path
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default().with_env_overrides());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;

        Ok(config.with_env_overrides())
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(self) -> Self {
        self.apply_env(|name| std::env::var(name).ok())
    }

    fn apply_env(mut self, env: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = env("DRAFTSMITH_PROVIDER") {
            match name.parse::<ProviderKind>() {
                Ok(kind) => self.switch_provider(kind),
                Err(e) => warn!("Ignoring DRAFTSMITH_PROVIDER: {}", e),
            }
        }
        if let Some(model) = env("DRAFTSMITH_MODEL") {
            self.provider.model = Some(model);
        }
        if let Some(url) = env("DRAFTSMITH_BASE_URL") {
            self.provider.base_url = Some(url);
        }
        if let Some(key) = env(self.provider.name.api_key_env()) {
            self.provider.api_key = Some(key);
        }

        self
    }

    /// Select another provider, as the CLI's `--provider` does
    pub fn with_provider(mut self, kind: ProviderKind) -> Self {
        self.switch_provider(kind);
        if self.provider.api_key.is_none() {
            self.provider.api_key = std::env::var(kind.api_key_env()).ok();
        }
        self
    }

    fn switch_provider(&mut self, kind: ProviderKind) {
        if kind != self.provider.name {
            // A key or model picked for another provider won't work here
            self.provider.api_key = None;
            self.provider.model = None;
        }
        self.provider.name = kind;
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to specific path
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Effective model id
    pub fn model(&self) -> String {
        self.provider
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model(self.provider.name).to_string())
    }

    /// API key for the selected provider, if any
    pub fn api_key(&self) -> Option<String> {
        self.provider.api_key.clone().filter(|k| !k.is_empty())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = self.provider.name;

        if self.model().trim().is_empty() {
            return Err(ConfigError::MissingRequired(format!(
                "A model must be set for the {} provider",
                kind
            )));
        }

        match kind {
            ProviderKind::Custom => {
                let endpoint = self.custom.as_ref().ok_or_else(|| {
                    ConfigError::MissingRequired(
                        "The custom provider needs a [custom] endpoint".to_string(),
                    )
                })?;
                if endpoint.api_domain.trim().is_empty() || endpoint.api_path.trim().is_empty() {
                    return Err(ConfigError::MissingRequired(
                        "Custom endpoint needs both api_domain and api_path".to_string(),
                    ));
                }
            }
            _ => {
                if self.api_key().is_none() {
                    return Err(ConfigError::MissingRequired(format!(
                        "No API key for {} (set provider.api_key or {})",
                        kind,
                        kind.api_key_env()
                    )));
                }
            }
        }

        for (model, params) in &self.models {
            if let Some(t) = params.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: temperature {} is outside 0.0..=2.0",
                        model, t
                    )));
                }
            }
            if let Some(p) = params.top_p {
                if !(0.0..=1.0).contains(&p) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: top_p {} is outside 0.0..=1.0",
                        model, p
                    )));
                }
            }
            if params.max_tokens == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "{}: max_tokens must be positive",
                    model
                )));
            }
        }

        Ok(())
    }

    /// Validate and turn into the provider config used by the adapter
    pub fn provider_config(&self) -> Result<ProviderConfig, ConfigError> {
        self.validate()?;

        let mut config = ProviderConfig::new(
            self.provider.name,
            self.api_key().unwrap_or_default(),
            self.model(),
        );
        config.base_url = self.provider.base_url.clone();
        config.model_configs = self.models.clone();
        config.custom = self.custom.clone();
        Ok(config)
    }

    /// Generate example config content
    pub fn example() -> String {
        let example = ConfigBuilder::new()
            .model(default_model(ProviderKind::OpenAi))
            .model_params(
                default_model(ProviderKind::OpenAi),
                ModelParams {
                    temperature: Some(0.7),
                    max_tokens: Some(25000),
                    top_p: Some(0.95),
                },
            )
            .build();
        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

/// Builder for creating Config programmatically
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn provider(mut self, kind: ProviderKind) -> Self {
        self.config.provider.name = kind;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.provider.model = Some(model.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.provider.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.provider.base_url = Some(url.into());
        self
    }

    pub fn model_params(mut self, model: impl Into<String>, params: ModelParams) -> Self {
        self.config.models.insert(model.into(), params);
        self
    }

    pub fn custom_endpoint(mut self, endpoint: CustomEndpoint) -> Self {
        self.config.custom = Some(endpoint);
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.config.output.stream = stream;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
