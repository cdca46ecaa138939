//! Upstream LLM providers.
//!
//! A provider is a named upstream with a closed capability surface: which
//! paths it serves, whether it needs an API key, whether it reports native
//! USD cost, how to pull the model and usage out of its payloads, and which
//! stream processor understands its SSE framing. Providers are registered at
//! startup from configuration; unknown names yield `404`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::billing::usage::{self, SseStreamProcessor, Usage};
use crate::config::ProviderConfig;

/// The closed set of provider wire dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// OpenAI-style chat completions: JSON bodies with a `model` field,
    /// `usage` objects, and SSE streaming with a `[DONE]` sentinel.
    #[default]
    OpenAiCompatible,
}

/// One registered upstream.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: url::Url,
    pub allowed_paths: Vec<String>,
    pub requires_api_key: bool,
    pub supports_native_usd_cost: bool,
    api_key: Option<String>,
}

impl Provider {
    pub fn new(name: String, kind: ProviderKind, base_url: url::Url) -> Self {
        Provider {
            name,
            kind,
            base_url,
            allowed_paths: Vec::new(),
            requires_api_key: false,
            supports_native_usd_cost: false,
            api_key: None,
        }
    }

    pub fn with_allowed_paths(mut self, paths: Vec<String>) -> Self {
        self.allowed_paths = paths;
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>, required: bool) -> Self {
        self.api_key = api_key;
        self.requires_api_key = required;
        self
    }

    pub fn with_native_usd_cost(mut self, supported: bool) -> Self {
        self.supports_native_usd_cost = supported;
        self
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Whether the request path is served by this provider. An empty list
    /// allows everything; a trailing `*` matches by prefix.
    pub fn allows_path(&self, path: &str) -> bool {
        if self.allowed_paths.is_empty() {
            return true;
        }
        self.allowed_paths.iter().any(|allowed| {
            if let Some(prefix) = allowed.strip_suffix('*') {
                path.starts_with(prefix)
            } else {
                allowed == path
            }
        })
    }

    /// Pulls the requested model out of the request body.
    pub fn extract_model(&self, body: &serde_json::Value) -> Option<String> {
        match self.kind {
            ProviderKind::OpenAiCompatible => body
                .get("model")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        }
    }

    /// Whether the request asks for a streamed response.
    pub fn wants_stream(&self, body: &serde_json::Value) -> bool {
        match self.kind {
            ProviderKind::OpenAiCompatible => body
                .get("stream")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }

    /// Rewrites the request body before forwarding. For streaming requests
    /// the upstream is asked to include a final usage frame.
    pub fn prepare_request(&self, body: &mut serde_json::Value, streaming: bool) {
        match self.kind {
            ProviderKind::OpenAiCompatible => {
                if streaming {
                    if let Some(object) = body.as_object_mut() {
                        let options = object
                            .entry("stream_options")
                            .or_insert_with(|| serde_json::json!({}));
                        if let Some(options) = options.as_object_mut() {
                            options.insert("include_usage".to_string(), serde_json::json!(true));
                        }
                    }
                }
            }
        }
    }

    /// Extracts usage from a buffered (non-streaming) response body.
    pub fn extract_usage(&self, body: &serde_json::Value) -> Option<Usage> {
        match self.kind {
            ProviderKind::OpenAiCompatible => usage::usage_from_json(body),
        }
    }

    /// Extracts the provider-native cost from a buffered response body, in
    /// pico-USD. Only meaningful when [`Provider::supports_native_usd_cost`].
    pub fn extract_provider_cost(&self, body: &serde_json::Value) -> Option<alloy_primitives::U256> {
        if !self.supports_native_usd_cost {
            return None;
        }
        match self.kind {
            ProviderKind::OpenAiCompatible => usage::provider_cost_from_json(body),
        }
    }

    /// A fresh stream processor for this provider's SSE dialect.
    pub fn stream_processor(&self) -> SseStreamProcessor {
        match self.kind {
            ProviderKind::OpenAiCompatible => SseStreamProcessor::new(),
        }
    }
}

/// Registry of providers, resolved by name from the URL path.
#[derive(Debug, Default)]
pub struct ProviderManager {
    providers: HashMap<String, Arc<Provider>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from configuration, resolving API keys from the
    /// environment variables the config names.
    pub fn from_config(configs: &HashMap<String, ProviderConfig>) -> Self {
        let mut manager = ProviderManager::new();
        for (name, config) in configs {
            let api_key = config
                .api_key_env_var
                .as_ref()
                .and_then(|var| std::env::var(var).ok());
            if config.requires_api_key && api_key.is_none() {
                tracing::warn!(
                    provider = %name,
                    env_var = ?config.api_key_env_var,
                    "provider requires an API key but none was resolved"
                );
            }
            let provider = Provider::new(name.clone(), config.kind, config.base_url.clone())
                .with_allowed_paths(config.allowed_paths.clone())
                .with_api_key(api_key, config.requires_api_key)
                .with_native_usd_cost(config.supports_native_usd_cost);
            manager.register(provider);
        }
        manager
    }

    pub fn register(&mut self, provider: Provider) {
        self.providers
            .insert(provider.name.clone(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}
