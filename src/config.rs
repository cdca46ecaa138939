//! Configuration for the payment channel gateway.
//!
//! Loaded from a JSON file named by `--config` (or `CONFIG`), with serde
//! defaults falling back to environment variables and hardcoded values.
//! Secrets never live in the file itself: provider API keys are named by
//! environment variable and resolved at startup.

use alloy_primitives::U256;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::billing::pricing::PricingRule;
use crate::billing::provider::ProviderKind;
use crate::claims::ClaimPolicy;
use crate::util::num_str;

/// CLI arguments for the gateway server.
#[derive(Parser, Debug)]
#[command(name = "rav-gateway")]
#[command(about = "Payment channel gateway HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    pub port: u16,
    #[serde(default = "config_defaults::default_host")]
    pub host: IpAddr,
    /// Logical service identity, recorded in billing contexts.
    #[serde(default = "config_defaults::default_service_id")]
    pub service_id: String,
    /// Chain the gateway accepts RAVs for.
    pub chain_id: u64,
    #[serde(default = "config_defaults::default_asset_id")]
    pub default_asset_id: String,
    /// Flat pico-USD price applied when no model pricing matches.
    #[serde(
        default = "config_defaults::default_price_pico_usd",
        with = "num_str::u256_dec"
    )]
    pub default_price_pico_usd: U256,
    #[serde(default)]
    pub claim: ClaimConfig,
    #[serde(default = "config_defaults::default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    #[serde(default = "config_defaults::default_pending_ttl_ms")]
    pub pending_ttl_ms: u64,
    #[serde(default = "config_defaults::default_verification_timeout_ms")]
    pub verification_timeout_ms: u64,
    /// DIDs allowed to read the admin surface. Empty leaves it open.
    #[serde(default)]
    pub admin_dids: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    /// Settlement hub wrapping the on-chain contract runtime.
    pub hub_url: Url,
    /// DID verification sidecar checking RAV signatures.
    pub verifier_url: Url,
    /// Where signed RAVs are persisted.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upstream providers by name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Conversion rates: asset id to minor units per USD.
    #[serde(default)]
    pub assets: HashMap<String, AssetConfig>,
    /// Per-model pricing rules.
    #[serde(default)]
    pub models: HashMap<String, ModelPricingConfig>,
    /// Operations (`"METHOD:path"`) billed at zero.
    #[serde(default)]
    pub free_operations: Vec<String>,
}

/// Claim scheduler policy knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimConfig {
    #[serde(
        default = "claim_defaults::default_min_claim_amount",
        with = "num_str::u256_dec"
    )]
    pub min_claim_amount: U256,
    #[serde(default = "claim_defaults::default_max_concurrent_claims")]
    pub max_concurrent_claims: usize,
    #[serde(default = "claim_defaults::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "claim_defaults::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub require_hub_balance: bool,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        ClaimConfig {
            min_claim_amount: claim_defaults::default_min_claim_amount(),
            max_concurrent_claims: claim_defaults::default_max_concurrent_claims(),
            max_retries: claim_defaults::default_max_retries(),
            retry_delay_ms: claim_defaults::default_retry_delay_ms(),
            require_hub_balance: false,
        }
    }
}

impl From<&ClaimConfig> for ClaimPolicy {
    fn from(config: &ClaimConfig) -> Self {
        ClaimPolicy {
            min_claim_amount: config.min_claim_amount,
            max_concurrent_claims: config.max_concurrent_claims,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            require_hub_balance: config.require_hub_balance,
        }
    }
}

mod claim_defaults {
    use alloy_primitives::U256;

    pub fn default_min_claim_amount() -> U256 {
        U256::from(1_000_000u64)
    }
    pub fn default_max_concurrent_claims() -> usize {
        16
    }
    pub fn default_max_retries() -> u32 {
        3
    }
    pub fn default_retry_delay_ms() -> u64 {
        1_000
    }
}

/// RAV persistence backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageConfig {
    /// In-memory log; receipts are lost on restart. For tests and
    /// development.
    #[default]
    Memory,
    /// One JSON document per sub-channel under `path`.
    File { path: PathBuf },
}

/// One upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: Url,
    /// Environment variable holding the upstream API key.
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub requires_api_key: bool,
    #[serde(default)]
    pub supports_native_usd_cost: bool,
}

/// Conversion rate for one asset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetConfig {
    /// Asset minor units per whole USD (e.g. 1000000 for a six-decimal
    /// stable asset).
    #[serde(with = "num_str::u256_dec")]
    pub minor_units_per_usd: U256,
}

/// Per-model pricing, tagged by rule shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ModelPricingConfig {
    #[serde(rename_all = "camelCase")]
    PerRequest {
        #[serde(with = "num_str::u256_dec")]
        price_pico_usd: U256,
    },
    #[serde(rename_all = "camelCase")]
    PerToken {
        #[serde(with = "num_str::u256_dec")]
        prompt_price_pico_usd: U256,
        #[serde(with = "num_str::u256_dec")]
        completion_price_pico_usd: U256,
    },
    NativeUsd,
}

impl From<&ModelPricingConfig> for PricingRule {
    fn from(config: &ModelPricingConfig) -> Self {
        match config {
            ModelPricingConfig::PerRequest { price_pico_usd } => {
                PricingRule::PerRequestPicoUsd(*price_pico_usd)
            }
            ModelPricingConfig::PerToken {
                prompt_price_pico_usd,
                completion_price_pico_usd,
            } => PricingRule::PerTokenPicoUsd {
                prompt: *prompt_price_pico_usd,
                completion: *completion_price_pico_usd,
            },
            ModelPricingConfig::NativeUsd => PricingRule::ProviderNativeUsd,
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";

    /// Default port with fallback: $PORT env var, then 8080.
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Default host with fallback: $HOST env var, then "0.0.0.0".
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().unwrap()))
    }

    pub fn default_service_id() -> String {
        env::var("SERVICE_ID").unwrap_or_else(|_| "rav-gateway".to_string())
    }

    pub fn default_asset_id() -> String {
        "pusd".to_string()
    }

    pub fn default_price_pico_usd() -> alloy_primitives::U256 {
        alloy_primitives::U256::ZERO
    }

    pub fn default_stream_timeout_ms() -> u64 {
        30_000
    }

    /// 30 minutes.
    pub fn default_pending_ttl_ms() -> u64 {
        1_800_000
    }

    pub fn default_verification_timeout_ms() -> u64 {
        5_000
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    /// Load configuration from CLI arguments and the JSON file they name.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config, e))?;
        Self::load_from_path(config_path)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let json = r#"{
            "chainId": 4,
            "hubUrl": "https://hub.example/",
            "verifierUrl": "https://verifier.example/"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.chain_id, 4);
        assert_eq!(config.service_id, "rav-gateway");
        assert_eq!(config.default_asset_id, "pusd");
        assert_eq!(config.pending_ttl_ms, 1_800_000);
        assert_eq!(config.claim.max_retries, 3);
        assert_eq!(config.claim.min_claim_amount, U256::from(1_000_000u64));
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert!(!config.debug);
    }

    #[test]
    fn test_full_config_parses() {
        let json = r#"{
            "chainId": 4,
            "hubUrl": "https://hub.example/",
            "verifierUrl": "https://verifier.example/",
            "serviceId": "llm-gateway",
            "defaultAssetId": "pusd",
            "defaultPricePicoUsd": "100000000",
            "streamTimeoutMs": 15000,
            "pendingTtlMs": 600000,
            "adminDids": ["did:example:ops"],
            "debug": true,
            "claim": {
                "minClaimAmount": "500",
                "maxConcurrentClaims": 4,
                "maxRetries": 5,
                "retryDelayMs": 2000,
                "requireHubBalance": true
            },
            "storage": {"kind": "file", "path": "data/ravs"},
            "providers": {
                "openai": {
                    "baseUrl": "https://api.openai.com/",
                    "apiKeyEnvVar": "OPENAI_API_KEY",
                    "allowedPaths": ["/v1/chat/completions"],
                    "requiresApiKey": true
                }
            },
            "assets": {
                "pusd": {"minorUnitsPerUsd": "1000000"}
            },
            "models": {
                "gpt-test": {
                    "type": "per-token",
                    "promptPricePicoUsd": "2000000",
                    "completionPricePicoUsd": "6000000"
                },
                "flat-model": {"type": "per-request", "pricePicoUsd": "1000000000"},
                "router-model": {"type": "native-usd"}
            },
            "freeOperations": ["GET:/health"]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.claim.min_claim_amount, U256::from(500u64));
        assert!(config.claim.require_hub_balance);
        assert!(matches!(
            config.storage,
            StorageConfig::File { ref path } if path == Path::new("data/ravs")
        ));
        let provider = &config.providers["openai"];
        assert_eq!(provider.kind, ProviderKind::OpenAiCompatible);
        assert!(provider.requires_api_key);
        assert!(matches!(
            PricingRule::from(&config.models["gpt-test"]),
            PricingRule::PerTokenPicoUsd { .. }
        ));
        assert!(matches!(
            PricingRule::from(&config.models["router-model"]),
            PricingRule::ProviderNativeUsd
        ));
    }

    #[test]
    fn test_claim_policy_conversion() {
        let config = ClaimConfig::default();
        let policy = ClaimPolicy::from(&config);
        assert_eq!(policy.max_concurrent_claims, 16);
        assert_eq!(policy.retry_delay_ms, 1_000);
    }
}
