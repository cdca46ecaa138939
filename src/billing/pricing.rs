//! Pricing rules and cost calculation.
//!
//! Prices are expressed in pico-USD (10^-12 USD) and converted to asset minor
//! units through a [`RateProvider`] at billing time. Three rule shapes cover
//! the upstream landscape: a flat per-request price, per-token prices applied
//! to extracted usage, and provider-native USD cost passed through from
//! upstreams that report their own billing.

use alloy_primitives::U256;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::billing::usage::Usage;

/// Scale factor between pico-USD and USD.
const PICO_PER_USD: u64 = 1_000_000_000_000;

/// How a model (or endpoint) is priced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingRule {
    /// Flat pico-USD price per request, regardless of usage.
    PerRequestPicoUsd(U256),
    /// Pico-USD per prompt/completion token, applied to extracted usage.
    PerTokenPicoUsd { prompt: U256, completion: U256 },
    /// The upstream reports its own USD cost; pass it through.
    ProviderNativeUsd,
}

/// Billing input assembled by the request handler.
#[derive(Debug, Clone, Default)]
pub struct BillingContext {
    pub service_id: String,
    /// `"METHOD:path"`, e.g. `"POST:/v1/chat/completions"`.
    pub operation: String,
    pub asset_id: String,
    pub model: Option<String>,
    pub usage: Option<Usage>,
    pub provider_cost_pico_usd: Option<U256>,
}

/// Pricing failures. Reported to the client before any upstream call.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("model {0} is not in the pricing registry")]
    ModelNotSupported(String),
    #[error("billing context has no asset id")]
    MissingAssetId,
    #[error("no conversion rate for asset {0}")]
    RateUnavailable(String),
}

/// Converts pico-USD into asset minor units.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn minor_units_per_usd(&self, asset_id: &str) -> Result<U256, PricingError>;
}

/// Static conversion table, one rate per asset id.
#[derive(Debug, Default)]
pub struct FixedRateProvider {
    rates: HashMap<String, U256>,
}

impl FixedRateProvider {
    pub fn new(rates: HashMap<String, U256>) -> Self {
        FixedRateProvider { rates }
    }
}

#[async_trait]
impl RateProvider for FixedRateProvider {
    async fn minor_units_per_usd(&self, asset_id: &str) -> Result<U256, PricingError> {
        self.rates
            .get(asset_id)
            .copied()
            .ok_or_else(|| PricingError::RateUnavailable(asset_id.to_string()))
    }
}

/// Per-model pricing rules plus the service-wide defaults.
#[derive(Debug, Default)]
pub struct PricingRegistry {
    models: HashMap<String, PricingRule>,
    default_price_pico_usd: U256,
    free_operations: HashSet<String>,
}

impl PricingRegistry {
    pub fn new(default_price_pico_usd: U256) -> Self {
        PricingRegistry {
            models: HashMap::new(),
            default_price_pico_usd,
            free_operations: HashSet::new(),
        }
    }

    pub fn with_model<S: Into<String>>(mut self, model: S, rule: PricingRule) -> Self {
        self.models.insert(model.into(), rule);
        self
    }

    pub fn with_free_operation<S: Into<String>>(mut self, operation: S) -> Self {
        self.free_operations.insert(operation.into());
        self
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    pub fn is_free(&self, operation: &str) -> bool {
        self.free_operations.contains(operation)
    }
}

/// Computes request costs from pricing rules and extracted usage.
pub struct BillingEngine {
    registry: PricingRegistry,
    rate_provider: std::sync::Arc<dyn RateProvider>,
}

impl BillingEngine {
    pub fn new(registry: PricingRegistry, rate_provider: std::sync::Arc<dyn RateProvider>) -> Self {
        BillingEngine {
            registry,
            rate_provider,
        }
    }

    pub fn registry(&self) -> &PricingRegistry {
        &self.registry
    }

    /// Cost of the request in asset minor units. Zero is a valid outcome
    /// (free operation, or a stream that never reported usage).
    pub async fn calc_cost(&self, context: &BillingContext) -> Result<U256, PricingError> {
        if self.registry.is_free(&context.operation) {
            return Ok(U256::ZERO);
        }
        if context.asset_id.is_empty() {
            return Err(PricingError::MissingAssetId);
        }

        let pico_usd = self.pico_usd_for(context)?;
        if pico_usd.is_zero() {
            return Ok(U256::ZERO);
        }
        let rate = self
            .rate_provider
            .minor_units_per_usd(&context.asset_id)
            .await?;
        Ok(pico_usd * rate / U256::from(PICO_PER_USD))
    }

    fn pico_usd_for(&self, context: &BillingContext) -> Result<U256, PricingError> {
        let Some(model) = &context.model else {
            return Ok(self.registry.default_price_pico_usd);
        };
        match self.registry.models.get(model) {
            Some(PricingRule::PerRequestPicoUsd(price)) => Ok(*price),
            Some(PricingRule::PerTokenPicoUsd { prompt, completion }) => {
                let Some(usage) = context.usage else {
                    // No usage frame means nothing to bill.
                    return Ok(U256::ZERO);
                };
                Ok(*prompt * U256::from(usage.prompt_tokens)
                    + *completion * U256::from(usage.completion_tokens))
            }
            Some(PricingRule::ProviderNativeUsd) => {
                Ok(context.provider_cost_pico_usd.unwrap_or(U256::ZERO))
            }
            None => context
                .provider_cost_pico_usd
                .ok_or_else(|| PricingError::ModelNotSupported(model.clone())),
        }
    }
}
