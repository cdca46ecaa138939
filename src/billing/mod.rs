//! Cost calculation and usage accounting for proxied LLM traffic.
//!
//! - [`pricing`] — pricing rules, the model registry, and USD→asset
//!   conversion through a rate provider.
//! - [`usage`] — token usage records, response-body extraction, and the SSE
//!   stream processor that accumulates usage chunk by chunk.
//! - [`provider`] — the closed set of upstream provider variants and the
//!   registry resolving them by name.

pub mod pricing;
pub mod provider;
pub mod usage;

pub use pricing::{BillingContext, BillingEngine, FixedRateProvider, PricingError, PricingRegistry, PricingRule, RateProvider};
pub use provider::{Provider, ProviderKind, ProviderManager};
pub use usage::{SseStreamProcessor, StreamOutcome, Usage};
