//! Payment channel gateway HTTP entrypoint.
//!
//! Launches the Axum server fronting the metered LLM proxy, plus the two
//! long-lived background tasks: the claim scheduler's queue scanner and the
//! pending-proposal TTL sweeper. All three drain on SIGTERM/SIGINT through a
//! shared cancellation token.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` (or `--config`) names the JSON configuration file
//! - `HOST`, `PORT` override the bind address
//! - `RUST_LOG` overrides log filtering

mod billing;
mod chain;
mod claims;
mod config;
mod envelope;
mod error;
mod handlers;
mod processor;
mod proxy;
mod rav;
mod store;
mod telemetry;
mod timestamp;
mod util;
mod verify;

use axum::http::Method;
use dotenvy::dotenv;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;

use crate::billing::pricing::{BillingEngine, FixedRateProvider, PricingRegistry, PricingRule};
use crate::billing::provider::ProviderManager;
use crate::chain::{ChainClient, HubChainClient};
use crate::claims::ClaimScheduler;
use crate::config::{Config, StorageConfig};
use crate::handlers::AppState;
use crate::processor::{PaymentProcessor, ProcessorSettings};
use crate::proxy::LlmProxy;
use crate::store::{ChannelStateCache, FileRavStore, MemoryRavStore, PendingProposalStore, RavStore};
use crate::telemetry::Telemetry;
use crate::util::shutdown::Shutdown;
use crate::verify::{HttpSignatureVerifier, RavVerifier, SignatureVerifier};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let config = Arc::new(Config::load()?);
    let telemetry = Telemetry::new().with_debug(config.debug).register();

    // Stores.
    let channels = Arc::new(ChannelStateCache::new());
    let rav_store: Arc<dyn RavStore> = match &config.storage {
        StorageConfig::Memory => Arc::new(MemoryRavStore::new()),
        StorageConfig::File { path } => Arc::new(FileRavStore::open(path.clone()).await?),
    };
    let pending = Arc::new(PendingProposalStore::new());

    // External collaborators.
    let hub: Arc<dyn ChainClient> = Arc::new(HubChainClient::try_new(
        config.hub_url.clone(),
        Duration::from_secs(30),
    )?);
    let resolver: Arc<dyn SignatureVerifier> =
        Arc::new(HttpSignatureVerifier::try_new(config.verifier_url.clone())?);

    // Claim scheduler.
    let scheduler = ClaimScheduler::new(
        (&config.claim).into(),
        rav_store.clone(),
        hub.clone(),
        channels.clone(),
    );

    // Payment processor.
    let processor = Arc::new(PaymentProcessor::new(
        RavVerifier::new(resolver, config.chain_id),
        rav_store.clone(),
        pending.clone(),
        channels.clone(),
        hub.clone(),
        Arc::new(scheduler.clone()),
        ProcessorSettings {
            service_id: config.service_id.clone(),
            verification_timeout: config.verification_timeout(),
        },
    ));

    // Billing.
    let mut registry = PricingRegistry::new(config.default_price_pico_usd);
    for (model, pricing) in &config.models {
        registry = registry.with_model(model.clone(), PricingRule::from(pricing));
    }
    for operation in &config.free_operations {
        registry = registry.with_free_operation(operation.clone());
    }
    let rates: HashMap<String, alloy_primitives::U256> = config
        .assets
        .iter()
        .map(|(asset, asset_config)| (asset.clone(), asset_config.minor_units_per_usd))
        .collect();
    let billing = Arc::new(BillingEngine::new(
        registry,
        Arc::new(FixedRateProvider::new(rates)),
    ));
    let providers = Arc::new(ProviderManager::from_config(&config.providers));
    let proxy = Arc::new(LlmProxy::new(billing.clone(), config.stream_timeout()));

    let state = AppState {
        processor,
        proxy,
        providers,
        billing,
        scheduler: scheduler.clone(),
        config: config.clone(),
    };

    let app = handlers::routes(state)
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let shutdown = Shutdown::install()?;
    {
        let scheduler = scheduler.clone();
        let token = shutdown.token();
        shutdown.spawn(async move { scheduler.run(token).await });
    }
    shutdown.spawn(
        pending
            .clone()
            .run_sweeper(config.pending_ttl(), shutdown.token()),
    );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        std::process::exit(1);
    });

    let serve_token = shutdown.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await?;

    // Finish in-flight claims and stop the sweeper before exiting.
    shutdown.drain().await;
    tracing::info!("shutdown complete");

    Ok(())
}
