//! HTTP surface of the gateway.
//!
//! One wildcard route carries all metered LLM traffic:
//! `POST /v1/{provider}/{*path}`. Around the upstream call it runs the
//! deferred-payment state machine: settle the previous proposal from the
//! request header, price the current request, and attach the next proposal
//! to the response (header for buffered responses, terminal SSE frame for
//! streams).
//!
//! The payment-channel sidecar routes expose health, recovery for clients
//! that lost their latest proposal, and an admin view of the claim
//! scheduler.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::billing::pricing::{BillingContext, BillingEngine};
use crate::billing::provider::ProviderManager;
use crate::claims::ClaimScheduler;
use crate::config::Config;
use crate::envelope;
use crate::error::ErrorCode;
use crate::processor::PaymentProcessor;
use crate::proxy::{LlmProxy, ProxyError, StreamSettlement};
use crate::rav::{ChannelId, SubChannelKey, VmIdFragment};

/// Header carrying the caller DID resolved by the outer authentication
/// layer. DID authentication itself is out of scope here.
pub const CALLER_DID_HEADER: &str = "x-caller-did";

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<PaymentProcessor>,
    pub proxy: Arc<LlmProxy>,
    pub providers: Arc<ProviderManager>,
    pub billing: Arc<BillingEngine>,
    pub scheduler: ClaimScheduler,
    pub config: Arc<Config>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/payment-channel/recovery", get(get_recovery))
        .route("/payment-channel/admin/claims", get(get_admin_claims))
        .route("/v1/{provider}/{*path}", post(post_gateway))
        .with_state(state)
}

#[instrument(skip_all)]
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "serviceId": state.config.service_id,
        "providers": state.providers.names(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoveryQuery {
    channel_id: String,
    vm_id_fragment: String,
}

/// Returns the latest pending proposal and sub-channel counters so a client
/// that lost its local copy can resume the nonce sequence.
#[instrument(skip_all)]
async fn get_recovery(
    State(state): State<AppState>,
    Query(query): Query<RecoveryQuery>,
) -> impl IntoResponse {
    let channel_id = ChannelId::new(query.channel_id);
    let key = SubChannelKey::new(channel_id.clone(), VmIdFragment::new(query.vm_id_fragment));
    let channel = state.processor.channels().channel(&channel_id);
    let sub_channel = state.processor.channels().sub_channel_state(&key);
    let pending = state.processor.pending().latest_for_channel(&channel_id);
    Json(json!({
        "channel": channel,
        "subChannel": sub_channel,
        "pendingProposal": pending,
    }))
}

/// Claim scheduler counters and pending-store stats, gated by `adminDids`.
#[instrument(skip_all)]
async fn get_admin_claims(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.config.admin_dids.is_empty() {
        let caller = headers
            .get(CALLER_DID_HEADER)
            .and_then(|value| value.to_str().ok());
        let authorized = caller
            .map(|did| state.config.admin_dids.iter().any(|admin| admin == did))
            .unwrap_or(false);
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "caller DID missing or not an admin", "errorCode": ErrorCode::Unauthorized })),
            )
                .into_response();
        }
    }
    Json(json!({
        "claims": state.scheduler.metrics(),
        "pending": state.processor.pending().stats(),
    }))
    .into_response()
}

/// The metered gateway route.
#[instrument(skip_all, fields(provider = %provider_name, path = %path))]
async fn post_gateway(
    State(state): State<AppState>,
    Path((provider_name, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Steps 1-5: settle the previous proposal.
    let payment_header = envelope::header_value(&headers);
    let payment = match state.processor.pre_process(payment_header).await {
        Ok(context) => context,
        Err(error) => return error.into_response(),
    };

    let Some(provider) = state.providers.get(&provider_name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown provider {provider_name}"), "errorCode": ErrorCode::UnknownProvider })),
        )
            .into_response();
    };
    let path = format!("/{path}");
    if !provider.allows_path(&path) {
        return ProxyError::PathNotAllowed(path).into_response();
    }

    let mut request_body: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(error) => return ProxyError::InvalidRequestBody(error.to_string()).into_response(),
    };
    let model = provider.extract_model(&request_body);
    if let Err(error) = state.proxy.validate_model(&provider, model.as_deref()) {
        return error.into_response();
    }
    let streaming = provider.wants_stream(&request_body);
    provider.prepare_request(&mut request_body, streaming);

    let asset_id = if payment.channel.asset_id.is_empty() {
        state.config.default_asset_id.clone()
    } else {
        payment.channel.asset_id.clone()
    };
    let billing_context = BillingContext {
        service_id: state.processor.service_id().to_string(),
        operation: format!("POST:{path}"),
        asset_id,
        model,
        usage: None,
        provider_cost_pico_usd: None,
    };

    if streaming {
        let report = Arc::new(std::sync::OnceLock::new());
        let settlement = StreamSettlement {
            processor: state.processor.clone(),
            payment,
            billing_context,
            report: report.clone(),
        };
        match state
            .proxy
            .forward_streaming(&provider, &path, &request_body, settlement)
            .await
        {
            Ok(mut response) => {
                // Filled by the stream pump before the body closes, so the
                // access log sees the final accounting.
                response.extensions_mut().insert(report);
                response
            }
            Err(error) => error.into_response(),
        }
    } else {
        let upstream = match state
            .proxy
            .forward_buffered(&provider, &path, &request_body)
            .await
        {
            Ok(upstream) => upstream,
            Err(error) => return error.into_response(),
        };

        let mut billing_context = billing_context;
        billing_context.usage = upstream.usage;
        billing_context.provider_cost_pico_usd = upstream.provider_cost_pico_usd;
        let cost = match state.billing.calc_cost(&billing_context).await {
            Ok(cost) => cost,
            Err(error) => return ProxyError::from(error).into_response(),
        };

        // Step 7 completes before any response byte is committed.
        let response_envelope = match state.processor.finalize(&payment, cost) {
            Ok(envelope) => envelope,
            Err(error) => return error.into_response(),
        };

        let mut response = Response::builder().status(upstream.status);
        if let Some(content_type) = &upstream.content_type {
            response = response.header(header::CONTENT_TYPE, content_type);
        }
        if let Ok(value) = envelope::to_header_value(&response_envelope) {
            response = response.header(envelope::PAYMENT_CHANNEL_HEADER, value);
        }
        response
            .body(axum::body::Body::from(upstream.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
