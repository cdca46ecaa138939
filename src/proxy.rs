//! Reverse proxy for upstream LLM traffic.
//!
//! Non-streaming requests are forwarded and buffered; usage is extracted
//! from the response body and the cost folded into the payment envelope
//! header before any response byte is committed.
//!
//! Streaming requests forward chunks to the client as they arrive while an
//! [`SseStreamProcessor`] accumulates usage on the side. The end of stream is
//! a two-stage ritual whose ordering is load-bearing: (i) the billing report
//! (final cost, usage, bytes, upstream request id) is published to the
//! request-local scope and the access log, (ii) the payment frame is emitted
//! and the client stream closed. A watchdog aborts the upstream if no chunk
//! arrives within the configured timeout.

use alloy_primitives::U256;
use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use crate::billing::pricing::{BillingContext, BillingEngine, PricingError};
use crate::billing::provider::Provider;
use crate::billing::usage::Usage;
use crate::envelope::{self, ResponseEnvelope};
use crate::error::ErrorCode;
use crate::processor::{PaymentContext, PaymentProcessor};

/// Billing metadata published to the request-local scope at end of stream,
/// before the client stream closes.
#[derive(Debug, Clone)]
pub struct BillingReport {
    pub cost: U256,
    pub usage: Option<Usage>,
    pub bytes: u64,
    pub upstream_request_id: Option<String>,
}

/// A buffered upstream response plus its extracted accounting.
#[derive(Debug)]
pub struct BufferedUpstream {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub usage: Option<Usage>,
    pub provider_cost_pico_usd: Option<U256>,
    pub upstream_request_id: Option<String>,
}

/// Proxy-surface failures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("provider does not serve path {0}")]
    PathNotAllowed(String),
    #[error("request body is not valid JSON: {0}")]
    InvalidRequestBody(String),
    #[error("model {0} is not supported")]
    ModelNotSupported(String),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error("upstream unreachable: {0}")]
    Network(String),
    /// The upstream answered with an error status; its body is preserved
    /// and passed through.
    #[error("upstream returned {status}")]
    Upstream { status: StatusCode, body: Bytes },
}

impl ProxyError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProxyError::PathNotAllowed(_) => ErrorCode::UnknownProvider,
            ProxyError::InvalidRequestBody(_) => ErrorCode::InvalidRequest,
            ProxyError::ModelNotSupported(_) => ErrorCode::ModelNotSupported,
            ProxyError::Pricing(PricingError::ModelNotSupported(_)) => ErrorCode::ModelNotSupported,
            ProxyError::Pricing(PricingError::MissingAssetId) => ErrorCode::MissingAssetId,
            ProxyError::Pricing(PricingError::RateUnavailable(_)) => ErrorCode::InternalError,
            ProxyError::Network(_) => ErrorCode::NetworkError,
            ProxyError::Upstream { .. } => ErrorCode::UpstreamUnavailable,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.status_code();
        match self {
            ProxyError::Upstream { body, .. } => {
                // Pass the structured upstream error through when it is one.
                let passthrough: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
                let payload = passthrough
                    .unwrap_or_else(|| json!({ "error": "upstream error", "errorCode": code }));
                (status, Json(payload)).into_response()
            }
            other => {
                let message = other.to_string();
                let envelope = ResponseEnvelope::failed(code, message.clone());
                let mut response =
                    (status, Json(json!({ "error": message, "errorCode": code }))).into_response();
                if let Ok(value) = envelope::to_header_value(&envelope) {
                    response
                        .headers_mut()
                        .insert(envelope::PAYMENT_CHANNEL_HEADER, value);
                }
                response
            }
        }
    }
}

/// Everything the streaming finalizer needs to settle the request in-band.
pub struct StreamSettlement {
    pub processor: Arc<PaymentProcessor>,
    pub payment: PaymentContext,
    pub billing_context: BillingContext,
    /// Request-local slot the final [`BillingReport`] is published to. The
    /// handler shares it with the response extensions so outer layers (access
    /// log) observe the final accounting once the stream closes.
    pub report: Arc<std::sync::OnceLock<BillingReport>>,
}

/// The upstream HTTP forwarder.
pub struct LlmProxy {
    client: reqwest::Client,
    billing: Arc<BillingEngine>,
    stream_timeout: Duration,
}

impl LlmProxy {
    pub fn new(billing: Arc<BillingEngine>, stream_timeout: Duration) -> Self {
        LlmProxy {
            client: reqwest::Client::new(),
            billing,
            stream_timeout,
        }
    }

    pub fn billing(&self) -> &Arc<BillingEngine> {
        &self.billing
    }

    /// Rejects models the registry cannot price, unless the provider reports
    /// native USD cost. Requests without a model fall back to the default
    /// per-request price.
    pub fn validate_model(
        &self,
        provider: &Provider,
        model: Option<&str>,
    ) -> Result<(), ProxyError> {
        let Some(model) = model else {
            return Ok(());
        };
        if self.billing.registry().has_model(model) || provider.supports_native_usd_cost {
            Ok(())
        } else {
            Err(ProxyError::ModelNotSupported(model.to_string()))
        }
    }

    /// Sends the prepared body upstream. Connection-level failures map to
    /// `503`, anything else that stops the send maps to `502`.
    async fn send_upstream(
        &self,
        provider: &Provider,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = provider
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        let mut request = self.client.post(url).json(body);
        if let Some(api_key) = provider.api_key() {
            request = request.bearer_auth(api_key);
        }
        request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ProxyError::Network(e.to_string())
            } else {
                ProxyError::Upstream {
                    status: StatusCode::BAD_GATEWAY,
                    body: Bytes::from(e.to_string()),
                }
            }
        })
    }

    /// Non-streaming path: forward, buffer, extract usage.
    #[instrument(skip_all, fields(provider = %provider.name, path = %path))]
    pub async fn forward_buffered(
        &self,
        provider: &Provider,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<BufferedUpstream, ProxyError> {
        let response = self.send_upstream(provider, path, body).await?;
        let status = response.status();
        let content_type = header_string(response.headers(), header::CONTENT_TYPE);
        let upstream_request_id = header_string(response.headers(), "x-request-id");
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(ProxyError::Upstream { status, body: bytes });
        }

        let parsed: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();
        let usage = parsed.as_ref().and_then(|v| provider.extract_usage(v));
        let provider_cost_pico_usd = parsed.as_ref().and_then(|v| provider.extract_provider_cost(v));
        Ok(BufferedUpstream {
            status,
            content_type,
            body: bytes,
            usage,
            provider_cost_pico_usd,
            upstream_request_id,
        })
    }

    /// Streaming path: forward chunks while accounting, then settle in-band.
    ///
    /// The returned response streams the upstream SSE frames verbatim,
    /// followed by a `payment` event carrying the next proposal (when the
    /// stream cost anything) produced after the final usage frame is known.
    #[instrument(skip_all, fields(provider = %provider.name, path = %path))]
    pub async fn forward_streaming(
        &self,
        provider: &Provider,
        path: &str,
        body: &serde_json::Value,
        settlement: StreamSettlement,
    ) -> Result<Response, ProxyError> {
        let upstream = self.send_upstream(provider, path, body).await?;
        let status = upstream.status();
        if !status.is_success() {
            let bytes = upstream
                .bytes()
                .await
                .map_err(|e| ProxyError::Network(e.to_string()))?;
            return Err(ProxyError::Upstream { status, body: bytes });
        }
        let upstream_request_id = header_string(upstream.headers(), "x-request-id");

        let (sender, receiver) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
        let billing = self.billing.clone();
        let stream_timeout = self.stream_timeout;
        let processor = provider.stream_processor();

        tokio::spawn(pump_stream(
            Box::pin(upstream.bytes_stream()),
            sender,
            processor,
            billing,
            settlement,
            stream_timeout,
            upstream_request_id,
        ));

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(ReceiverStream::new(receiver)))
            .map_err(|e| ProxyError::Network(e.to_string()))?;
        Ok(response)
    }
}

/// Forwards upstream chunks into the client channel, then runs the
/// end-of-stream ritual.
async fn pump_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    sender: mpsc::Sender<Result<Bytes, std::io::Error>>,
    mut processor: crate::billing::usage::SseStreamProcessor,
    billing: Arc<BillingEngine>,
    settlement: StreamSettlement,
    stream_timeout: Duration,
    upstream_request_id: Option<String>,
) {
    let mut watchdog_fired = false;
    loop {
        let chunk = tokio::time::timeout(stream_timeout, upstream.next()).await;
        match chunk {
            Err(_) => {
                tracing::warn!("stream watchdog fired, aborting upstream");
                watchdog_fired = true;
                break;
            }
            Ok(Some(Err(error))) => {
                tracing::warn!(%error, "upstream disconnected mid-stream");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(bytes))) => {
                processor.feed(&bytes);
                if sender.send(Ok(bytes)).await.is_err() {
                    // Client went away; the pending proposal stays until TTL
                    // or the next signed submission.
                    tracing::debug!("client disconnected, dropping stream");
                    return;
                }
            }
        }
    }

    if watchdog_fired {
        let frame = sse_error_frame(ErrorCode::NetworkError, "upstream stream timed out");
        let _ = sender.send(Ok(frame)).await;
    }

    let outcome = processor.finish();
    let mut billing_context = settlement.billing_context;
    billing_context.usage = outcome.usage;
    billing_context.provider_cost_pico_usd = outcome.provider_cost_pico_usd;

    // Stage one: publish the billing report before the stream closes.
    let cost = match billing.calc_cost(&billing_context).await {
        Ok(cost) => cost,
        Err(error) => {
            // Too late to fail the request; account nothing.
            tracing::error!(%error, "stream billing failed, no proposal issued");
            U256::ZERO
        }
    };
    let report = BillingReport {
        cost,
        usage: outcome.usage,
        bytes: outcome.bytes,
        upstream_request_id,
    };
    tracing::info!(
        operation = %billing_context.operation,
        cost = %report.cost,
        bytes = report.bytes,
        prompt_tokens = report.usage.map(|u| u.prompt_tokens),
        completion_tokens = report.usage.map(|u| u.completion_tokens),
        upstream_request_id = report.upstream_request_id.as_deref(),
        "stream settled"
    );
    let _ = settlement.report.set(report);

    // Stage two: emit the payment frame, then close.
    if !cost.is_zero() {
        match settlement.processor.finalize(&settlement.payment, cost) {
            Ok(envelope) => match envelope::encode_response(&envelope) {
                Ok(encoded) => {
                    let _ = sender.send(Ok(sse_payment_frame(&encoded))).await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to encode payment frame");
                }
            },
            Err(error) => {
                tracing::error!(%error, "failed to finalize stream payment");
            }
        }
    }
    // Dropping the sender closes the client stream.
}

/// The in-band settlement frame terminating a priced stream.
fn sse_payment_frame(encoded_envelope: &str) -> Bytes {
    Bytes::from(format!("event: payment\ndata: {encoded_envelope}\n\n"))
}

/// A stream-level error frame.
fn sse_error_frame(code: ErrorCode, message: &str) -> Bytes {
    let data = json!({ "errorCode": code, "message": message });
    Bytes::from(format!("event: error\ndata: {data}\n\n"))
}

fn header_string<K>(headers: &HeaderMap, key: K) -> Option<String>
where
    K: header::AsHeaderName,
{
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::pricing::{FixedRateProvider, PricingRegistry};
    use crate::billing::provider::ProviderKind;
    use std::collections::HashMap;

    fn engine_with_model(model: &str) -> Arc<BillingEngine> {
        let registry = PricingRegistry::new(U256::ZERO).with_model(
            model,
            crate::billing::pricing::PricingRule::PerRequestPicoUsd(U256::from(1u64)),
        );
        Arc::new(BillingEngine::new(
            registry,
            Arc::new(FixedRateProvider::new(HashMap::new())),
        ))
    }

    fn provider() -> Provider {
        Provider::new(
            "openai".to_string(),
            ProviderKind::OpenAiCompatible,
            url::Url::parse("https://api.openai.com/").unwrap(),
        )
    }

    #[test]
    fn test_validate_model_against_registry() {
        let proxy = LlmProxy::new(engine_with_model("gpt-test"), Duration::from_secs(30));
        assert!(proxy.validate_model(&provider(), Some("gpt-test")).is_ok());
        assert!(proxy.validate_model(&provider(), None).is_ok());
        assert!(matches!(
            proxy.validate_model(&provider(), Some("mystery")),
            Err(ProxyError::ModelNotSupported(_))
        ));
    }

    #[test]
    fn test_native_cost_provider_skips_registry_check() {
        let proxy = LlmProxy::new(engine_with_model("gpt-test"), Duration::from_secs(30));
        let native = provider().with_native_usd_cost(true);
        assert!(proxy.validate_model(&native, Some("mystery")).is_ok());
    }

    #[test]
    fn test_payment_frame_shape() {
        let frame = sse_payment_frame("b64payload");
        let text = std::str::from_utf8(&frame).unwrap();
        assert_eq!(text, "event: payment\ndata: b64payload\n\n");
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = sse_error_frame(ErrorCode::NetworkError, "upstream stream timed out");
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: error\ndata: "));
        assert!(text.contains("NETWORK_ERROR"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ProxyError::ModelNotSupported("m".to_string()).error_code(),
            ErrorCode::ModelNotSupported
        );
        assert_eq!(
            ProxyError::Network("down".to_string()).error_code(),
            ErrorCode::NetworkError
        );
        assert_eq!(
            ProxyError::Upstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: Bytes::new()
            }
            .error_code(),
            ErrorCode::UpstreamUnavailable
        );
    }
}
