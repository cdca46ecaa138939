//! The `X-Payment-Channel-Data` header envelope.
//!
//! Requests and responses share one header name. A request carries the wire
//! form of a [`SignedSubRav`]; a response carries an unsigned [`SubRav`]
//! proposal plus the amount debited for the current request, a service
//! transaction reference, and (on failure) an error code and message.
//!
//! The wire form is base64 over canonical JSON. Amounts and nonces travel as
//! decimal strings inside the JSON. Implementers on either side treat the
//! value as opaque; this module is the single place that produces and parses
//! it.

use alloy_primitives::U256;
use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::rav::{SignedSubRav, SubRav};
use crate::util::b64;
use crate::util::num_str;

/// Header name shared by the request and response envelope (case-insensitive
/// on the wire).
pub const PAYMENT_CHANNEL_HEADER: &str = "X-Payment-Channel-Data";

/// Request-side envelope: the signed RAV settling the previous proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub signed_sub_rav: SignedSubRav,
}

/// Response-side envelope: the next unsigned proposal and billing outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// The next proposal, absent when the request cost nothing or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_rav: Option<SubRav>,
    /// Cost of the current request in asset minor units.
    #[serde(with = "num_str::u256_dec")]
    pub amount_debited: U256,
    /// Monotonic per-process reference for support and reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_tx_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseEnvelope {
    /// Successful envelope carrying an optional next proposal.
    pub fn settled(sub_rav: Option<SubRav>, amount_debited: U256, service_tx_ref: String) -> Self {
        ResponseEnvelope {
            sub_rav,
            amount_debited,
            service_tx_ref: Some(service_tx_ref),
            error_code: None,
            message: None,
        }
    }

    /// Failure envelope: no proposal, no debit.
    pub fn failed(error_code: ErrorCode, message: String) -> Self {
        ResponseEnvelope {
            sub_rav: None,
            amount_debited: U256::ZERO,
            service_tx_ref: None,
            error_code: Some(error_code),
            message: Some(message),
        }
    }
}

/// Envelope parse failures, all reported as `400 InvalidHeader`.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payment header is not valid base64")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("payment header payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payment header is not a valid header value")]
    InvalidHeaderValue,
}

/// Serializes a request envelope to its opaque header string.
pub fn encode_request(envelope: &RequestEnvelope) -> Result<String, EnvelopeError> {
    let json = serde_json::to_vec(envelope)?;
    Ok(b64::encode_header(json))
}

/// Parses the opaque header string of a request envelope.
pub fn decode_request(value: &str) -> Result<RequestEnvelope, EnvelopeError> {
    let bytes = b64::decode_header(value)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Serializes a response envelope to its opaque header string.
pub fn encode_response(envelope: &ResponseEnvelope) -> Result<String, EnvelopeError> {
    let json = serde_json::to_vec(envelope)?;
    Ok(b64::encode_header(json))
}

/// Parses the opaque header string of a response envelope.
pub fn decode_response(value: &str) -> Result<ResponseEnvelope, EnvelopeError> {
    let bytes = b64::decode_header(value)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Reads the payment header from a request, if present.
pub fn header_value(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PAYMENT_CHANNEL_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// Builds the response header value for an envelope.
pub fn to_header_value(envelope: &ResponseEnvelope) -> Result<HeaderValue, EnvelopeError> {
    let encoded = encode_response(envelope)?;
    HeaderValue::from_str(&encoded).map_err(|_| EnvelopeError::InvalidHeaderValue)
}
