//! Wire-level error taxonomy for the payment channel gateway.
//!
//! Every client-visible failure carries one of these codes in the response
//! envelope, alongside the HTTP status it maps to. Protocol and pricing
//! errors are safe to retry with a corrected envelope and mutate no state;
//! storage failures surface as 500 with a correlation id; chain failures are
//! retried by the claim scheduler and never reach the request path.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Machine-readable error code carried in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol errors: client-visible, no state mutation.
    InvalidHeader,
    PaymentRequired,
    UnknownSubRav,
    TamperedSubRav,
    InvalidSignature,
    EpochMismatch,
    ChainMismatch,
    UnknownVersion,
    ChannelClosed,

    // Pricing errors: rejected before any upstream call.
    ModelNotSupported,
    MissingAssetId,

    // Request-shape errors on the proxy surface.
    InvalidRequest,

    // Routing and authorization.
    Unauthorized,
    UnknownProvider,

    // Server-side failures.
    PaymentProcessingFailed,
    InternalError,
    UpstreamUnavailable,
    NetworkError,
}

impl ErrorCode {
    /// The HTTP status this code is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidHeader
            | ErrorCode::UnknownSubRav
            | ErrorCode::TamperedSubRav
            | ErrorCode::InvalidSignature
            | ErrorCode::EpochMismatch
            | ErrorCode::ChainMismatch
            | ErrorCode::UnknownVersion
            | ErrorCode::ChannelClosed
            | ErrorCode::ModelNotSupported
            | ErrorCode::MissingAssetId
            | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::UnknownProvider => StatusCode::NOT_FOUND,
            ErrorCode::PaymentProcessingFailed | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::NetworkError => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Leverage serde to get the SCREAMING_SNAKE_CASE variant name.
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// Correlation id attached to 5xx responses so operators can match a client
/// report against the access log.
pub fn correlation_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(ErrorCode::UnknownSubRav.to_string(), "UNKNOWN_SUB_RAV");
        assert_eq!(ErrorCode::TamperedSubRav.to_string(), "TAMPERED_SUB_RAV");
        assert_eq!(
            serde_json::to_string(&ErrorCode::PaymentRequired).unwrap(),
            "\"PAYMENT_REQUIRED\""
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::PaymentRequired.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(ErrorCode::InvalidHeader.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::UnknownProvider.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::NetworkError.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::UpstreamUnavailable.status_code(), StatusCode::BAD_GATEWAY);
    }
}
