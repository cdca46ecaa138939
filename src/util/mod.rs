//! Utility types and functions for the gateway.
//!
//! - [`b64`] - Base64 codec for the payment header envelope
//! - [`num_str`] - Decimal-string serde for amounts and nonces
//! - [`shutdown`] - Signal-driven shutdown and background-task draining

pub mod b64;
pub mod num_str;
pub mod shutdown;
