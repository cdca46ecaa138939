//! Off-chain payment channel gateway for metered HTTP/LLM traffic.
//!
//! This crate implements a deferred-payment protocol layered onto HTTP:
//! every priced request carries a signed receipt (a **SubRAV**, sub-channel
//! Receipt-And-Value record) settling the previous response's proposal, and
//! every priced response carries the next unsigned proposal. Accepted
//! receipts accumulate off-chain and are settled on-chain in batches by an
//! event-driven claim scheduler.
//!
//! # Architecture
//!
//! - [`rav`] — the SubRAV data model and its canonical byte codec (the
//!   signature domain).
//! - [`envelope`] — the `X-Payment-Channel-Data` header envelope shared by
//!   requests and responses.
//! - [`verify`] — canonical re-encoding plus version/chain/epoch checks,
//!   with the cryptographic signature check delegated to an external DID
//!   resolver.
//! - [`store`] — the three shared stores: the durable monotonic RAV log,
//!   the short-lived pending-proposal store, and the channel state cache.
//! - [`processor`] — the deferred-payment state machine driven by incoming
//!   requests.
//! - [`claims`] — the claim scheduler settling accepted RAVs on-chain with
//!   bounded concurrency, retries, and exponential backoff.
//! - [`billing`] — pricing rules, usage extraction, and the provider
//!   registry.
//! - [`proxy`] — the streaming-aware reverse proxy in front of LLM
//!   upstreams.
//! - [`handlers`] — the Axum routes wiring it all together.
//! - [`chain`] — the boundary trait to the on-chain contract runtime.
//! - [`config`], [`telemetry`], [`util`] — the ambient stack.
//!
//! # Protocol invariants
//!
//! Within one sub-channel, accepted nonces are strictly increasing and
//! accumulated amounts never decrease; a signed record is only accepted if a
//! matching unsigned proposal was previously offered (or it is an exact
//! re-submission of the latest accepted record); at most one on-chain claim
//! is in flight per sub-channel at any instant.

pub mod billing;
pub mod chain;
pub mod claims;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod processor;
pub mod proxy;
pub mod rav;
pub mod store;
pub mod telemetry;
pub mod timestamp;
pub mod util;
pub mod verify;
