//! Shared mutable state of the gateway.
//!
//! Three stores back the payment processor and the claim scheduler:
//!
//! - [`rav_store`] — durable, idempotent, per-sub-channel monotonic log of
//!   signed RAVs plus the claimed cursor.
//! - [`pending`] — short-lived unsigned proposals awaiting a client signature.
//! - [`channel`] — channel metadata and live per-sub-channel counters.
//!
//! Each store guarantees per-key serialization of its writes; callers rely on
//! that instead of holding external locks.

pub mod channel;
pub mod file_rav_store;
pub mod pending;
pub mod rav_store;

pub use channel::{ChannelMetadata, ChannelStateCache, ChannelStatus, SubChannelState, SubChannelStateUpdate};
pub use file_rav_store::FileRavStore;
pub use pending::{PendingProposal, PendingProposalStore, PendingStats};
pub use rav_store::{MemoryRavStore, RavStore, RavStoreError};
