//! Short-lived store of unsigned RAV proposals awaiting a client signature.
//!
//! Keyed by `(channel_id, nonce)`. Separating pending proposals from signed
//! receipts decouples the request/response lifecycle from the durability of
//! settled RAVs and allows aggressive garbage collection without risking
//! replay: an expired proposal simply makes the next signed submission an
//! `UnknownSubRav`.

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

use crate::rav::{ChannelId, SubRav};
use crate::timestamp::TimestampMs;

/// An unsigned proposal offered to the client, waiting for its signed
/// counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProposal {
    pub sub_rav: SubRav,
    pub created_at: TimestampMs,
}

/// Aggregate counters for observability and the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStats {
    pub count: usize,
    pub oldest_created_at: Option<TimestampMs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    channel_id: ChannelId,
    nonce: u64,
}

/// In-memory pending-proposal store.
#[derive(Debug, Default)]
pub struct PendingProposalStore {
    entries: DashMap<PendingKey, PendingProposal>,
}

impl PendingProposalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a proposal, overwriting any entry at the same key.
    pub fn save(&self, sub_rav: SubRav) {
        let key = PendingKey {
            channel_id: sub_rav.channel_id.clone(),
            nonce: sub_rav.nonce,
        };
        self.entries.insert(
            key,
            PendingProposal {
                sub_rav,
                created_at: TimestampMs::now(),
            },
        );
    }

    pub fn find(&self, channel_id: &ChannelId, nonce: u64) -> Option<SubRav> {
        let key = PendingKey {
            channel_id: channel_id.clone(),
            nonce,
        };
        self.entries.get(&key).map(|entry| entry.sub_rav.clone())
    }

    pub fn remove(&self, channel_id: &ChannelId, nonce: u64) -> Option<SubRav> {
        let key = PendingKey {
            channel_id: channel_id.clone(),
            nonce,
        };
        self.entries.remove(&key).map(|(_, entry)| entry.sub_rav)
    }

    /// The highest-nonce proposal currently pending for a channel. Used by
    /// the recovery endpoint when a client lost its local copy.
    pub fn latest_for_channel(&self, channel_id: &ChannelId) -> Option<SubRav> {
        self.entries
            .iter()
            .filter(|entry| &entry.key().channel_id == channel_id)
            .max_by_key(|entry| entry.key().nonce)
            .map(|entry| entry.sub_rav.clone())
    }

    /// Removes entries older than `max_age` and returns how many were
    /// dropped.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = TimestampMs::now();
        let cutoff = max_age.as_millis() as u64;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_elapsed_since(entry.created_at) <= cutoff);
        before - self.entries.len()
    }

    pub fn stats(&self) -> PendingStats {
        let oldest = self
            .entries
            .iter()
            .map(|entry| entry.created_at)
            .min();
        PendingStats {
            count: self.entries.len(),
            oldest_created_at: oldest,
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Runs `cleanup(max_age)` once a minute until cancellation.
    pub async fn run_sweeper(
        self: std::sync::Arc<Self>,
        max_age: Duration,
        cancellation_token: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.cleanup(max_age);
                    if removed > 0 {
                        tracing::info!(removed, "expired pending proposals");
                    }
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
    }
}
