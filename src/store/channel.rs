//! Channel metadata and live sub-channel counters.
//!
//! The cache maps `channel_id → ChannelMetadata` and
//! `(channel_id, vm_id_fragment) → SubChannelState`. Reads are lock-free
//! snapshots; writes are serialized per key by the underlying shards. An
//! unseen sub-channel reads as a zero-valued record rather than an error,
//! which lets the processor treat first contact and steady state uniformly.

use alloy_primitives::U256;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::rav::{ChannelId, SubChannelKey, VmIdFragment};
use crate::timestamp::TimestampMs;
use crate::util::num_str;

/// Channel lifecycle status. Terminal on `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Closing,
    Closed,
}

/// Immutable channel facts captured when the channel is first observed.
/// Only `status` changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMetadata {
    pub channel_id: ChannelId,
    pub payer_did: String,
    pub payee_did: String,
    pub asset_id: String,
    pub open_epoch: u64,
    pub status: ChannelStatus,
}

/// Live counters for one sub-channel.
///
/// The payee side uses these to detect regressions; `last_claimed_amount` and
/// `last_confirmed_nonce` advance only when the claim scheduler settles
/// on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubChannelState {
    pub epoch: u64,
    #[serde(with = "num_str::u256_dec")]
    pub accumulated_amount: U256,
    pub nonce: u64,
    #[serde(with = "num_str::u256_dec")]
    pub last_claimed_amount: U256,
    pub last_confirmed_nonce: u64,
    pub last_updated: TimestampMs,
}

impl Default for SubChannelState {
    fn default() -> Self {
        SubChannelState {
            epoch: 0,
            accumulated_amount: U256::ZERO,
            nonce: 0,
            last_claimed_amount: U256::ZERO,
            last_confirmed_nonce: 0,
            last_updated: TimestampMs::default(),
        }
    }
}

/// Partial update merged into a [`SubChannelState`]. Absent fields keep their
/// current value; every merge bumps `last_updated`.
#[derive(Debug, Clone, Default)]
pub struct SubChannelStateUpdate {
    pub epoch: Option<u64>,
    pub accumulated_amount: Option<U256>,
    pub nonce: Option<u64>,
    pub last_claimed_amount: Option<U256>,
    pub last_confirmed_nonce: Option<u64>,
}

/// In-process cache of channel metadata and sub-channel counters.
#[derive(Debug, Default)]
pub struct ChannelStateCache {
    channels: DashMap<ChannelId, ChannelMetadata>,
    sub_channels: DashMap<SubChannelKey, SubChannelState>,
}

impl ChannelStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the channel metadata, if the channel has been observed.
    pub fn channel(&self, channel_id: &ChannelId) -> Option<ChannelMetadata> {
        self.channels.get(channel_id).map(|entry| entry.clone())
    }

    /// Records a channel on first observation. An existing entry wins: the
    /// metadata is immutable except for `status`.
    pub fn observe_channel(&self, metadata: ChannelMetadata) -> ChannelMetadata {
        self.channels
            .entry(metadata.channel_id.clone())
            .or_insert(metadata)
            .clone()
    }

    pub fn set_channel_status(&self, channel_id: &ChannelId, status: ChannelStatus) {
        if let Some(mut entry) = self.channels.get_mut(channel_id) {
            entry.status = status;
        }
    }

    /// Snapshot of the sub-channel counters. Unseen keys read as zero-valued.
    pub fn sub_channel_state(&self, key: &SubChannelKey) -> SubChannelState {
        self.sub_channels
            .get(key)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Merges a partial update into the sub-channel state and bumps
    /// `last_updated`.
    pub fn update_sub_channel_state(
        &self,
        key: &SubChannelKey,
        update: SubChannelStateUpdate,
    ) -> SubChannelState {
        let mut entry = self.sub_channels.entry(key.clone()).or_default();
        if let Some(epoch) = update.epoch {
            entry.epoch = epoch;
        }
        if let Some(amount) = update.accumulated_amount {
            entry.accumulated_amount = amount;
        }
        if let Some(nonce) = update.nonce {
            entry.nonce = nonce;
        }
        if let Some(amount) = update.last_claimed_amount {
            entry.last_claimed_amount = amount;
        }
        if let Some(nonce) = update.last_confirmed_nonce {
            entry.last_confirmed_nonce = nonce;
        }
        entry.last_updated = TimestampMs::now();
        entry.clone()
    }

    /// Sub-channels currently tracked for a channel.
    pub fn sub_channels_of(&self, channel_id: &ChannelId) -> Vec<(VmIdFragment, SubChannelState)> {
        self.sub_channels
            .iter()
            .filter(|entry| &entry.key().channel_id == channel_id)
            .map(|entry| (entry.key().vm_id_fragment.clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SubChannelKey {
        SubChannelKey::new(ChannelId::new("ch-1"), VmIdFragment::new("key-1"))
    }

    fn metadata() -> ChannelMetadata {
        ChannelMetadata {
            channel_id: ChannelId::new("ch-1"),
            payer_did: "did:example:payer".to_string(),
            payee_did: "did:example:payee".to_string(),
            asset_id: "pusd".to_string(),
            open_epoch: 0,
            status: ChannelStatus::Active,
        }
    }

    #[test]
    fn test_unseen_sub_channel_reads_zeroed() {
        let cache = ChannelStateCache::new();
        let state = cache.sub_channel_state(&key());
        assert_eq!(state.nonce, 0);
        assert_eq!(state.accumulated_amount, U256::ZERO);
        assert_eq!(state.last_claimed_amount, U256::ZERO);
    }

    #[test]
    fn test_partial_update_preserves_other_fields() {
        let cache = ChannelStateCache::new();
        cache.update_sub_channel_state(
            &key(),
            SubChannelStateUpdate {
                nonce: Some(3),
                accumulated_amount: Some(U256::from(300u64)),
                ..Default::default()
            },
        );
        let state = cache.update_sub_channel_state(
            &key(),
            SubChannelStateUpdate {
                last_claimed_amount: Some(U256::from(100u64)),
                last_confirmed_nonce: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(state.nonce, 3);
        assert_eq!(state.accumulated_amount, U256::from(300u64));
        assert_eq!(state.last_claimed_amount, U256::from(100u64));
        assert_eq!(state.last_confirmed_nonce, 1);
    }

    #[test]
    fn test_observe_channel_is_first_write_wins() {
        let cache = ChannelStateCache::new();
        cache.observe_channel(metadata());
        let mut second = metadata();
        second.payer_did = "did:example:other".to_string();
        let stored = cache.observe_channel(second);
        assert_eq!(stored.payer_did, "did:example:payer");
    }

    #[test]
    fn test_status_transition() {
        let cache = ChannelStateCache::new();
        cache.observe_channel(metadata());
        cache.set_channel_status(&ChannelId::new("ch-1"), ChannelStatus::Closed);
        assert_eq!(
            cache.channel(&ChannelId::new("ch-1")).unwrap().status,
            ChannelStatus::Closed
        );
    }
}
