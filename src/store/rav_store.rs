//! Durable log of signed RAVs, keyed by sub-channel.
//!
//! The log is append-only and strictly monotonic per key: nonces increase,
//! accumulated amounts never shrink. A per-key scalar, the claimed cursor,
//! records the highest nonce whose amount has been settled on-chain. `save`
//! is idempotent so a client may safely retry the same signed record after a
//! downstream failure.
//!
//! Two kinds of implementation are expected: the in-memory store below for
//! tests and single-node deployments, and a keyed persistent store for
//! production. Implementations must serialize `save` and `mark_claimed` per
//! key; reads may be lock-free snapshots.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

use crate::rav::{ChannelId, SignedSubRav, SubChannelKey, VmIdFragment};

/// Errors surfaced by a RAV store.
#[derive(Debug, thiserror::Error)]
pub enum RavStoreError {
    /// The record would break per-sub-channel monotonicity: a nonce at or
    /// below an already-stored nonce with a different payload, or an
    /// accumulated amount below the stored maximum.
    #[error("monotonicity violation for {key} at nonce {nonce}")]
    Regression { key: SubChannelKey, nonce: u64 },
    /// Transient backend failure; retried internally by callers with short
    /// backoff and surfaced as 500 if unresolved.
    #[error("rav store backend failure: {0}")]
    Backend(String),
}

/// Durable, idempotent, per-sub-channel monotonic log of signed RAVs.
#[async_trait]
pub trait RavStore: Send + Sync {
    /// Persists a signed RAV. Saving a record identical to one already
    /// stored at the same nonce is a no-op; any other reuse or rollback of a
    /// nonce is a [`RavStoreError::Regression`].
    async fn save(&self, rav: SignedSubRav) -> Result<(), RavStoreError>;

    /// The highest-nonce record for a sub-channel.
    async fn latest(
        &self,
        channel_id: &ChannelId,
        vm_id_fragment: &VmIdFragment,
    ) -> Result<Option<SignedSubRav>, RavStoreError>;

    /// All records of a channel. Ordering is stable within one sub-channel
    /// (ascending nonce) and unspecified across sub-channels.
    async fn list(&self, channel_id: &ChannelId) -> Result<Vec<SignedSubRav>, RavStoreError>;

    /// For each sub-channel of the channel, the highest-nonce record not yet
    /// covered by the claimed cursor.
    async fn unclaimed(
        &self,
        channel_id: &ChannelId,
    ) -> Result<HashMap<VmIdFragment, SignedSubRav>, RavStoreError>;

    /// Advances the claimed cursor to `max(existing, nonce)`.
    async fn mark_claimed(
        &self,
        channel_id: &ChannelId,
        vm_id_fragment: &VmIdFragment,
        nonce: u64,
    ) -> Result<(), RavStoreError>;
}

/// Outcome of checking a record against the tail of a sub-channel log.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Append,
    Duplicate,
}

/// Monotonicity gate shared by store implementations: a record may only
/// append past the current tail, repeat it exactly, or be rejected.
pub(crate) fn admit(
    last: Option<&SignedSubRav>,
    rav: &SignedSubRav,
) -> Result<Admission, RavStoreError> {
    let Some(last) = last else {
        return Ok(Admission::Append);
    };
    if rav.nonce() == last.nonce() {
        return if rav == last {
            Ok(Admission::Duplicate)
        } else {
            Err(RavStoreError::Regression {
                key: rav.sub_channel_key(),
                nonce: rav.nonce(),
            })
        };
    }
    if rav.nonce() < last.nonce() || rav.accumulated_amount() < last.accumulated_amount() {
        return Err(RavStoreError::Regression {
            key: rav.sub_channel_key(),
            nonce: rav.nonce(),
        });
    }
    Ok(Admission::Append)
}

#[derive(Debug, Default)]
struct SubChannelLog {
    /// Ascending by nonce.
    ravs: Vec<SignedSubRav>,
    claimed_nonce: Option<u64>,
}

/// In-memory [`RavStore`]. Writes to one key are serialized by the map shard
/// they land on; no await points occur under the shard lock.
#[derive(Debug, Default)]
pub struct MemoryRavStore {
    logs: DashMap<SubChannelKey, SubChannelLog>,
}

impl MemoryRavStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RavStore for MemoryRavStore {
    async fn save(&self, rav: SignedSubRav) -> Result<(), RavStoreError> {
        let key = rav.sub_channel_key();
        let mut log = self.logs.entry(key).or_default();
        match admit(log.ravs.last(), &rav)? {
            Admission::Duplicate => Ok(()),
            Admission::Append => {
                log.ravs.push(rav);
                Ok(())
            }
        }
    }

    async fn latest(
        &self,
        channel_id: &ChannelId,
        vm_id_fragment: &VmIdFragment,
    ) -> Result<Option<SignedSubRav>, RavStoreError> {
        let key = SubChannelKey::new(channel_id.clone(), vm_id_fragment.clone());
        Ok(self
            .logs
            .get(&key)
            .and_then(|log| log.ravs.last().cloned()))
    }

    async fn list(&self, channel_id: &ChannelId) -> Result<Vec<SignedSubRav>, RavStoreError> {
        let mut out = Vec::new();
        for entry in self.logs.iter() {
            if &entry.key().channel_id == channel_id {
                out.extend(entry.value().ravs.iter().cloned());
            }
        }
        Ok(out)
    }

    async fn unclaimed(
        &self,
        channel_id: &ChannelId,
    ) -> Result<HashMap<VmIdFragment, SignedSubRav>, RavStoreError> {
        let mut out = HashMap::new();
        for entry in self.logs.iter() {
            if &entry.key().channel_id != channel_id {
                continue;
            }
            let log = entry.value();
            if let Some(last) = log.ravs.last() {
                if last.nonce() > log.claimed_nonce.unwrap_or(0) {
                    out.insert(entry.key().vm_id_fragment.clone(), last.clone());
                }
            }
        }
        Ok(out)
    }

    async fn mark_claimed(
        &self,
        channel_id: &ChannelId,
        vm_id_fragment: &VmIdFragment,
        nonce: u64,
    ) -> Result<(), RavStoreError> {
        let key = SubChannelKey::new(channel_id.clone(), vm_id_fragment.clone());
        let mut log = self.logs.entry(key).or_default();
        let next = log.claimed_nonce.map_or(nonce, |existing| existing.max(nonce));
        log.claimed_nonce = Some(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rav::{CODEC_VERSION, RavSignature, SubRav};
    use alloy_primitives::U256;

    fn signed(nonce: u64, amount: u64) -> SignedSubRav {
        SignedSubRav {
            sub_rav: SubRav {
                version: CODEC_VERSION,
                chain_id: 4,
                channel_id: ChannelId::new("ch-1"),
                channel_epoch: 0,
                vm_id_fragment: VmIdFragment::new("key-1"),
                accumulated_amount: U256::from(amount),
                nonce,
            },
            signature: RavSignature(vec![nonce as u8]),
        }
    }

    fn ch() -> ChannelId {
        ChannelId::new("ch-1")
    }

    fn vm() -> VmIdFragment {
        VmIdFragment::new("key-1")
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = MemoryRavStore::new();
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(1, 100)).await.unwrap();
        assert_eq!(store.list(&ch()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_nonce_different_payload_is_regression() {
        let store = MemoryRavStore::new();
        store.save(signed(1, 100)).await.unwrap();
        let result = store.save(signed(1, 101)).await;
        assert!(matches!(result, Err(RavStoreError::Regression { nonce: 1, .. })));
        // No mutation on rejection.
        assert_eq!(
            store.latest(&ch(), &vm()).await.unwrap().unwrap().accumulated_amount(),
            U256::from(100u64)
        );
    }

    #[tokio::test]
    async fn test_lower_nonce_is_regression() {
        let store = MemoryRavStore::new();
        store.save(signed(2, 200)).await.unwrap();
        assert!(store.save(signed(1, 100)).await.is_err());
    }

    #[tokio::test]
    async fn test_shrinking_amount_is_regression() {
        let store = MemoryRavStore::new();
        store.save(signed(1, 100)).await.unwrap();
        assert!(store.save(signed(2, 99)).await.is_err());
    }

    #[tokio::test]
    async fn test_latest_returns_highest_nonce() {
        let store = MemoryRavStore::new();
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(2, 150)).await.unwrap();
        let latest = store.latest(&ch(), &vm()).await.unwrap().unwrap();
        assert_eq!(latest.nonce(), 2);
    }

    #[tokio::test]
    async fn test_unclaimed_respects_cursor() {
        let store = MemoryRavStore::new();
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(2, 150)).await.unwrap();

        let unclaimed = store.unclaimed(&ch()).await.unwrap();
        assert_eq!(unclaimed.get(&vm()).unwrap().nonce(), 2);

        store.mark_claimed(&ch(), &vm(), 2).await.unwrap();
        assert!(store.unclaimed(&ch()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_claimed_never_regresses() {
        let store = MemoryRavStore::new();
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(2, 150)).await.unwrap();
        store.mark_claimed(&ch(), &vm(), 2).await.unwrap();
        store.mark_claimed(&ch(), &vm(), 1).await.unwrap();
        assert!(store.unclaimed(&ch()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_is_stable_within_sub_channel() {
        let store = MemoryRavStore::new();
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(2, 150)).await.unwrap();
        store.save(signed(3, 150)).await.unwrap();
        let nonces: Vec<u64> = store
            .list(&ch())
            .await
            .unwrap()
            .iter()
            .map(|r| r.nonce())
            .collect();
        assert_eq!(nonces, vec![1, 2, 3]);
    }
}
