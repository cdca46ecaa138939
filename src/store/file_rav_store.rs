//! File-backed RAV store for single-node production deployments.
//!
//! One JSON document per sub-channel under the store root, named by the
//! hex-encoded key so arbitrary channel ids stay filesystem-safe. Every
//! record field and the claimed cursor are preserved verbatim in the row
//! schema. Writes go through a temp file and rename, and are serialized per
//! key by an async mutex, so a crashed write never corrupts an existing log.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::rav::{ChannelId, SignedSubRav, SubChannelKey, VmIdFragment};
use crate::store::rav_store::{Admission, RavStore, RavStoreError, admit};

/// On-disk row schema for one sub-channel.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubChannelRow {
    channel_id: Option<ChannelId>,
    vm_id_fragment: Option<VmIdFragment>,
    /// Ascending by nonce.
    ravs: Vec<SignedSubRav>,
    claimed_nonce: Option<u64>,
}

/// [`RavStore`] persisting each sub-channel log as a JSON file.
pub struct FileRavStore {
    root: PathBuf,
    locks: DashMap<SubChannelKey, Arc<tokio::sync::Mutex<()>>>,
}

impl FileRavStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open<P: Into<PathBuf>>(root: P) -> Result<Self, RavStoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| RavStoreError::Backend(e.to_string()))?;
        Ok(FileRavStore {
            root,
            locks: DashMap::new(),
        })
    }

    fn path_for(&self, key: &SubChannelKey) -> PathBuf {
        let name = hex::encode(format!("{}|{}", key.channel_id, key.vm_id_fragment));
        self.root.join(format!("{name}.json"))
    }

    fn lock_for(&self, key: &SubChannelKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_row(path: &Path) -> Result<SubChannelRow, RavStoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| RavStoreError::Backend(e.to_string()))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(SubChannelRow::default())
            }
            Err(error) => Err(RavStoreError::Backend(error.to_string())),
        }
    }

    async fn write_row(path: &Path, row: &SubChannelRow) -> Result<(), RavStoreError> {
        let bytes =
            serde_json::to_vec(row).map_err(|e| RavStoreError::Backend(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| RavStoreError::Backend(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| RavStoreError::Backend(e.to_string()))
    }

    /// Reads every sub-channel row belonging to `channel_id`.
    async fn rows_of(&self, channel_id: &ChannelId) -> Result<Vec<SubChannelRow>, RavStoreError> {
        let mut rows = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| RavStoreError::Backend(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RavStoreError::Backend(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let row = Self::read_row(&path).await?;
            if row.channel_id.as_ref() == Some(channel_id) {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl RavStore for FileRavStore {
    async fn save(&self, rav: SignedSubRav) -> Result<(), RavStoreError> {
        let key = rav.sub_channel_key();
        let lock = self.lock_for(&key);
        let _serialized = lock.lock().await;

        let path = self.path_for(&key);
        let mut row = Self::read_row(&path).await?;
        match admit(row.ravs.last(), &rav)? {
            Admission::Duplicate => Ok(()),
            Admission::Append => {
                row.channel_id = Some(key.channel_id.clone());
                row.vm_id_fragment = Some(key.vm_id_fragment.clone());
                row.ravs.push(rav);
                Self::write_row(&path, &row).await
            }
        }
    }

    async fn latest(
        &self,
        channel_id: &ChannelId,
        vm_id_fragment: &VmIdFragment,
    ) -> Result<Option<SignedSubRav>, RavStoreError> {
        let key = SubChannelKey::new(channel_id.clone(), vm_id_fragment.clone());
        let row = Self::read_row(&self.path_for(&key)).await?;
        Ok(row.ravs.last().cloned())
    }

    async fn list(&self, channel_id: &ChannelId) -> Result<Vec<SignedSubRav>, RavStoreError> {
        let mut out = Vec::new();
        for row in self.rows_of(channel_id).await? {
            out.extend(row.ravs);
        }
        Ok(out)
    }

    async fn unclaimed(
        &self,
        channel_id: &ChannelId,
    ) -> Result<HashMap<VmIdFragment, SignedSubRav>, RavStoreError> {
        let mut out = HashMap::new();
        for row in self.rows_of(channel_id).await? {
            let Some(fragment) = row.vm_id_fragment.clone() else {
                continue;
            };
            if let Some(last) = row.ravs.last() {
                if last.nonce() > row.claimed_nonce.unwrap_or(0) {
                    out.insert(fragment, last.clone());
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
        let lock = self.lock_for(&key);
        let _serialized = lock.lock().await;

        let path = self.path_for(&key);
        let mut row = Self::read_row(&path).await?;
        row.channel_id.get_or_insert_with(|| key.channel_id.clone());
        row.vm_id_fragment
            .get_or_insert_with(|| key.vm_id_fragment.clone());
        row.claimed_nonce = Some(row.claimed_nonce.map_or(nonce, |existing| existing.max(nonce)));
        Self::write_row(&path, &row).await
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
                channel_id: ChannelId::new("ch-file"),
                channel_epoch: 0,
                vm_id_fragment: VmIdFragment::new("key-1"),
                accumulated_amount: U256::from(amount),
                nonce,
            },
            signature: RavSignature(vec![nonce as u8]),
        }
    }

    fn ch() -> ChannelId {
        ChannelId::new("ch-file")
    }

    fn vm() -> VmIdFragment {
        VmIdFragment::new("key-1")
    }

    async fn fresh_store(test: &str) -> FileRavStore {
        let root = std::env::temp_dir()
            .join("rav-gateway-store-tests")
            .join(format!("{}-{}", std::process::id(), test));
        let _ = tokio::fs::remove_dir_all(&root).await;
        FileRavStore::open(root).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_survives_reopen() {
        let store = fresh_store("reopen").await;
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(2, 150)).await.unwrap();
        store.mark_claimed(&ch(), &vm(), 1).await.unwrap();
        let root = store.root.clone();
        drop(store);

        let reopened = FileRavStore::open(root).await.unwrap();
        let latest = reopened.latest(&ch(), &vm()).await.unwrap().unwrap();
        assert_eq!(latest.nonce(), 2);
        let unclaimed = reopened.unclaimed(&ch()).await.unwrap();
        assert_eq!(unclaimed.get(&vm()).unwrap().nonce(), 2);
    }

    #[tokio::test]
    async fn test_idempotent_save_and_regression() {
        let store = fresh_store("idempotent").await;
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(1, 100)).await.unwrap();
        assert_eq!(store.list(&ch()).await.unwrap().len(), 1);

        let conflict = store.save(signed(1, 101)).await;
        assert!(matches!(conflict, Err(RavStoreError::Regression { .. })));
        assert!(store.save(signed(2, 99)).await.is_err());
    }

    #[tokio::test]
    async fn test_claimed_cursor_persists_and_never_regresses() {
        let store = fresh_store("cursor").await;
        store.save(signed(1, 100)).await.unwrap();
        store.save(signed(2, 150)).await.unwrap();
        store.mark_claimed(&ch(), &vm(), 2).await.unwrap();
        store.mark_claimed(&ch(), &vm(), 1).await.unwrap();
        assert!(store.unclaimed(&ch()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_spans_sub_channels() {
        let store = fresh_store("list").await;
        store.save(signed(1, 100)).await.unwrap();
        let mut other = signed(1, 40);
        other.sub_rav.vm_id_fragment = VmIdFragment::new("key-2");
        store.save(other).await.unwrap();
        assert_eq!(store.list(&ch()).await.unwrap().len(), 2);
        assert_eq!(store.unclaimed(&ch()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_sub_channel_reads_empty() {
        let store = fresh_store("empty").await;
        assert!(store.latest(&ch(), &vm()).await.unwrap().is_none());
        assert!(store.list(&ch()).await.unwrap().is_empty());
    }
}
