//! LMDB-backed rollup store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep materialized
//! partitions in a memory-mapped file, so built rollups survive restarts.
//!
//! # Key Format
//!
//! `[pre_aggregation_id bytes][0xFF][partition key bytes]`
//!
//! `0xFF` never appears in UTF-8 text, so the prefix `[id][0xFF]` selects
//! exactly one pre-aggregation's partitions and LMDB's sorted keys keep them
//! contiguous.
//!
//! # Value Format
//!
//! JSON of [`StoredPartition`] (rows plus build metadata).

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use prism_core::{
    PartitionKey, PreAggregationId, PrismError, PrismResult, ResultRow, StorageError,
};

use crate::backend::{PartitionMeta, RollupStore, StoredPartition};

/// Separator between the pre-aggregation id and the partition key.
const SEPARATOR: u8 = 0xFF;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for PrismError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Serialization(reason) => {
                PrismError::Storage(StorageError::Serialization { reason })
            }
            other => PrismError::Storage(StorageError::TransactionFailed {
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// Encode `(id, partition)` into an LMDB key.
pub fn encode_key(id: &PreAggregationId, partition: &PartitionKey) -> Vec<u8> {
    let mut key = id_prefix(id);
    key.extend_from_slice(partition.as_str().as_bytes());
    key
}

/// Key prefix shared by every partition of `id`.
pub fn id_prefix(id: &PreAggregationId) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(id.as_str().len() + 1);
    prefix.extend_from_slice(id.as_str().as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// Partition part of an encoded key, `None` if the key is malformed.
fn decode_partition(key: &[u8]) -> Option<&str> {
    let pos = key.iter().position(|b| *b == SEPARATOR)?;
    std::str::from_utf8(&key[pos + 1..]).ok()
}

/// LMDB rollup store.
///
/// # Example
///
/// ```ignore
/// let store = LmdbRollupStore::new("/var/lib/prism/rollups", 1024)?;
/// store.write_partition(&id, &partition, rows, meta).await?;
/// ```
pub struct LmdbRollupStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbRollupStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the map in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the directory is owned by this store; no other process maps
        // it with different options.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self { env, db })
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for entry in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, _) = entry.map_err(txn_err)?;
            if key.starts_with(prefix) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    /// Drop every partition of `id`. Returns the number removed.
    pub fn drop_all(&self, id: &PreAggregationId) -> Result<u64, LmdbStoreError> {
        let keys = self.keys_with_prefix(&id_prefix(id))?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key.as_slice()).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }
}

#[async_trait]
impl RollupStore for LmdbRollupStore {
    async fn read_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
    ) -> PrismResult<Option<StoredPartition>> {
        let key = encode_key(id, partition);
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.db.get(&rtxn, key.as_slice()).map_err(txn_err)? {
            Some(bytes) => {
                let stored: StoredPartition = serde_json::from_slice(bytes)
                    .map_err(|e| LmdbStoreError::Serialization(e.to_string()))?;
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }

    async fn write_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
        rows: Vec<ResultRow>,
        meta: PartitionMeta,
    ) -> PrismResult<()> {
        let key = encode_key(id, partition);
        let value = serde_json::to_vec(&StoredPartition { rows, meta })
            .map_err(|e| LmdbStoreError::Serialization(e.to_string()))?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, key.as_slice(), value.as_slice())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(
            pre_aggregation = %id,
            partition = %partition,
            bytes = value.len(),
            "Partition written"
        );
        Ok(())
    }

    async fn drop_partition(
        &self,
        id: &PreAggregationId,
        partition: &PartitionKey,
    ) -> PrismResult<bool> {
        let key = encode_key(id, partition);
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, key.as_slice()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    async fn list_partitions(&self, id: &PreAggregationId) -> PrismResult<Vec<PartitionKey>> {
        let keys = self.keys_with_prefix(&id_prefix(id))?;
        let mut partitions = Vec::with_capacity(keys.len());
        for key in &keys {
            match decode_partition(key) {
                Some(p) => partitions.push(PartitionKey::parse(p)),
                None => tracing::warn!(pre_aggregation = %id, "Skipping malformed partition key"),
            }
        }
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use prism_core::Granularity;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbRollupStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbRollupStore::new(temp_dir.path(), 10).expect("store should open");
        (store, temp_dir)
    }

    fn meta() -> PartitionMeta {
        PartitionMeta {
            job_id: prism_core::new_id(),
            refresh_key: Some(prism_core::RefreshKeyValue::Epoch(7)),
            built_at: Utc::now(),
            range: None,
        }
    }

    fn row(amount: f64) -> ResultRow {
        ResultRow {
            dimensions: BTreeMap::from([("orders.status".to_string(), serde_json::json!("paid"))]),
            time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            measures: BTreeMap::from([("orders.amount".to_string(), amount)]),
        }
    }

    fn day_key(d: u32) -> PartitionKey {
        PartitionKey::for_start(Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap(), Granularity::Day)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (store, _dir) = create_test_store();
        let id = PreAggregationId::new("orders.by_day");

        store
            .write_partition(&id, &day_key(1), vec![row(10.0)], meta())
            .await
            .unwrap();

        let stored = store.read_partition(&id, &day_key(1)).await.unwrap().unwrap();
        assert_eq!(stored.rows, vec![row(10.0)]);
        assert_eq!(stored.meta.refresh_key, Some(prism_core::RefreshKeyValue::Epoch(7)));
        assert!(store.read_partition(&id, &day_key(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_rows() {
        let (store, _dir) = create_test_store();
        let id = PreAggregationId::new("orders.by_day");

        store.write_partition(&id, &day_key(1), vec![row(1.0)], meta()).await.unwrap();
        store.write_partition(&id, &day_key(1), vec![row(2.0)], meta()).await.unwrap();

        let stored = store.read_partition(&id, &day_key(1)).await.unwrap().unwrap();
        assert_eq!(stored.rows, vec![row(2.0)]);
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_pre_aggregation() {
        let (store, _dir) = create_test_store();
        let a = PreAggregationId::new("orders.by_day");
        let b = PreAggregationId::new("orders.by_day_and_city");

        for d in 1..=3 {
            store.write_partition(&a, &day_key(d), vec![], meta()).await.unwrap();
        }
        store.write_partition(&b, &day_key(1), vec![], meta()).await.unwrap();

        let listed = store.list_partitions(&a).await.unwrap();
        assert_eq!(listed, vec![day_key(1), day_key(2), day_key(3)]);
        assert_eq!(store.list_partitions(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_partition_and_drop_all() {
        let (store, _dir) = create_test_store();
        let id = PreAggregationId::new("orders.by_day");
        for d in 1..=3 {
            store.write_partition(&id, &day_key(d), vec![], meta()).await.unwrap();
        }

        assert!(store.drop_partition(&id, &day_key(2)).await.unwrap());
        assert!(!store.drop_partition(&id, &day_key(2)).await.unwrap());
        assert_eq!(store.drop_all(&id).unwrap(), 2);
        assert!(store.list_partitions(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let id = PreAggregationId::new("orders.by_day");
        {
            let store = LmdbRollupStore::new(temp_dir.path(), 10).unwrap();
            store.write_partition(&id, &day_key(1), vec![row(3.0)], meta()).await.unwrap();
        }
        let store = LmdbRollupStore::new(temp_dir.path(), 10).unwrap();
        assert!(store.read_partition(&id, &day_key(1)).await.unwrap().is_some());
    }

    #[test]
    fn test_prefix_excludes_longer_ids() {
        let a = PreAggregationId::new("orders.by_day");
        let b = PreAggregationId::new("orders.by_day_and_city");
        let key_b = encode_key(&b, &PartitionKey::whole());
        assert!(!key_b.starts_with(&id_prefix(&a)));
    }
}
