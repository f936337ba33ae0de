//! Async adapter over the embedded baseline store.
//!
//! All blocking redb calls run on the blocking worker pool so the watcher
//! pipeline never stalls on store I/O. Every put/delete is a single committed
//! write transaction; snapshots are redb read transactions and stay stable
//! against concurrent writes for their lifetime.

use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition};
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tracing::warn;

const BASELINE: TableDefinition<&str, &[u8]> = TableDefinition::new("baseline");

/// Depth of the channel feeding snapshot iteration to async consumers.
const ITER_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("store transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("store table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("store read/write failed: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("store commit failed: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid iteration pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("value for key {key:?} is not a valid {kind}")]
    Decode { key: String, kind: &'static str },

    #[error("iteration requested with an empty prefix")]
    EmptyPrefix,

    #[error("store worker task failed")]
    Worker,
}

/// Encode/decode pair for typed values in the store.
pub trait Codec {
    type Value;
    const KIND: &'static str;

    fn encode(value: &Self::Value) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Option<Self::Value>;
}

/// UTF-8 strings; used for fingerprints.
pub struct Utf8;

impl Codec for Utf8 {
    type Value = String;
    const KIND: &'static str = "utf-8 string";

    fn encode(value: &String) -> Vec<u8> {
        value.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<String> {
        std::str::from_utf8(bytes).ok().map(str::to_string)
    }
}

/// 4-byte little-endian IEEE-754 float; used for the initialization sentinel.
pub struct F32Le;

impl Codec for F32Le {
    type Value = f32;
    const KIND: &'static str = "little-endian f32";

    fn encode(value: &f32) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<f32> {
        let raw: [u8; 4] = bytes.try_into().ok()?;
        Some(f32::from_le_bytes(raw))
    }
}

/// Point-in-time read-only view of the store.
pub struct Snapshot {
    txn: ReadTransaction,
}

/// Handle to the process-singleton baseline store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open the store at `path`, creating it if missing. With `recreate`,
    /// any existing store file is discarded first.
    pub async fn open(path: impl Into<PathBuf>, recreate: bool) -> Result<Self, StoreError> {
        let path = path.into();
        task::spawn_blocking(move || {
            if recreate && path.exists() {
                std::fs::remove_file(&path)?;
            }
            let db = Database::create(&path)?;
            // Make sure the table exists so first reads don't error.
            let txn = db.begin_write()?;
            {
                let _table = txn.open_table(BASELINE)?;
            }
            txn.commit()?;
            Ok(Store { db: Arc::new(db) })
        })
        .await
        .map_err(|_| StoreError::Worker)?
    }

    /// Read and decode one key.
    pub async fn get<C: Codec>(&self, key: &str) -> Result<Option<C::Value>, StoreError> {
        let db = self.db.clone();
        let owned = key.to_string();
        let bytes = task::spawn_blocking(move || -> Result<Option<Vec<u8>>, StoreError> {
            let txn = db.begin_read()?;
            let table = txn.open_table(BASELINE)?;
            Ok(table.get(owned.as_str())?.map(|guard| guard.value().to_vec()))
        })
        .await
        .map_err(|_| StoreError::Worker)??;

        match bytes {
            None => Ok(None),
            Some(raw) => match C::decode(&raw) {
                Some(value) => Ok(Some(value)),
                None => Err(StoreError::Decode { key: key.to_string(), kind: C::KIND }),
            },
        }
    }

    /// Encode and write one key in its own committed transaction.
    pub async fn put<C: Codec>(&self, key: &str, value: &C::Value) -> Result<(), StoreError> {
        let db = self.db.clone();
        let owned = key.to_string();
        let encoded = C::encode(value);
        task::spawn_blocking(move || -> Result<(), StoreError> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(BASELINE)?;
                table.insert(owned.as_str(), encoded.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|_| StoreError::Worker)?
    }

    /// Delete one key. Deleting an absent key is a no-op.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let db = self.db.clone();
        let owned = key.to_string();
        task::spawn_blocking(move || -> Result<(), StoreError> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(BASELINE)?;
                table.remove(owned.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|_| StoreError::Worker)?
    }

    /// Take a point-in-time snapshot for iteration.
    pub async fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let db = self.db.clone();
        task::spawn_blocking(move || Ok(Snapshot { txn: db.begin_read()? }))
            .await
            .map_err(|_| StoreError::Worker)?
    }

    /// Narrow this handle to keys under `prefix`.
    pub fn prefixed(&self, prefix: impl Into<String>) -> PrefixedStore {
        PrefixedStore { store: self.clone(), prefix: prefix.into() }
    }

    /// Stream `(key, value)` pairs from a snapshot in key order.
    ///
    /// A key is yielded iff it matches every include pattern and none of the
    /// exclude patterns. With a prefix, the scan is restricted to keys that
    /// extend past the prefix (the `^<prefix>.+` include is implicit). The
    /// stream ends cleanly when the range is exhausted.
    pub fn iterate(
        &self,
        snapshot: Snapshot,
        includes: Vec<Regex>,
        excludes: Vec<Regex>,
        prefix: Option<String>,
    ) -> Result<mpsc::Receiver<(String, Vec<u8>)>, StoreError> {
        self.iterate_inner(snapshot, includes, excludes, prefix, false)
    }

    fn iterate_inner(
        &self,
        snapshot: Snapshot,
        includes: Vec<Regex>,
        excludes: Vec<Regex>,
        prefix: Option<String>,
        strip_prefix: bool,
    ) -> Result<mpsc::Receiver<(String, Vec<u8>)>, StoreError> {
        if prefix.as_deref() == Some("") {
            return Err(StoreError::EmptyPrefix);
        }

        let (tx, rx) = mpsc::channel(ITER_CHANNEL_DEPTH);
        task::spawn_blocking(move || {
            let table = match snapshot.txn.open_table(BASELINE) {
                Ok(table) => table,
                Err(e) => {
                    warn!(error = %e, "snapshot table open failed, ending iteration");
                    return;
                }
            };
            let range = match &prefix {
                Some(p) => table.range(p.as_str()..),
                None => table.range::<&str>(..),
            };
            let range = match range {
                Ok(range) => range,
                Err(e) => {
                    warn!(error = %e, "snapshot range failed, ending iteration");
                    return;
                }
            };

            for entry in range {
                let Ok((key_guard, value_guard)) = entry else {
                    // An invalid iterator state terminates the stream.
                    break;
                };
                let key = key_guard.value().to_string();
                if let Some(p) = &prefix {
                    // Keys are ordered, so the first key past the prefix
                    // range ends the scan. Equal-to-prefix keys are not
                    // part of the namespace.
                    if !key.starts_with(p.as_str()) {
                        break;
                    }
                    if key.len() == p.len() {
                        continue;
                    }
                }
                if !includes.iter().all(|re| re.is_match(&key)) {
                    continue;
                }
                if excludes.iter().any(|re| re.is_match(&key)) {
                    continue;
                }
                let out = match (&prefix, strip_prefix) {
                    (Some(p), true) => key[p.len()..].to_string(),
                    _ => key,
                };
                if tx.blocking_send((out, value_guard.value().to_vec())).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// View of the store whose keys are transparently namespaced under a prefix.
///
/// Carries no mutable state; clones share the underlying store handle.
#[derive(Clone)]
pub struct PrefixedStore {
    store: Store,
    prefix: String,
}

impl PrefixedStore {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get<C: Codec>(&self, key: &str) -> Result<Option<C::Value>, StoreError> {
        self.store.get::<C>(&self.full_key(key)).await
    }

    pub async fn put<C: Codec>(&self, key: &str, value: &C::Value) -> Result<(), StoreError> {
        self.store.put::<C>(&self.full_key(key), value).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(&self.full_key(key)).await
    }

    /// Snapshot-iterate this namespace, yielding keys with the prefix
    /// stripped. Exclude patterns match against the full (prefixed) key.
    pub async fn scan(
        &self,
        excludes: Vec<Regex>,
    ) -> Result<mpsc::Receiver<(String, Vec<u8>)>, StoreError> {
        let snapshot = self.store.snapshot().await?;
        self.store
            .iterate_inner(snapshot, Vec::new(), excludes, Some(self.prefix.clone()), true)
    }
}

/// Pattern matching exactly `prefix` + `key`, both taken literally.
pub fn exact_key_pattern(prefix: &str, key: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^{}{}$", regex::escape(prefix), regex::escape(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db"), false).await.unwrap();
        (dir, store)
    }

    async fn collect(mut rx: mpsc::Receiver<(String, Vec<u8>)>) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_utf8_codec_round_trip() {
        for value in ["", "plain", "påth/wïth/ünicode", "/etc/passwd"] {
            let owned = value.to_string();
            assert_eq!(Utf8::decode(&Utf8::encode(&owned)), Some(owned));
        }
    }

    #[test]
    fn test_f32_codec_round_trip() {
        for value in [0.0f32, -1.5, 1.7e9, f32::MAX] {
            assert_eq!(F32Le::decode(&F32Le::encode(&value)), Some(value));
        }
    }

    #[test]
    fn test_f32_codec_is_four_bytes() {
        assert_eq!(F32Le::encode(&1.0).len(), 4);
        assert_eq!(F32Le::encode(&1.0), 1.0f32.to_le_bytes().to_vec());
        assert!(F32Le::decode(b"12345678").is_none());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_dir, store) = open_temp().await;
        store.put::<Utf8>("k", &"v".to_string()).await.unwrap();
        assert_eq!(store.get::<Utf8>("k").await.unwrap(), Some("v".to_string()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get::<Utf8>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.get::<Utf8>("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_decode_mismatch_errors() {
        let (_dir, store) = open_temp().await;
        store.put::<Utf8>("k", &"not four bytes".to_string()).await.unwrap();
        assert!(matches!(
            store.get::<F32Le>("k").await,
            Err(StoreError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_recreate_discards_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = Store::open(&path, false).await.unwrap();
            store.put::<Utf8>("k", &"v".to_string()).await.unwrap();
        }
        let store = Store::open(&path, true).await.unwrap();
        assert_eq!(store.get::<Utf8>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefixed_view_namespaces_keys() {
        let (_dir, store) = open_temp().await;
        let view = store.prefixed("w1_");
        view.put::<Utf8>("/a", &"fp".to_string()).await.unwrap();

        // The raw key carries the prefix; the view strips it.
        assert_eq!(store.get::<Utf8>("w1_/a").await.unwrap(), Some("fp".to_string()));
        assert_eq!(view.get::<Utf8>("/a").await.unwrap(), Some("fp".to_string()));
        assert_eq!(store.prefixed("w2_").get::<Utf8>("/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_against_writes() {
        let (_dir, store) = open_temp().await;
        store.put::<Utf8>("a", &"1".to_string()).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        store.put::<Utf8>("b", &"2".to_string()).await.unwrap();

        let seen = collect(store.iterate(snapshot, vec![], vec![], None).unwrap()).await;
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a"]);
    }

    #[tokio::test]
    async fn test_iterate_yields_in_key_order() {
        let (_dir, store) = open_temp().await;
        for key in ["c", "a", "b"] {
            store.put::<Utf8>(key, &"v".to_string()).await.unwrap();
        }
        let snapshot = store.snapshot().await.unwrap();
        let seen = collect(store.iterate(snapshot, vec![], vec![], None).unwrap()).await;
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_iterate_filters_includes_and_excludes() {
        let (_dir, store) = open_temp().await;
        for key in ["w1_/a.txt", "w1_/b.log", "w1_initialized", "w2_/c.txt"] {
            store.put::<Utf8>(key, &"v".to_string()).await.unwrap();
        }
        let snapshot = store.snapshot().await.unwrap();
        let includes = vec![Regex::new(r"\.txt$").unwrap()];
        let excludes = vec![Regex::new("^w2_").unwrap()];
        let seen = collect(store.iterate(snapshot, includes, excludes, None).unwrap()).await;
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["w1_/a.txt"]);
    }

    #[tokio::test]
    async fn test_iterate_includes_are_conjunctive() {
        let (_dir, store) = open_temp().await;
        for key in ["a_1.txt", "a_2.log", "b_1.txt"] {
            store.put::<Utf8>(key, &"v".to_string()).await.unwrap();
        }
        let snapshot = store.snapshot().await.unwrap();
        let includes = vec![Regex::new("^a_").unwrap(), Regex::new(r"\.txt$").unwrap()];
        let seen = collect(store.iterate(snapshot, includes, vec![], None).unwrap()).await;
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a_1.txt"]);
    }

    #[tokio::test]
    async fn test_iterate_with_prefix_restricts_range() {
        let (_dir, store) = open_temp().await;
        for key in ["w1_/a", "w1_/b", "w2_/c", "w10_/d"] {
            store.put::<Utf8>(key, &"v".to_string()).await.unwrap();
        }
        let snapshot = store.snapshot().await.unwrap();
        let seen =
            collect(store.iterate(snapshot, vec![], vec![], Some("w1_".to_string())).unwrap())
                .await;
        let keys: Vec<_> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["w1_/a", "w1_/b"]);
    }

    #[tokio::test]
    async fn test_empty_prefix_is_rejected() {
        let (_dir, store) = open_temp().await;
        let snapshot = store.snapshot().await.unwrap();
        assert!(matches!(
            store.iterate(snapshot, vec![], vec![], Some(String::new())),
            Err(StoreError::EmptyPrefix)
        ));
    }

    #[tokio::test]
    async fn test_scan_strips_prefix_and_excludes_sentinel() {
        let (_dir, store) = open_temp().await;
        let view = store.prefixed("watch_etc_");
        view.put::<Utf8>("/etc/hosts", &"fp1".to_string()).await.unwrap();
        view.put::<F32Le>("initialized", &1.0).await.unwrap();

        let exclude = exact_key_pattern("watch_etc_", "initialized").unwrap();
        let seen = collect(view.scan(vec![exclude]).await.unwrap()).await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "/etc/hosts");
        assert_eq!(seen[0].1, b"fp1".to_vec());
    }
}
