//! Profile Store contract (spec.md §4.2) and its RocksDB-backed
//! implementation. RocksDB plays the role `badger` plays in the original
//! Go implementation: an embedded, ordered, byte-keyed LSM store that is
//! comfortable storing large values without excessive write amplification.

use std::path::Path;
use std::sync::Arc;

use common::error::{Error, Result};
use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, DBRawIterator, Options, DB,
};

use crate::key::{ProfileKey, RangeKey, KEY_PREFIX};

/// Outcome a scan visitor returns to request early termination, mirroring
/// the `stop` signal in spec.md §4.2's `scan(prefix, upper_bound, visitor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitResult {
    Continue,
    Stop,
}

pub trait ProfileStore: Send + Sync {
    /// Durable single-key insert; last-writer-wins on an exact key match.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Forward-iterate `prefix <= k < upper_bound`, calling `visitor` with
    /// borrowed key/value bytes valid only for that call.
    fn scan(
        &self,
        prefix: &[u8],
        upper_bound: &[u8],
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> VisitResult,
    ) -> Result<()>;

    /// Delete every key whose decoded `ts` is older than `now_ms -
    /// retention_ms`. Corruption is skipped, never repaired. Since `ts` is
    /// the leading field of the key encoding, expired keys form a single
    /// bounded prefix of the keyspace; the scan stops at the cutoff rather
    /// than visiting every live key behind it.
    fn gc(&self, now_ms: i64, retention_ms: i64) -> Result<u64>;
}

/// Large block size and a large blob threshold, matching the original's
/// `WithBlockSize(8 MiB)` / `WithValueThreshold(8 MiB)` tuning note:
/// profile payloads are large and should not blow up the LSM's sorted
/// blocks, nor should small index/metadata entries spill into the same
/// storage tier as multi-MiB pprof blobs.
const BLOCK_SIZE: usize = 8 * 1024 * 1024;
const MIN_BLOB_SIZE: u64 = 8 * 1024 * 1024;

pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(DBCompressionType::Zstd);
        opts.set_compression_options(-14, 10, 0, 0);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(BLOCK_SIZE);
        block_opts.set_block_cache(&Cache::new_lru_cache(256 * 1024 * 1024));
        opts.set_block_based_table_factory(&block_opts);

        opts.set_enable_blob_files(true);
        opts.set_min_blob_size(MIN_BLOB_SIZE);
        opts.set_blob_compression_type(DBCompressionType::Zstd);

        let db = DB::open(&opts, path).map_err(|e| Error::StorageWrite(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn raw_iter_from(&self, prefix: &[u8]) -> DBRawIterator<'_> {
        let mut it = self.db.raw_iterator();
        it.seek(prefix);
        it
    }
}

impl ProfileStore for RocksStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|e| Error::StorageWrite(e.to_string()))
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.db.get(key) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(Error::NotFound(format!("key {key:?} not found"))),
            Err(e) => Err(Error::StorageRead(e.to_string())),
        }
    }

    fn scan(
        &self,
        prefix: &[u8],
        upper_bound: &[u8],
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> VisitResult,
    ) -> Result<()> {
        let mut it = self.raw_iter_from(prefix);
        loop {
            if !it.valid() {
                break;
            }
            let (k, v) = match (it.key(), it.value()) {
                (Some(k), Some(v)) => (k, v),
                _ => break,
            };
            if k >= upper_bound {
                break;
            }
            if visitor(k, v) == VisitResult::Stop {
                break;
            }
            it.next();
        }
        it.status().map_err(|e| Error::StorageRead(e.to_string()))
    }

    fn gc(&self, now_ms: i64, retention_ms: i64) -> Result<u64> {
        let cutoff = now_ms.saturating_sub(retention_ms);
        // every key with `ts < cutoff` sorts strictly before this prefix
        // (ts is the key's leading field), so the scan can stop here
        // instead of walking past it into the still-live keyspace.
        let hi = RangeKey { ts: cutoff, ..Default::default() }.encode_prefix();

        let mut deleted = 0u64;
        let mut it = self.raw_iter_from(&[KEY_PREFIX]);
        let mut batch = rocksdb::WriteBatch::default();
        while it.valid() {
            let (k, _) = match (it.key(), it.value()) {
                (Some(k), Some(v)) => (k, v),
                _ => break,
            };
            if k >= hi.as_slice() {
                break;
            }
            match ProfileKey::decode(k) {
                Ok(decoded) if decoded.ts < cutoff => {
                    batch.delete(k);
                    deleted += 1;
                }
                Ok(_) => {}
                Err(_) => {
                    // corruption discovered during gc is logged and skipped,
                    // not repaired, per spec.md §7.
                    tracing::warn!("skipping malformed key during gc");
                }
            }
            it.next();
        }
        it.status().map_err(|e| Error::StorageRead(e.to_string()))?;
        self.db
            .write(batch)
            .map_err(|e| Error::StorageWrite(e.to_string()))?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ProfileKey, RangeKey};

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let key = ProfileKey::new(1000, "a", "cpu", "i1").encode();
        store.put(&key, b"payload").unwrap();
        assert_eq!(store.get(&key).unwrap(), b"payload");
    }

    #[test]
    fn scan_visits_ascending_in_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        for ts in [1000, 2000, 3000] {
            let key = ProfileKey::new(ts, "a", "cpu", "i1").encode();
            store.put(&key, format!("{ts}").as_bytes()).unwrap();
        }
        let lo = RangeKey {
            ts: 0,
            ..Default::default()
        }
        .encode_prefix();
        let hi = RangeKey {
            ts: 2500,
            ..Default::default()
        }
        .encode_prefix();
        let mut seen = vec![];
        store
            .scan(&lo, &hi, &mut |k, v| {
                seen.push((ProfileKey::decode(k).unwrap().ts, v.to_vec()));
                VisitResult::Continue
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1000);
        assert_eq!(seen[1].0, 2000);
    }

    #[test]
    fn gc_deletes_expired_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let old = ProfileKey::new(1000, "a", "cpu", "i1").encode();
        let fresh = ProfileKey::new(1_000_000, "a", "cpu", "i1").encode();
        store.put(&old, b"old").unwrap();
        store.put(&fresh, b"fresh").unwrap();

        let deleted = store.gc(1_000_000, 500_000).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(&old).is_err());
        assert_eq!(store.get(&fresh).unwrap(), b"fresh");
    }
}
