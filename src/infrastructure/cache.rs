use crate::core::models::{CacheConfig, CompiledOutput};
use crate::utils::{CacheError, Logger};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Content-addressed store of transform outputs, keyed by
/// (raw content hash, pipeline fingerprint).
///
/// A `DashMap` hot layer sits over an optional sled database. Recency is tracked
/// with a logical clock; entries are only dropped by `evict`, which the build
/// driver calls once a build has finished.
pub struct TransformCache {
    hot: DashMap<String, Arc<CompiledOutput>>,
    meta: DashMap<String, EntryMeta>,
    clock: AtomicU64,
    persistent: Option<PersistentStore>,
    max_entries: usize,
    max_bytes: u64,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct EntryMeta {
    size: u64,
    last_used: u64,
}

/// On-disk record: bincode payload guarded by a blake3 checksum.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    checksum: String,
    payload: Vec<u8>,
}

struct PersistentStore {
    db: Db,
    outputs: Tree,
    meta: Tree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub hits: usize,
    pub misses: usize,
}

fn cache_key(raw_hash: &str, fingerprint: &str) -> String {
    format!("{}:{}", raw_hash, fingerprint)
}

impl PersistentStore {
    fn open(dir: &std::path::Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir).map_err(|e| CacheError::Storage(e.to_string()))?;
        let db = sled::open(dir.join("transform-cache.sled"))?;
        let outputs = db.open_tree("outputs")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, outputs, meta })
    }

    fn read(&self, key: &str) -> Result<Option<CompiledOutput>, CacheError> {
        let Some(bytes) = self.outputs.get(key)? else {
            return Ok(None);
        };

        let decoded = bincode::deserialize::<StoredEntry>(&bytes)
            .ok()
            .filter(|entry| blake3::hash(&entry.payload).to_hex().as_str() == entry.checksum)
            .and_then(|entry| bincode::deserialize::<CompiledOutput>(&entry.payload).ok());

        match decoded {
            Some(output) => Ok(Some(output)),
            None => {
                self.remove(key)?;
                Err(CacheError::Corrupt {
                    key: key.to_string(),
                })
            }
        }
    }

    fn write(&self, key: &str, output: &CompiledOutput, meta: EntryMeta) -> Result<(), CacheError> {
        let payload =
            bincode::serialize(output).map_err(|e| CacheError::Storage(e.to_string()))?;
        let entry = StoredEntry {
            checksum: blake3::hash(&payload).to_hex().to_string(),
            payload,
        };
        let bytes = bincode::serialize(&entry).map_err(|e| CacheError::Storage(e.to_string()))?;
        self.outputs.insert(key, bytes)?;
        self.touch(key, meta)
    }

    fn touch(&self, key: &str, meta: EntryMeta) -> Result<(), CacheError> {
        let bytes = bincode::serialize(&meta).map_err(|e| CacheError::Storage(e.to_string()))?;
        self.meta.insert(key, bytes)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.outputs.remove(key)?;
        self.meta.remove(key)?;
        Ok(())
    }

    fn load_meta(&self) -> Vec<(String, EntryMeta)> {
        self.meta
            .iter()
            .filter_map(|item| item.ok())
            .filter_map(|(key, value)| {
                let key = String::from_utf8(key.to_vec()).ok()?;
                let meta = bincode::deserialize::<EntryMeta>(&value).ok()?;
                Some((key, meta))
            })
            .collect()
    }
}

impl TransformCache {
    /// Memory-only cache.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self {
            hot: DashMap::new(),
            meta: DashMap::new(),
            clock: AtomicU64::new(0),
            persistent: None,
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Opens the persistent store when `config.dir` is set.
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let mut cache = Self::in_memory(config);
        if let Some(dir) = &config.dir {
            let store = PersistentStore::open(dir)?;
            let mut latest = 0;
            for (key, meta) in store.load_meta() {
                latest = latest.max(meta.last_used);
                cache.meta.insert(key, meta);
            }
            cache.clock = AtomicU64::new(latest);
            cache.persistent = Some(store);
        }
        Ok(cache)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn touch(&self, key: &str, size: u64) -> Result<(), CacheError> {
        let meta = EntryMeta {
            size,
            last_used: self.tick(),
        };
        self.meta.insert(key.to_string(), meta);
        match &self.persistent {
            Some(store) => store.touch(key, meta),
            None => Ok(()),
        }
    }

    /// Stored output for the key, if any. A corrupt persisted entry is dropped
    /// and reported; callers treat it as a miss.
    pub fn get(
        &self,
        raw_hash: &str,
        fingerprint: &str,
    ) -> Result<Option<CompiledOutput>, CacheError> {
        let key = cache_key(raw_hash, fingerprint);

        if let Some(output) = self.hot.get(&key).map(|entry| Arc::clone(entry.value())) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.touch(&key, output.size() as u64)?;
            return Ok(Some(output.as_ref().clone()));
        }

        let Some(store) = &self.persistent else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match store.read(&key) {
            Ok(Some(output)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.hot.insert(key.clone(), Arc::new(output.clone()));
                self.touch(&key, output.size() as u64)?;
                Ok(Some(output))
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(err) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.meta.remove(&key);
                Err(err)
            }
        }
    }

    pub fn put(
        &self,
        raw_hash: &str,
        fingerprint: &str,
        output: &CompiledOutput,
    ) -> Result<(), CacheError> {
        let key = cache_key(raw_hash, fingerprint);
        let meta = EntryMeta {
            size: output.size() as u64,
            last_used: self.tick(),
        };

        self.hot.insert(key.clone(), Arc::new(output.clone()));
        self.meta.insert(key.clone(), meta);

        match &self.persistent {
            Some(store) => store.write(&key, output, meta),
            None => Ok(()),
        }
    }

    /// Drop least recently used entries until both budgets hold. Returns the
    /// number of evicted entries.
    pub fn evict(&self) -> Result<usize, CacheError> {
        let mut entries: Vec<(String, EntryMeta)> = self
            .meta
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_by(|a, b| a.1.last_used.cmp(&b.1.last_used).then_with(|| a.0.cmp(&b.0)));

        let mut count = entries.len();
        let mut bytes: u64 = entries.iter().map(|(_, meta)| meta.size).sum();
        let mut evicted = 0;

        for (key, meta) in entries {
            if count <= self.max_entries && bytes <= self.max_bytes {
                break;
            }
            self.hot.remove(&key);
            self.meta.remove(&key);
            if let Some(store) = &self.persistent {
                store.remove(&key)?;
            }
            count -= 1;
            bytes -= meta.size;
            evicted += 1;
        }

        if evicted > 0 {
            Logger::debug(&format!("Evicted {} cache entr(ies)", evicted));
        }
        Ok(evicted)
    }

    pub fn flush(&self) -> Result<(), CacheError> {
        if let Some(store) = &self.persistent {
            store.db.flush()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.meta.len(),
            bytes: self.meta.iter().map(|entry| entry.value().size).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.hot.clear();
        self.meta.clear();
        if let Some(store) = &self.persistent {
            store.outputs.clear()?;
            store.meta.clear()?;
        }
        Ok(())
    }
}
