use std::{
    collections::HashMap,
    fs,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    config::{CacheBackend, CacheConfig},
    error::{CustodianError, internal_error},
    resources::Resource,
};

const CACHE_FORMAT_VERSION: u64 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry '{path}' is not valid: {source}")]
    Format {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<CacheError> for CustodianError {
    fn from(err: CacheError) -> Self {
        internal_error(err.to_string())
    }
}

/// Enumeration cache key: account, region, resource type and canonical query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub account_id: String,
    pub region: String,
    pub resource_type: String,
    pub query: Value,
}

impl CacheKey {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        resource_type: impl Into<String>,
        query: Value,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            resource_type: resource_type.into(),
            query,
        }
    }

    /// Hex SHA-256 over the key fields and the canonical (sorted-key) query string.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.account_id, &self.region, &self.resource_type] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(canonical_json(&self.query).as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Enumeration cache shared across policy runs of one driver.
pub trait ResourceCache: Send + Sync {
    fn load(&self, key: &CacheKey) -> Option<Vec<Resource>>;

    fn save(&self, key: &CacheKey, resources: &[Resource]) -> Result<(), CacheError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn build_cache(config: &CacheConfig) -> Arc<dyn ResourceCache> {
    let ttl = Duration::from_secs(config.ttl_minutes.saturating_mul(60));
    match config.backend {
        CacheBackend::None => Arc::new(NullCache),
        CacheBackend::Memory => Arc::new(MemoryCache::new(ttl, config.max_entries)),
        CacheBackend::File => Arc::new(FileCache::new(
            PathBuf::from(&config.dir),
            ttl,
            config.max_entries,
        )),
    }
}

#[derive(Debug, Default)]
pub struct NullCache;

impl ResourceCache for NullCache {
    fn load(&self, _key: &CacheKey) -> Option<Vec<Resource>> {
        None
    }

    fn save(&self, _key: &CacheKey, _resources: &[Resource]) -> Result<(), CacheError> {
        Ok(())
    }

    fn len(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    version: u64,
    #[serde(with = "time::serde::rfc3339")]
    stored_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
    resources: Vec<Resource>,
}

impl CacheEntry {
    fn new(ttl: Duration, resources: &[Resource]) -> Self {
        let stored_at = OffsetDateTime::now_utc();
        Self {
            version: CACHE_FORMAT_VERSION,
            stored_at,
            expires_at: stored_at + ttl,
            resources: resources.to_vec(),
        }
    }

    fn is_live(&self) -> bool {
        self.version == CACHE_FORMAT_VERSION && OffsetDateTime::now_utc() < self.expires_at
    }
}

/// In-process cache bounded by TTL and entry count; the oldest entry is evicted first.
pub struct MemoryCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl ResourceCache for MemoryCache {
    fn load(&self, key: &CacheKey) -> Option<Vec<Resource>> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let digest = key.digest();
        match entries.get(&digest) {
            Some(entry) if entry.is_live() => Some(entry.resources.clone()),
            Some(_) => {
                entries.remove(&digest);
                None
            }
            None => None,
        }
    }

    fn save(&self, key: &CacheKey, resources: &[Resource]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.retain(|_, entry| entry.is_live());
        entries.insert(key.digest(), CacheEntry::new(self.ttl, resources));
        while entries.len() > self.max_entries {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(digest, _)| digest.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }
}

/// One JSON file per key under `dir`, written atomically.
pub struct FileCache {
    dir: PathBuf,
    ttl: Duration,
    max_entries: usize,
}

impl FileCache {
    pub fn new(dir: PathBuf, ttl: Duration, max_entries: usize) -> Self {
        Self {
            dir,
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }

    fn read_entry(&self, path: &PathBuf) -> Result<Option<CacheEntry>, CacheError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| CacheError::Format {
                path: path.display().to_string(),
                source,
            })
    }

    fn entry_files(&self) -> Vec<PathBuf> {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        read_dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect()
    }

    fn evict(&self) {
        let mut live = Vec::new();
        for path in self.entry_files() {
            match self.read_entry(&path) {
                Ok(Some(entry)) if entry.is_live() => live.push((entry.stored_at, path)),
                _ => {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        if live.len() <= self.max_entries {
            return;
        }
        live.sort_by_key(|(stored_at, _)| *stored_at);
        let excess = live.len() - self.max_entries;
        for (_, path) in live.into_iter().take(excess) {
            let _ = fs::remove_file(&path);
        }
    }
}

impl ResourceCache for FileCache {
    fn load(&self, key: &CacheKey) -> Option<Vec<Resource>> {
        let path = self.entry_path(key);
        match self.read_entry(&path) {
            Ok(Some(entry)) if entry.is_live() => Some(entry.resources),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(target: "cache", error = %err, "cache_entry_unreadable");
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn save(&self, key: &CacheKey, resources: &[Resource]) -> Result<(), CacheError> {
        let io_err = |path: &PathBuf| {
            let path = path.display().to_string();
            move |source| CacheError::Io { path, source }
        };

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.entry_path(key);
        let tmp_path = path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &CacheEntry::new(self.ttl, resources)).map_err(
                |source| CacheError::Format {
                    path: tmp_path.display().to_string(),
                    source,
                },
            )?;
            writer.flush().map_err(io_err(&tmp_path))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(io_err(&tmp_path))?;
        }
        fs::rename(&tmp_path, &path).map_err(io_err(&path))?;

        self.evict();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entry_files().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use uuid::Uuid;

    use super::{CacheKey, FileCache, MemoryCache, ResourceCache, canonical_json};
    use crate::resources::Resource;

    fn resources(ids: &[&str]) -> Vec<Resource> {
        ids.iter()
            .map(|id| json!({"id": id}).as_object().cloned().expect("object"))
            .collect()
    }

    fn key(resource_type: &str) -> CacheKey {
        CacheKey::new("123456789012", "us-east-1", resource_type, json!({}))
    }

    #[test]
    fn digest_ignores_query_key_order() {
        let a = CacheKey::new("a", "r", "aws.ec2", json!({"x": 1, "y": [1, {"b": 2, "a": 1}]}));
        let b = CacheKey::new("a", "r", "aws.ec2", json!({"y": [1, {"a": 1, "b": 2}], "x": 1}));
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), key("aws.ec2").digest());
        assert_eq!(canonical_json(&json!({"b": 1, "a": 2})), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn memory_cache_respects_ttl_and_size_bound() {
        let cache = MemoryCache::new(Duration::from_secs(60), 2);
        cache.save(&key("aws.a"), &resources(&["1"])).unwrap();
        cache.save(&key("aws.b"), &resources(&["2"])).unwrap();
        cache.save(&key("aws.c"), &resources(&["3"])).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.load(&key("aws.c")), Some(resources(&["3"])));

        let expired = MemoryCache::new(Duration::ZERO, 2);
        expired.save(&key("aws.a"), &resources(&["1"])).unwrap();
        assert_eq!(expired.load(&key("aws.a")), None);
    }

    #[test]
    fn file_cache_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("custodian-cache-{}", Uuid::now_v7()));
        let cache = FileCache::new(dir.clone(), Duration::from_secs(600), 8);

        assert_eq!(cache.load(&key("aws.ec2")), None);
        cache
            .save(&key("aws.ec2"), &resources(&["i-1", "i-2"]))
            .expect("save should succeed");
        assert_eq!(cache.load(&key("aws.ec2")), Some(resources(&["i-1", "i-2"])));
        assert_eq!(cache.len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }
}
