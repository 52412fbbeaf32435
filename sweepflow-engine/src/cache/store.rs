// Content Cache
// Persists step results on disk, keyed by the digest of their resolved inputs

use crate::cache::key::CacheKey;
use crate::step::descriptor::StepDescriptor;
use crate::step::models::Outputs;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Errors that can occur with the content cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache corruption for key {key}: {reason}")]
    Corruption { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    fn corruption(key: &CacheKey, reason: impl Into<String>) -> Self {
        CacheError::Corruption {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Configuration for the content cache
#[derive(Debug, Clone)]
pub struct ContentCacheConfig {
    /// Cache directory (default: ~/.sweepflow/cache/)
    pub cache_dir: PathBuf,
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        let cache_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sweepflow")
            .join("cache");

        Self { cache_dir }
    }
}

impl ContentCacheConfig {
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }
}

/// A published result. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Step name and version that produced the result
    pub step: String,
    pub version: String,
    /// Result directory holding the published files
    pub location: PathBuf,
    pub outputs: Outputs,
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
}

/// Content-addressed result cache
pub struct ContentCache {
    config: ContentCacheConfig,
    /// In-memory view of entries already read or written by this process
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
}

impl ContentCache {
    /// Create a cache with default configuration
    pub fn new() -> Self {
        Self::with_config(ContentCacheConfig::default())
    }

    pub fn with_config(config: ContentCacheConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a cache rooted at a specific directory
    pub fn with_cache_dir(cache_dir: impl AsRef<Path>) -> Self {
        Self::with_config(ContentCacheConfig::default().with_cache_dir(cache_dir.as_ref()))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    fn index_dir(&self) -> PathBuf {
        self.config.cache_dir.join("index")
    }

    fn results_dir(&self) -> PathBuf {
        self.config.cache_dir.join("results")
    }

    fn staging_root(&self) -> PathBuf {
        self.config.cache_dir.join("staging")
    }

    fn index_path(&self, key: &CacheKey) -> PathBuf {
        self.index_dir().join(format!("{}.json", key))
    }

    /// Look a key up, first in memory and then on disk
    pub async fn lookup(&self, key: &CacheKey) -> Result<Lookup, CacheError> {
        let cached = self.entries.read().await.get(key).cloned();
        if let Some(entry) = cached {
            verify_artifacts(&entry)?;
            return Ok(Lookup::Hit(entry));
        }

        let path = self.index_path(key);
        if !path.exists() {
            return Ok(Lookup::Miss);
        }

        let entry = read_entry(key, &path)?;
        verify_artifacts(&entry)?;

        debug!(key = %key.short(), step = %entry.step, "cache hit from disk");
        self.entries.write().await.insert(key.clone(), entry.clone());
        Ok(Lookup::Hit(entry))
    }

    /// Fresh private directory for one action to write into
    pub fn staging_dir(&self) -> Result<TempDir, CacheError> {
        let root = self.staging_root();
        fs::create_dir_all(&root)?;
        Ok(tempfile::Builder::new().prefix("stage-").tempdir_in(root)?)
    }

    /// Move a successful action's staging directory into the results area
    /// and record its outputs under `key`.
    ///
    /// Paths in `outputs` that point into the staging directory are
    /// rewritten to the published location.
    pub async fn publish(
        &self,
        key: &CacheKey,
        step: &StepDescriptor,
        staging: TempDir,
        outputs: Outputs,
    ) -> Result<CacheEntry, CacheError> {
        if let Lookup::Hit(existing) = self.lookup(key).await? {
            return Ok(existing);
        }

        let results = self.results_dir();
        fs::create_dir_all(&results)?;
        let location = results.join(key.as_str());
        if location.exists() {
            // left behind by an interrupted publish, never indexed
            warn!(key = %key.short(), "replacing unindexed result directory");
            fs::remove_dir_all(&location)?;
        }

        let staged = staging.path().to_path_buf();
        fs::rename(&staged, &location)?;

        let outputs = outputs
            .into_iter()
            .map(|(slot, value)| (slot, value.relocate(&staged, &location)))
            .collect();

        let entry = CacheEntry {
            key: key.clone(),
            step: step.name().to_string(),
            version: step.step_version().to_string(),
            location,
            outputs,
        };
        self.store(entry.clone()).await?;
        Ok(entry)
    }

    /// Record an entry. Append-only: an identical entry is a no-op and a
    /// differing one is corruption.
    pub async fn store(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let key = entry.key.clone();
        let path = self.index_path(&key);

        if path.exists() {
            return self.accept_existing(&path, entry).await;
        }

        fs::create_dir_all(self.index_dir())?;
        let mut tmp = NamedTempFile::new_in(self.index_dir())?;
        tmp.write_all(serde_json::to_string_pretty(&entry)?.as_bytes())?;
        tmp.flush()?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                return self.accept_existing(&path, entry).await;
            }
            Err(e) => return Err(CacheError::Io(e.error)),
        }

        debug!(key = %key.short(), step = %entry.step, "stored cache entry");
        self.entries.write().await.insert(key, entry);
        Ok(())
    }

    async fn accept_existing(&self, path: &Path, entry: CacheEntry) -> Result<(), CacheError> {
        let existing = read_entry(&entry.key, path)?;
        if existing != entry {
            return Err(CacheError::corruption(
                &entry.key,
                "an entry with different content already exists",
            ));
        }
        self.entries.write().await.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// All entries on disk, sorted by key
    pub async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let dir = self.index_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for item in fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(CacheKey::parse);
            if let Some(key) = key {
                entries.push(read_entry(&key, &path)?);
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Drop one entry and its results; returns whether it existed
    pub async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.entries.write().await.remove(key);

        let index = self.index_path(key);
        let existed = index.exists();
        if existed {
            fs::remove_file(&index)?;
        }
        let location = self.results_dir().join(key.as_str());
        if location.exists() {
            fs::remove_dir_all(&location)?;
        }
        Ok(existed)
    }

    /// Remove every entry, result and staging directory
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        if self.config.cache_dir.exists() {
            fs::remove_dir_all(&self.config.cache_dir)?;
        }
        Ok(())
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new()
    }
}

fn read_entry(key: &CacheKey, path: &Path) -> Result<CacheEntry, CacheError> {
    let content = fs::read_to_string(path)?;
    let entry: CacheEntry = serde_json::from_str(&content)
        .map_err(|e| CacheError::corruption(key, format!("malformed index file: {}", e)))?;
    if &entry.key != key {
        return Err(CacheError::corruption(
            key,
            format!("index file records key {}", entry.key),
        ));
    }
    Ok(entry)
}

fn verify_artifacts(entry: &CacheEntry) -> Result<(), CacheError> {
    for value in entry.outputs.values() {
        for path in value.paths() {
            if !path.exists() {
                return Err(CacheError::corruption(
                    &entry.key,
                    format!("artifact {} no longer exists", path.display()),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{cache_key, KeyInput};
    use crate::step::descriptor::FnAction;
    use crate::step::models::Value;
    use std::collections::BTreeMap;

    fn step() -> StepDescriptor {
        StepDescriptor::new("estimate", FnAction::new(|_, _| Ok(Outputs::new())))
    }

    fn key(n: i64) -> CacheKey {
        let mut inputs = BTreeMap::new();
        inputs.insert("n".to_string(), KeyInput::Literal(Value::from(n)));
        cache_key(&step(), &inputs).unwrap()
    }

    async fn publish_one(cache: &ContentCache, key: &CacheKey) -> CacheEntry {
        let staging = cache.staging_dir().unwrap();
        let file = staging.path().join("betas.txt");
        fs::write(&file, "0.5").unwrap();

        let mut outputs = Outputs::new();
        outputs.insert("betas".to_string(), Value::path(&file));
        outputs.insert("count".to_string(), Value::from(1i64));
        cache.publish(key, &step(), staging, outputs).await.unwrap()
    }

    #[tokio::test]
    async fn test_cold_cache_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_cache_dir(dir.path().join("absent"));

        assert_eq!(cache.lookup(&key(1)).await.unwrap(), Lookup::Miss);
        assert!(cache.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_relocates_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_cache_dir(dir.path());
        let k = key(1);

        let entry = publish_one(&cache, &k).await;
        let betas = entry.outputs["betas"].as_path().unwrap().to_path_buf();

        assert_eq!(entry.location, dir.path().join("results").join(k.as_str()));
        assert!(betas.starts_with(&entry.location));
        assert_eq!(fs::read_to_string(&betas).unwrap(), "0.5");
        assert!(dir.path().join("index").join(format!("{}.json", k)).exists());

        // staging area holds nothing once published
        let leftover = fs::read_dir(dir.path().join("staging")).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_hit_from_disk_in_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let k = key(1);
        let published = {
            let cache = ContentCache::with_cache_dir(dir.path());
            publish_one(&cache, &k).await
        };

        let cache = ContentCache::with_cache_dir(dir.path());
        assert_eq!(cache.lookup(&k).await.unwrap(), Lookup::Hit(published));
        assert_eq!(cache.lookup(&key(2)).await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_malformed_index_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_cache_dir(dir.path());
        let k = key(1);

        fs::create_dir_all(dir.path().join("index")).unwrap();
        fs::write(cache.index_path(&k), "{ not json").unwrap();

        let err = cache.lookup(&k).await.unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_vanished_artifact_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let k = key(1);
        let entry = {
            let cache = ContentCache::with_cache_dir(dir.path());
            publish_one(&cache, &k).await
        };
        fs::remove_dir_all(&entry.location).unwrap();

        let cache = ContentCache::with_cache_dir(dir.path());
        let err = cache.lookup(&k).await.unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_store_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_cache_dir(dir.path());
        let k = key(1);
        let entry = publish_one(&cache, &k).await;

        // identical content is accepted
        cache.store(entry.clone()).await.unwrap();

        let mut changed = entry.clone();
        changed.outputs.insert("count".to_string(), Value::from(2i64));
        let err = cache.store(changed).await.unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_list_remove_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_cache_dir(dir.path());
        let (k1, k2) = (key(1), key(2));
        publish_one(&cache, &k1).await;
        publish_one(&cache, &k2).await;

        let listed: Vec<_> = cache.list().await.unwrap().into_iter().map(|e| e.key).collect();
        let mut expected = vec![k1.clone(), k2.clone()];
        expected.sort();
        assert_eq!(listed, expected);

        assert!(cache.remove(&k1).await.unwrap());
        assert!(!cache.remove(&k1).await.unwrap());
        assert_eq!(cache.lookup(&k1).await.unwrap(), Lookup::Miss);

        cache.clear().await.unwrap();
        assert!(!dir.path().join("index").exists());
        assert_eq!(cache.lookup(&k2).await.unwrap(), Lookup::Miss);
    }
}
