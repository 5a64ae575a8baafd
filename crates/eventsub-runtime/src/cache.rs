//! # Cache Store
//!
//! Asynchronous key-value cache persisted as a single JSON object file
//! (lowercase login → user id), fronted by a bounded in-memory LRU. Writes
//! are atomic (temp file in the same directory, fsync, rename); a corrupt
//! file is quarantined with a `.corrupted` suffix and replaced by an empty
//! map rather than surfacing an error.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{RuntimeError, RuntimeResult};

/// Bounded LRU over string keys. Only ever touched while the store lock is
/// held.
struct LruMap {
    map: HashMap<String, String>,
    /// Front is least recently used.
    order: VecDeque<String>,
    capacity: usize,
}

impl LruMap {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos).expect("position came from iter");
            self.order.push_back(key);
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        let value = self.map.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    fn insert(&mut self, key: String, value: String) {
        if self.map.contains_key(&key) {
            self.map.insert(key.clone(), value);
            self.touch(&key);
            return;
        }
        if self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }

    fn remove(&mut self, key: &str) {
        if self.map.remove(key).is_some() {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Asynchronous file-backed cache with an in-memory LRU front.
pub struct CacheStore {
    path: PathBuf,
    lru: Mutex<LruMap>,
    temp_counter: AtomicU64,
}

impl CacheStore {
    /// Create a store over `path` with the given LRU capacity.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            lru: Mutex::new(LruMap::new(max_entries)),
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Cache file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up a key, consulting the LRU first and falling back to the
    /// file. A file hit warms the LRU.
    ///
    /// # Errors
    /// `Cache { load_cache }` on non-corruption I/O failure. Corruption is
    /// self-healed and reads as a miss.
    pub async fn get(&self, key: &str) -> RuntimeResult<Option<String>> {
        let mut lru = self.lru.lock().await;
        if let Some(value) = lru.get(key) {
            return Ok(Some(value));
        }
        let data = self.load_data().await?;
        let value = data.get(key).cloned();
        if let Some(value) = &value {
            lru.insert(key.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Insert or update a key with a read-modify-write of the whole file.
    ///
    /// # Errors
    /// `Cache { load_cache | save_cache }` on I/O failure.
    pub async fn set(&self, key: &str, value: &str) -> RuntimeResult<()> {
        let mut lru = self.lru.lock().await;
        let mut data = self.load_data().await?;
        data.insert(key.to_string(), value.to_string());
        self.save_data(&data).await?;
        lru.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Remove a key.
    ///
    /// # Errors
    /// `Cache { load_cache | save_cache }` on I/O failure.
    pub async fn delete(&self, key: &str) -> RuntimeResult<()> {
        let mut lru = self.lru.lock().await;
        let mut data = self.load_data().await?;
        data.remove(key);
        self.save_data(&data).await?;
        lru.remove(key);
        Ok(())
    }

    /// Drop every entry, file and memory both.
    ///
    /// # Errors
    /// `Cache { save_cache }` on I/O failure.
    pub async fn clear(&self) -> RuntimeResult<()> {
        let mut lru = self.lru.lock().await;
        self.save_data(&HashMap::new()).await?;
        lru.clear();
        Ok(())
    }

    /// Whether a key exists (LRU first, then file).
    ///
    /// # Errors
    /// `Cache { load_cache }` on I/O failure.
    pub async fn contains(&self, key: &str) -> RuntimeResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All keys currently persisted in the file.
    ///
    /// # Errors
    /// `Cache { load_cache }` on I/O failure.
    pub async fn keys(&self) -> RuntimeResult<Vec<String>> {
        let _lru = self.lru.lock().await;
        let data = self.load_data().await?;
        Ok(data.keys().cloned().collect())
    }

    async fn load_data(&self) -> RuntimeResult<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                if content.trim().is_empty() {
                    return Ok(HashMap::new());
                }
                match serde_json::from_str::<HashMap<String, String>>(&content) {
                    Ok(data) => Ok(data),
                    Err(e) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %e,
                            "Corrupted cache file, recovering with empty cache"
                        );
                        self.quarantine_corrupt_file().await;
                        Ok(HashMap::new())
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(RuntimeError::Cache {
                operation: "load_cache".into(),
                reason: format!("{}: {e}", self.path.display()),
            }),
        }
    }

    async fn quarantine_corrupt_file(&self) {
        let backup = PathBuf::from(format!("{}.corrupted", self.path.display()));
        match tokio::fs::rename(&self.path, &backup).await {
            Ok(()) => {
                tracing::info!(backup = %backup.display(), "Backed up corrupted cache file");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Could not back up corrupted cache file");
            }
        }
    }

    async fn save_data(&self, data: &HashMap<String, String>) -> RuntimeResult<()> {
        let save_err = |e: std::io::Error| RuntimeError::Cache {
            operation: "save_cache".into(),
            reason: format!("{}: {e}", self.path.display()),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(save_err)?;
            }
        }

        let serialized = serde_json::to_string_pretty(data).map_err(|e| RuntimeError::Cache {
            operation: "save_cache".into(),
            reason: e.to_string(),
        })?;

        let temp_path = PathBuf::from(format!(
            "{}.{}.{}.tmp",
            self.path.display(),
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let write_result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(serialized.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(save_err(e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(label: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "eventsub-runtime-cache-tests-{}-{}-{}",
            label,
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let dir = unique_temp_dir("roundtrip");
        let store = CacheStore::new(dir.join("ids.cache.json"), 10);
        store.set("alice", "123").await.unwrap();
        assert_eq!(store.get("alice").await.unwrap().as_deref(), Some("123"));
        assert_eq!(store.get("missing").await.unwrap(), None);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = unique_temp_dir("persist");
        let path = dir.join("ids.cache.json");
        {
            let store = CacheStore::new(&path, 10);
            store.set("alice", "123").await.unwrap();
        }
        let fresh = CacheStore::new(&path, 10);
        assert_eq!(fresh.get("alice").await.unwrap().as_deref(), Some("123"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_corruption_recovery() {
        let dir = unique_temp_dir("corrupt");
        let path = dir.join("x.cache.json");
        let store = CacheStore::new(&path, 10);
        store.set("seed", "1").await.unwrap();

        std::fs::write(&path, "not json").unwrap();

        // Fresh store so the LRU cannot mask the corrupt file.
        let store = CacheStore::new(&path, 10);
        assert_eq!(store.get("x").await.unwrap(), None);
        let backup = PathBuf::from(format!("{}.corrupted", path.display()));
        assert!(backup.exists(), "corrupt file should be quarantined");

        store.set("x", "1").await.unwrap();
        assert_eq!(store.get("x").await.unwrap().as_deref(), Some("1"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_write_then_read_survives_corruption_between_ops() {
        let dir = unique_temp_dir("between");
        let path = dir.join("c.cache.json");
        let store = CacheStore::new(&path, 10);
        store.set("k", "v").await.unwrap();
        std::fs::write(&path, "{broken").unwrap();
        // The LRU still answers; the next write heals the file.
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.set("k2", "v2").await.unwrap();
        assert_eq!(store.get("k2").await.unwrap().as_deref(), Some("v2"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let dir = unique_temp_dir("delete");
        let store = CacheStore::new(dir.join("d.cache.json"), 10);
        store.set("a", "1").await.unwrap();
        store.set("b", "2").await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.contains("b").await.unwrap());
        store.clear().await.unwrap();
        assert_eq!(store.keys().await.unwrap().len(), 0);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_lru_eviction_is_bounded() {
        let dir = unique_temp_dir("lru");
        let store = CacheStore::new(dir.join("l.cache.json"), 3);
        for i in 0..5 {
            store.set(&format!("k{i}"), &format!("{i}")).await.unwrap();
        }
        {
            let lru = store.lru.lock().await;
            assert_eq!(lru.len(), 3);
        }
        // Evicted from memory but still on disk.
        assert_eq!(store.get("k0").await.unwrap().as_deref(), Some("0"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_lru_touch_order() {
        let mut lru = LruMap::new(2);
        lru.insert("a".into(), "1".into());
        lru.insert("b".into(), "2".into());
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(lru.get("a").as_deref(), Some("1"));
        lru.insert("c".into(), "3".into());
        assert_eq!(lru.get("b"), None);
        assert_eq!(lru.get("a").as_deref(), Some("1"));
        assert_eq!(lru.get("c").as_deref(), Some("3"));
    }
}
