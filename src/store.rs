//! Storage backends for cached images and rate-limit counters
//!
//! The handler only sees two narrow traits:
//! - [`ObjectStore`]: keyed image bodies with HTTP metadata and a TTL
//! - [`KvStore`]: small string values with an optional TTL
//!
//! Both are treated as eventually consistent; nothing here is transactional.
//! In-memory implementations back tests and single-node deployments, and
//! [`DiskObjectStore`] keeps cached images across restarts.

use crate::error::{EdgeError, Result};
use crate::models::{CachedImage, HttpMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, warn};

/// Object storage for cached image bodies
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; a missing or expired key is `Ok(None)`
    async fn get(&self, key: &str) -> Result<Option<CachedImage>>;

    /// Store an object, replacing any previous value under the key
    async fn put(&self, key: &str, body: Bytes, metadata: HttpMetadata, ttl: Duration)
        -> Result<()>;
}

/// Key-value storage for small records
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
}

/// Expiry instant for a TTL starting now
///
/// Fails instead of overflowing the clock for absurd TTLs.
fn expiry_after(ttl: Duration) -> Result<SystemTime> {
    SystemTime::now()
        .checked_add(ttl)
        .ok_or_else(|| EdgeError::Storage(format!("TTL out of range: {}s", ttl.as_secs())))
}

fn lock_poisoned<E>(_: E) -> EdgeError {
    EdgeError::Storage("store lock poisoned".to_string())
}

/// Default byte budget of [`MemoryObjectStore`]: 256 MiB
pub const DEFAULT_MEMORY_BUDGET: usize = 256 * 1024 * 1024;

/// Object entry with access tracking for LRU eviction
struct ObjectEntry {
    image: CachedImage,
    expires_at: SystemTime,
    last_access: u64,
}

#[derive(Default)]
struct ObjectEntries {
    map: HashMap<String, ObjectEntry>,
    current_size: usize,
    /// Monotonic access clock; higher is more recent
    clock: u64,
}

impl ObjectEntries {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<ObjectEntry> {
        let removed = self.map.remove(key)?;
        self.current_size = self.current_size.saturating_sub(removed.image.body.len());
        Some(removed)
    }

    /// Evict least recently used entries until `incoming` more bytes fit
    fn make_room(&mut self, incoming: usize, max_size: usize) {
        while self.current_size + incoming > max_size && !self.map.is_empty() {
            let Some(lru_key) = self
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.remove(&lru_key);
            debug!("Evicted LRU object: {}", lru_key);
        }
    }
}

/// In-memory object store with per-entry expiry and a byte budget
///
/// Bodies are counted against the budget; when a put would exceed it, the
/// least recently read or written entries are evicted first. A body larger
/// than the whole budget is not stored.
pub struct MemoryObjectStore {
    entries: RwLock<ObjectEntries>,
    max_size_bytes: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_BUDGET)
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding at most `max_size_bytes` of bodies
    pub fn with_capacity(max_size_bytes: usize) -> Self {
        MemoryObjectStore {
            entries: RwLock::new(ObjectEntries::default()),
            max_size_bytes,
        }
    }

    /// Number of stored entries, including not-yet-evicted expired ones
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total body bytes currently held
    pub fn size_bytes(&self) -> usize {
        self.entries.read().map(|e| e.current_size).unwrap_or(0)
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<CachedImage>> {
        let now = SystemTime::now();
        let mut entries = self.entries.write().map_err(lock_poisoned)?;
        let access = entries.tick();

        match entries.map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = access;
                return Ok(Some(entry.image.clone()));
            }
            Some(_) => {}
            None => return Ok(None),
        }

        debug!("Evicting expired object: {}", key);
        entries.remove(key);
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: HttpMetadata,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = expiry_after(ttl)?;
        let size = body.len();

        let mut entries = self.entries.write().map_err(lock_poisoned)?;
        entries.remove(key);

        if size > self.max_size_bytes {
            debug!(
                "Not caching {}: {} bytes exceeds budget of {} bytes",
                key, size, self.max_size_bytes
            );
            return Ok(());
        }

        entries.make_room(size, self.max_size_bytes);
        let last_access = entries.tick();
        entries.map.insert(
            key.to_string(),
            ObjectEntry {
                image: CachedImage {
                    body,
                    http_metadata: metadata,
                },
                expires_at,
                last_access,
            },
        );
        entries.current_size += size;
        Ok(())
    }
}

/// Puts between full sweeps of expired [`MemoryKvStore`] records
const KV_SWEEP_INTERVAL: u64 = 1024;

struct KvEntry {
    value: String,
    expires_at: Option<SystemTime>,
}

impl KvEntry {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory key-value store with per-entry expiry
///
/// Expired records are dropped when read, and swept in bulk every
/// [`KV_SWEEP_INTERVAL`] puts so records nobody reads again do not pile up.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, KvEntry>>,
    puts: AtomicU64,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, including not-yet-evicted expired ones
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record
    pub fn sweep(&self) -> Result<usize> {
        let now = SystemTime::now();
        let mut entries = self.entries.write().map_err(lock_poisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired records", removed);
        }
        Ok(removed)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = SystemTime::now();
        {
            let entries = self.entries.read().map_err(lock_poisoned)?;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        self.entries.write().map_err(lock_poisoned)?.remove(key);
        Ok(None)
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(expiry_after).transpose()?;

        if (self.puts.fetch_add(1, Ordering::Relaxed) + 1) % KV_SWEEP_INTERVAL == 0 {
            self.sweep()?;
        }

        self.entries
            .write()
            .map_err(lock_poisoned)?
            .insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }
}

/// Object store persisting one file per key on local disk
///
/// File layout: expiry (u64 LE, seconds since epoch), metadata length
/// (u32 LE), body length (u64 LE), JSON metadata, body.
///
/// Each put writes its own temp file in the target directory and renames it
/// into place, so concurrent writers of one key never interleave and readers
/// see either the old entry or a complete new one.
pub struct DiskObjectStore {
    base_path: PathBuf,
}

const HEADER_LEN: usize = 20;

impl DiskObjectStore {
    /// Create the store, making sure the base directory exists
    pub async fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            EdgeError::Storage(format!(
                "Failed to create cache directory {}: {}",
                base_path.display(),
                e
            ))
        })?;
        Ok(DiskObjectStore { base_path })
    }

    /// Path for a key: two hashed directory levels, then the flattened key
    fn file_path(&self, key: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();

        let dir1 = format!("{:02x}", (hash >> 8) & 0xFF);
        let dir2 = format!("{:02x}", hash & 0xFF);
        let filename: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();

        self.base_path
            .join(dir1)
            .join(dir2)
            .join(format!("{}-{:016x}", filename, hash))
    }

    fn encode_header(expires_at: u64, meta_len: u32, body_len: u64) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..8].copy_from_slice(&expires_at.to_le_bytes());
        header[8..12].copy_from_slice(&meta_len.to_le_bytes());
        header[12..20].copy_from_slice(&body_len.to_le_bytes());
        header
    }

    fn decode(data: &[u8]) -> Result<(SystemTime, CachedImage)> {
        if data.len() < HEADER_LEN {
            return Err(EdgeError::Storage("truncated cache file".to_string()));
        }
        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&data[0..8]);
        let mut meta_len = [0u8; 4];
        meta_len.copy_from_slice(&data[8..12]);
        let mut body_len = [0u8; 8];
        body_len.copy_from_slice(&data[12..20]);

        let expires_at = UNIX_EPOCH
            .checked_add(Duration::from_secs(u64::from_le_bytes(expiry)))
            .ok_or_else(|| EdgeError::Storage("cache expiry out of range".to_string()))?;
        let meta_end = HEADER_LEN + u32::from_le_bytes(meta_len) as usize;
        if data.len() < meta_end {
            return Err(EdgeError::Storage("truncated cache metadata".to_string()));
        }

        let body = &data[meta_end..];
        if body.len() as u64 != u64::from_le_bytes(body_len) {
            return Err(EdgeError::Storage(format!(
                "cache body length mismatch: expected {}, found {}",
                u64::from_le_bytes(body_len),
                body.len()
            )));
        }

        let http_metadata: HttpMetadata = serde_json::from_slice(&data[HEADER_LEN..meta_end])?;
        Ok((
            expires_at,
            CachedImage {
                body: Bytes::copy_from_slice(body),
                http_metadata,
            },
        ))
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    async fn get(&self, key: &str) -> Result<Option<CachedImage>> {
        let file_path = self.file_path(key);
        let data = match fs::read(&file_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match Self::decode(&data) {
            Ok((expires_at, image)) if expires_at > SystemTime::now() => Ok(Some(image)),
            Ok(_) => {
                debug!("Removing expired cache file {}", file_path.display());
                let _ = fs::remove_file(&file_path).await;
                Ok(None)
            }
            Err(e) => {
                warn!("Discarding unreadable cache file {}: {}", file_path.display(), e);
                let _ = fs::remove_file(&file_path).await;
                Ok(None)
            }
        }
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: HttpMetadata,
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = expiry_after(ttl)?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let file_path = self.file_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&parent).await.map_err(|e| {
            EdgeError::Storage(format!("Failed to create cache directory: {}", e))
        })?;

        let meta = serde_json::to_vec(&metadata)?;
        let meta_len = u32::try_from(meta.len())
            .map_err(|_| EdgeError::Storage("metadata too large".to_string()))?;
        let header = Self::encode_header(expires_at, meta_len, body.len() as u64);

        let size = body.len();
        let target = file_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| {
                EdgeError::Storage(format!("Failed to create cache file: {}", e))
            })?;
            tmp.write_all(&header)?;
            tmp.write_all(&meta)?;
            tmp.write_all(&body)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| {
                EdgeError::Storage(format!("Failed to persist cache file: {}", e.error))
            })?;
            Ok(())
        })
        .await
        .map_err(|e| EdgeError::Internal(format!("Cache write task failed: {}", e)))??;

        debug!("Wrote {} ({} bytes) to {}", key, size, file_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn metadata(content_type: &str) -> HttpMetadata {
        HttpMetadata {
            content_type: Some(content_type.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_object_store_round_trip() {
        let store = MemoryObjectStore::new();
        assert!(store.get("a/b/original").await.unwrap().is_none());

        store
            .put("a/b/original", Bytes::from_static(b"img"), metadata("image/png"), Duration::from_secs(60))
            .await
            .unwrap();

        let image = store.get("a/b/original").await.unwrap().unwrap();
        assert_eq!(image.body, Bytes::from_static(b"img"));
        assert_eq!(image.http_metadata.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_memory_object_store_expiry() {
        let store = MemoryObjectStore::new();
        store
            .put("k", Bytes::from_static(b"x"), HttpMetadata::default(), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_kv_store_ttl() {
        let store = MemoryKvStore::new();
        store.put("live", "1".to_string(), Some(Duration::from_secs(60))).await.unwrap();
        store.put("forever", "2".to_string(), None).await.unwrap();
        store.put("dead", "3".to_string(), Some(Duration::ZERO)).await.unwrap();

        assert_eq!(store.get("live").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("forever").await.unwrap().as_deref(), Some("2"));
        assert!(store.get("dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_store_persists_across_instances() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        {
            let store = DiskObjectStore::new(temp_dir.path()).await.unwrap();
            store
                .put("prod/cat/100x100", Bytes::from(vec![7u8; 512]), metadata("image/webp"), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let store = DiskObjectStore::new(temp_dir.path()).await.unwrap();
        let image = store.get("prod/cat/100x100").await.unwrap().unwrap();
        assert_eq!(image.body.len(), 512);
        assert_eq!(image.http_metadata.content_type.as_deref(), Some("image/webp"));
        assert!(store.get("prod/dog/100x100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_store_expired_entry_removed() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = DiskObjectStore::new(temp_dir.path()).await.unwrap();
        store
            .put("k", Bytes::from_static(b"x"), HttpMetadata::default(), Duration::ZERO)
            .await
            .unwrap();

        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.file_path("k").exists());
    }

    #[tokio::test]
    async fn test_disk_store_overwrites() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = DiskObjectStore::new(temp_dir.path()).await.unwrap();
        for body in [&b"first"[..], &b"second"[..]] {
            store
                .put("k", Bytes::copy_from_slice(body), HttpMetadata::default(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        let image = store.get("k").await.unwrap().unwrap();
        assert_eq!(image.body, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_memory_object_store_evicts_least_recently_used() {
        async fn put(store: &MemoryObjectStore, key: &str, len: usize) {
            store
                .put(key, Bytes::from(vec![0u8; len]), HttpMetadata::default(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let store = MemoryObjectStore::with_capacity(10);
        put(&store, "a", 4).await;
        put(&store, "b", 4).await;
        // Reading "a" makes "b" the eviction candidate
        assert!(store.get("a").await.unwrap().is_some());

        put(&store, "c", 4).await;
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
        assert_eq!(store.size_bytes(), 8);
    }

    #[tokio::test]
    async fn test_memory_object_store_overwrite_keeps_accounting() {
        let store = MemoryObjectStore::with_capacity(100);
        for len in [30, 50, 10] {
            store
                .put("k", Bytes::from(vec![1u8; len]), HttpMetadata::default(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.size_bytes(), 10);
    }

    #[tokio::test]
    async fn test_memory_object_store_skips_body_over_budget() {
        let store = MemoryObjectStore::with_capacity(8);
        store
            .put("small", Bytes::from_static(b"1234"), HttpMetadata::default(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put("huge", Bytes::from(vec![0u8; 9]), HttpMetadata::default(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.get("huge").await.unwrap().is_none());
        assert!(store.get("small").await.unwrap().is_some());
        assert!(store.size_bytes() <= store.max_size_bytes());
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_an_error() {
        let memory = MemoryObjectStore::new();
        let result = memory
            .put("k", Bytes::from_static(b"x"), HttpMetadata::default(), Duration::MAX)
            .await;
        assert!(matches!(result, Err(EdgeError::Storage(_))));
        assert!(memory.is_empty());

        let kv = MemoryKvStore::new();
        let result = kv.put("k", "v".to_string(), Some(Duration::MAX)).await;
        assert!(matches!(result, Err(EdgeError::Storage(_))));

        let temp_dir = tempfile::TempDir::new().unwrap();
        let disk = DiskObjectStore::new(temp_dir.path()).await.unwrap();
        let result = disk
            .put("k", Bytes::from_static(b"x"), HttpMetadata::default(), Duration::MAX)
            .await;
        assert!(matches!(result, Err(EdgeError::Storage(_))));
        assert!(disk.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_kv_store_expired_record_dropped_on_read() {
        let store = MemoryKvStore::new();
        store.put("dead", "1".to_string(), Some(Duration::ZERO)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("dead").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_kv_store_sweeps_unread_records() {
        let store = MemoryKvStore::new();
        for i in 0..KV_SWEEP_INTERVAL - 1 {
            store
                .put(&format!("client-{}", i), "1".to_string(), Some(Duration::ZERO))
                .await
                .unwrap();
        }
        assert_eq!(store.len() as u64, KV_SWEEP_INTERVAL - 1);

        // The next put triggers a sweep before inserting
        store.put("live", "1".to_string(), Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("live").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disk_store_concurrent_puts_never_expose_partial_entries() {
        const BODY_LEN: usize = 256 * 1024;
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(DiskObjectStore::new(temp_dir.path()).await.unwrap());

        for _round in 0..10 {
            let mut writers = Vec::new();
            for fill in 0..8u8 {
                let store = Arc::clone(&store);
                writers.push(tokio::spawn(async move {
                    store
                        .put("k", Bytes::from(vec![fill; BODY_LEN]), metadata("image/png"), Duration::from_secs(60))
                        .await
                }));
            }

            let reader = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        if let Some(image) = store.get("k").await.unwrap() {
                            assert_eq!(image.body.len(), BODY_LEN);
                            assert!(image.body.iter().all(|b| *b == image.body[0]));
                        }
                        tokio::task::yield_now().await;
                    }
                })
            };

            for writer in writers {
                writer.await.unwrap().unwrap();
            }
            reader.await.unwrap();

            let image = store.get("k").await.unwrap().unwrap();
            assert_eq!(image.body.len(), BODY_LEN);
            assert!(image.body.iter().all(|b| *b == image.body[0]));
        }

        // No temp files are left behind next to the entry
        let entry = store.file_path("k");
        let siblings = std::fs::read_dir(entry.parent().unwrap()).unwrap().count();
        assert_eq!(siblings, 1);
    }

    #[tokio::test]
    async fn test_disk_store_rejects_truncated_body() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = DiskObjectStore::new(temp_dir.path()).await.unwrap();
        store
            .put("k", Bytes::from(vec![3u8; 1000]), HttpMetadata::default(), Duration::from_secs(60))
            .await
            .unwrap();

        let path = store.file_path("k");
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 10]).unwrap();

        assert!(store.get("k").await.unwrap().is_none());
        assert!(!path.exists());
    }
}
