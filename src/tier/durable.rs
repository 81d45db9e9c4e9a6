//! Durable filesystem tier (L3).
//!
//! Each entry is a content blob (`<key>.bin`) plus a JSON metadata
//! sidecar (`<key>.meta.json`) in one flat directory, created at startup
//! if absent. Opening the tier scans the directory to rebuild an
//! in-memory index of sizes and recency; across restarts recency is
//! approximated by file mtime. The tier never expires entries on its
//! own — only [`DurableTier::purge_older_than`] removes them.
//!
//! Both files are written atomically (temp file + rename) so a crash
//! mid-write never leaves a truncated blob behind a valid index entry.

use crate::config::DurableTierConfig;
use crate::entry::EntryMetadata;
use crate::error::TierError;
use crate::key::CacheKey;
use crate::time::system_time_to_instant;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

/// Running counters for the durable tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurableTierCounters {
    pub hits: u64,
    pub misses: u64,
}

struct IndexEntry {
    size_bytes: u64,
    last_accessed: Instant,
}

/// The L3 cache tier.
pub struct DurableTier {
    root: PathBuf,
    index: DashMap<CacheKey, IndexEntry>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DurableTier {
    /// Opens the tier, creating the directory if needed and scanning it
    /// to rebuild the index.
    pub async fn open(config: DurableTierConfig) -> Result<Self, TierError> {
        fs::create_dir_all(&config.directory).await?;
        let tier = Self {
            root: config.directory,
            index: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        };
        let loaded = tier.scan().await?;
        info!(
            directory = %tier.root.display(),
            entries = loaded,
            total_bytes = tier.total_bytes(),
            "Durable tier ready"
        );
        Ok(tier)
    }

    /// Rebuilds the index from directory contents.
    ///
    /// Content blobs are authoritative; sidecars are picked up lazily on
    /// [`Self::metadata`]. Stray files are skipped and logged. Yields to
    /// the runtime periodically so a large cache does not stall startup.
    async fn scan(&self) -> Result<usize, TierError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut loaded = 0usize;
        let mut visited = 0usize;

        while let Some(dent) = dir.next_entry().await? {
            visited += 1;
            if visited % 100 == 0 {
                tokio::task::yield_now().await;
            }

            let name = dent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(key) = CacheKey::from_content_filename(name) else {
                if !name.ends_with(crate::key::METADATA_SUFFIX) {
                    debug!(file = name, "Ignoring stray file in cache directory");
                }
                continue;
            };

            let meta = match dent.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(file = name, error = %e, "Skipping unreadable cache file");
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }

            let last_accessed = meta
                .modified()
                .ok()
                .and_then(system_time_to_instant)
                .unwrap_or_else(Instant::now);
            self.index.insert(
                key,
                IndexEntry {
                    size_bytes: meta.len(),
                    last_accessed,
                },
            );
            self.total_bytes.fetch_add(meta.len(), Ordering::Relaxed);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Reads the content for a key, refreshing its recency.
    ///
    /// A blob that disappeared behind our back (external cleanup) is
    /// dropped from the index and reported as a miss, not an error.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, TierError> {
        if !self.index.contains_key(key) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        match fs::read(self.content_path(key)).await {
            Ok(data) => {
                if let Some(mut entry) = self.index.get_mut(key) {
                    entry.last_accessed = Instant::now();
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some((_, stale)) = self.index.remove(key) {
                    self.total_bytes
                        .fetch_sub(stale.size_bytes, Ordering::Relaxed);
                }
                warn!(tier = "durable", key = %key, "Indexed blob vanished from disk");
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persists content and its metadata sidecar, replacing any previous
    /// entry for the key.
    pub async fn put(
        &self,
        key: &CacheKey,
        content: &Bytes,
        meta: &EntryMetadata,
    ) -> Result<(), TierError> {
        write_atomic(&self.content_path(key), content).await?;
        let sidecar = serde_json::to_vec_pretty(meta)?;
        write_atomic(&self.metadata_path(key), &sidecar).await?;

        let size = content.len() as u64;
        let previous = self.index.insert(
            key.clone(),
            IndexEntry {
                size_bytes: size,
                last_accessed: Instant::now(),
            },
        );
        if let Some(old) = previous {
            self.total_bytes
                .fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Presence probe against the index; no disk I/O, no recency change.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Reads the metadata sidecar for a key, or `None` when absent.
    pub async fn metadata(&self, key: &CacheKey) -> Result<Option<EntryMetadata>, TierError> {
        match fs::read(self.metadata_path(key)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes an entry and both of its files. Returns whether the entry
    /// was indexed.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool, TierError> {
        let existed = match self.index.remove(key) {
            Some((_, entry)) => {
                self.total_bytes
                    .fetch_sub(entry.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        };
        remove_if_exists(&self.content_path(key)).await?;
        remove_if_exists(&self.metadata_path(key)).await?;
        Ok(existed)
    }

    /// Removes every entry whose recency predates `max_age`. Returns the
    /// number of entries purged.
    pub async fn purge_older_than(&self, max_age: Duration) -> Result<usize, TierError> {
        let Some(cutoff) = Instant::now().checked_sub(max_age) else {
            return Ok(0);
        };
        let stale: Vec<CacheKey> = self
            .index
            .iter()
            .filter(|entry| entry.value().last_accessed < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for key in &stale {
            if self.remove(key).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(tier = "durable", purged = purged, "Purged entries past retention");
        }
        Ok(purged)
    }

    /// Removes every entry.
    pub async fn clear(&self) -> Result<(), TierError> {
        let keys: Vec<CacheKey> = self.index.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.remove(key).await?;
        }
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> DurableTierCounters {
        DurableTierCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn content_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.content_filename())
    }

    fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.metadata_filename())
    }
}

/// Writes via a temp file in the same directory, then renames into
/// place, so readers never observe a partial file.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ArtifactFormat, RenderedArtifact};
    use crate::key::{derive_key, RenderOptions};
    use tempfile::TempDir;

    fn test_key(label: &str) -> CacheKey {
        derive_key(label, 800, 600, &RenderOptions::new()).unwrap()
    }

    fn test_meta(label: &str, content: &Bytes) -> EntryMetadata {
        let artifact = RenderedArtifact::new(content.clone(), ArtifactFormat::Svg, 7.5);
        EntryMetadata::new(label, 800, 600, &artifact)
    }

    async fn open_tier(dir: &TempDir) -> DurableTier {
        DurableTier::open(DurableTierConfig {
            directory: dir.path().to_path_buf(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("cache").join("artifacts");
        let tier = DurableTier::open(DurableTierConfig {
            directory: nested.clone(),
        })
        .await
        .unwrap();
        assert!(nested.is_dir());
        assert_eq!(tier.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let key = test_key("a.svg");
        let content = Bytes::from_static(b"<svg>chart</svg>");

        tier.put(&key, &content, &test_meta("a.svg", &content))
            .await
            .unwrap();
        let read = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(read, content);
        assert_eq!(tier.entry_count(), 1);
        assert_eq!(tier.total_bytes(), content.len() as u64);
    }

    #[tokio::test]
    async fn test_sidecar_is_written_and_parseable() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let key = test_key("charts/bar.svg");
        let content = Bytes::from_static(b"rendered");

        tier.put(&key, &content, &test_meta("charts/bar.svg", &content))
            .await
            .unwrap();

        let meta = tier.metadata(&key).await.unwrap().unwrap();
        assert_eq!(meta.template_path, "charts/bar.svg");
        assert_eq!(meta.width, 800);
        assert_eq!(meta.size_bytes, content.len());

        // Both files exist on disk.
        assert!(dir.path().join(key.content_filename()).is_file());
        assert!(dir.path().join(key.metadata_filename()).is_file());
    }

    #[tokio::test]
    async fn test_get_absent_is_none() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        assert!(tier.get(&test_key("missing.svg")).await.unwrap().is_none());
        assert_eq!(tier.counters().misses, 1);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index_from_scan() {
        let dir = TempDir::new().unwrap();
        let content_a = Bytes::from_static(b"aaaa");
        let content_b = Bytes::from_static(b"bbbbbb");
        let (key_a, key_b) = (test_key("a.svg"), test_key("b.svg"));
        {
            let tier = open_tier(&dir).await;
            tier.put(&key_a, &content_a, &test_meta("a.svg", &content_a))
                .await
                .unwrap();
            tier.put(&key_b, &content_b, &test_meta("b.svg", &content_b))
                .await
                .unwrap();
        }

        let tier = open_tier(&dir).await;
        assert_eq!(tier.entry_count(), 2);
        assert_eq!(tier.total_bytes(), 10);
        assert_eq!(tier.get(&key_a).await.unwrap().unwrap(), content_a);
        assert_eq!(tier.get(&key_b).await.unwrap().unwrap(), content_b);
    }

    #[tokio::test]
    async fn test_scan_ignores_stray_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"junk").unwrap();
        std::fs::write(dir.path().join("short.bin"), b"junk").unwrap();
        // Orphan sidecar without a blob.
        let key = test_key("orphan.svg");
        std::fs::write(dir.path().join(key.metadata_filename()), b"{}").unwrap();

        let tier = open_tier(&dir).await;
        assert_eq!(tier.entry_count(), 0);
        assert_eq!(tier.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_vanished_blob_degrades_to_miss() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let key = test_key("a.svg");
        let content = Bytes::from_static(b"data");
        tier.put(&key, &content, &test_meta("a.svg", &content))
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join(key.content_filename())).unwrap();

        assert!(tier.get(&key).await.unwrap().is_none());
        assert_eq!(tier.entry_count(), 0);
        assert_eq!(tier.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_replace_updates_total_bytes() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let key = test_key("a.svg");
        let big = Bytes::from(vec![1u8; 100]);
        let small = Bytes::from(vec![2u8; 10]);

        tier.put(&key, &big, &test_meta("a.svg", &big)).await.unwrap();
        tier.put(&key, &small, &test_meta("a.svg", &small))
            .await
            .unwrap();
        assert_eq!(tier.total_bytes(), 10);
        assert_eq!(tier.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_deletes_both_files() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let key = test_key("a.svg");
        let content = Bytes::from_static(b"data");
        tier.put(&key, &content, &test_meta("a.svg", &content))
            .await
            .unwrap();

        assert!(tier.remove(&key).await.unwrap());
        assert!(!dir.path().join(key.content_filename()).exists());
        assert!(!dir.path().join(key.metadata_filename()).exists());
        assert!(!tier.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_older_than_removes_stale_only() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let (old_key, fresh_key) = (test_key("old.svg"), test_key("fresh.svg"));
        let content = Bytes::from_static(b"data");

        tier.put(&old_key, &content, &test_meta("old.svg", &content))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tier.put(&fresh_key, &content, &test_meta("fresh.svg", &content))
            .await
            .unwrap();

        let purged = tier.purge_older_than(Duration::from_millis(30)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(!tier.contains(&old_key));
        assert!(tier.contains(&fresh_key));
        assert!(!dir.path().join(old_key.content_filename()).exists());
    }

    #[tokio::test]
    async fn test_get_refreshes_recency_against_purge() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let key = test_key("hot.svg");
        let content = Bytes::from_static(b"data");
        tier.put(&key, &content, &test_meta("hot.svg", &content))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Touch, then purge anything older than the touch.
        tier.get(&key).await.unwrap();
        let purged = tier.purge_older_than(Duration::from_millis(30)).await.unwrap();
        assert_eq!(purged, 0);
        assert!(tier.contains(&key));
    }

    #[tokio::test]
    async fn test_clear_empties_tier_and_disk() {
        let dir = TempDir::new().unwrap();
        let tier = open_tier(&dir).await;
        let content = Bytes::from_static(b"data");
        for label in ["a.svg", "b.svg", "c.svg"] {
            tier.put(&test_key(label), &content, &test_meta(label, &content))
                .await
                .unwrap();
        }
        tier.clear().await.unwrap();
        assert_eq!(tier.entry_count(), 0);
        assert_eq!(tier.total_bytes(), 0);
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 0);
    }
}
