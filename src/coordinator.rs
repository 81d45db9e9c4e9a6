//! Tier coordinator: the read and write paths across L1, L2, and L3.
//!
//! Reads cascade from fastest to slowest tier; a hit at a lower tier is
//! promoted into the faster ones before it is returned. Writes fan out
//! to every configured tier. Tier failures are absorbed here: a failing
//! tier is logged and skipped for that one operation, so a lookup
//! degrades to the next tier and a write lands wherever it can. Only
//! caller bugs (malformed key input) surface as errors.
//!
//! Tiers are eventually consistent with each other. An artifact may be
//! present in L3 but not L1, or expired from L2 while L3 still holds
//! it; every read repairs the faster tiers as it goes.

use crate::config::CacheConfig;
use crate::entry::{ArtifactFormat, CacheEntry, EntryMetadata, RenderedArtifact};
use crate::error::{CacheError, TierError};
use crate::key::{derive_key, CacheKey, RenderOptions};
use crate::metrics::MetricsRegistry;
use crate::tier::durable::DurableTier;
use crate::tier::memory::MemoryTier;
use crate::tier::remote::RemoteTier;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Point-in-time counter snapshot across the local tiers.
///
/// The distributed tier is not included: it is shared infrastructure
/// and keeps its own server-side accounting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub memory_insertions: u64,
    pub memory_evictions: u64,
    pub memory_entries: usize,
    pub memory_used_bytes: usize,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub durable_entries: usize,
    pub durable_bytes: u64,
}

/// Coordinates the memory, distributed, and durable tiers behind one
/// lookup/store surface keyed by template identity.
pub struct CacheCoordinator {
    memory: MemoryTier,
    remote: Option<RemoteTier>,
    durable: DurableTier,
    metrics: Arc<MetricsRegistry>,
}

impl CacheCoordinator {
    /// Opens the coordinator: builds the memory tier and opens the
    /// durable tier (creating and scanning its directory). The
    /// distributed tier is passed in already wired so deployments and
    /// tests control the store implementation.
    pub async fn open(
        config: &CacheConfig,
        remote: Option<RemoteTier>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, CacheError> {
        let memory = MemoryTier::new(config.memory.clone());
        let durable = DurableTier::open(config.durable.clone())
            .await
            .map_err(open_failure)?;
        Ok(Self {
            memory,
            remote,
            durable,
            metrics,
        })
    }

    /// Looks up the artifact for a template identity, cascading through
    /// the tiers. Returns `None` on a full miss; the caller renders and
    /// calls [`Self::put`].
    pub async fn get(
        &self,
        template_path: &str,
        width: u32,
        height: u32,
        options: &RenderOptions,
    ) -> Result<Option<Bytes>, CacheError> {
        let key = derive_key(template_path, width, height, options)?;

        if let Some(content) = self.memory.get(&key) {
            self.metrics.record_event(template_path, true, None);
            return Ok(Some(content));
        }

        if let Some(remote) = &self.remote {
            match remote.get(&key).await {
                Ok(Some(content)) => {
                    self.promote_to_memory(&key, &content, width, height);
                    self.metrics.record_event(template_path, true, None);
                    debug!(key = %key, tier = "remote", "Served from distributed tier");
                    return Ok(Some(content));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(tier = "remote", key = %key, error = %e, "Tier lookup failed, falling through");
                }
            }
        }

        match self.durable.get(&key).await {
            Ok(Some(content)) => {
                self.promote_to_memory(&key, &content, width, height);
                if let Some(remote) = &self.remote {
                    if let Err(e) = remote.put(&key, content.clone()).await {
                        warn!(tier = "remote", key = %key, error = %e, "Promotion write failed");
                    }
                }
                self.metrics.record_event(template_path, true, None);
                debug!(key = %key, tier = "durable", "Served from durable tier");
                return Ok(Some(content));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(tier = "durable", key = %key, error = %e, "Tier lookup failed, treating as miss");
            }
        }

        self.metrics.record_event(template_path, false, None);
        Ok(None)
    }

    /// Stores a freshly rendered artifact under its template identity,
    /// fanning out to every configured tier.
    ///
    /// Tier writes are best-effort: an artifact too large for the
    /// memory budget skips L1 only, and a distributed-tier outage skips
    /// L2 only. The render time is folded into the template's metrics.
    pub async fn put(
        &self,
        template_path: &str,
        width: u32,
        height: u32,
        options: &RenderOptions,
        artifact: RenderedArtifact,
    ) -> Result<CacheKey, CacheError> {
        let key = derive_key(template_path, width, height, options)?;
        self.metrics
            .record_render(template_path, artifact.render_time_ms);

        let entry = CacheEntry::from_artifact(&artifact, width, height);
        match self.memory.put(key.clone(), entry) {
            Ok(()) => {}
            Err(e @ TierError::EntryTooLarge { .. }) => {
                debug!(tier = "memory", key = %key, "{e}, lower tiers only");
            }
            Err(e) => {
                warn!(tier = "memory", key = %key, error = %e, "Tier write failed, skipping");
            }
        }

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.put(&key, artifact.content.clone()).await {
                warn!(tier = "remote", key = %key, error = %e, "Tier write failed, skipping");
            }
        }

        let meta = EntryMetadata::new(template_path, width, height, &artifact);
        if let Err(e) = self.durable.put(&key, &artifact.content, &meta).await {
            warn!(tier = "durable", key = %key, error = %e, "Tier write failed, skipping");
        }

        Ok(key)
    }

    /// Whether an artifact is cached locally, without touching recency
    /// or hit counters.
    ///
    /// Only the local tiers are probed; asking the distributed tier
    /// would cost a network round trip per probe, and its entries
    /// expire by TTL anyway.
    pub fn contains(
        &self,
        template_path: &str,
        width: u32,
        height: u32,
        options: &RenderOptions,
    ) -> Result<bool, CacheError> {
        let key = derive_key(template_path, width, height, options)?;
        Ok(self.memory.peek(&key) || self.durable.contains(&key))
    }

    /// Removes every locally cached artifact. Distributed-tier entries
    /// are left to expire via their TTL.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.memory.clear();
        self.durable.clear().await.map_err(open_failure)?;
        Ok(())
    }

    /// Purges entries not accessed within `max_age` from the local
    /// tiers. Returns `(memory_purged, durable_purged)`.
    pub async fn purge_older_than(&self, max_age: Duration) -> (usize, usize) {
        let memory_purged = self.memory.purge_older_than(max_age);
        let durable_purged = match self.durable.purge_older_than(max_age).await {
            Ok(purged) => purged,
            Err(e) => {
                warn!(tier = "durable", error = %e, "Purge failed");
                0
            }
        };
        (memory_purged, durable_purged)
    }

    /// Counter snapshot across the local tiers.
    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.counters();
        let durable = self.durable.counters();
        CacheStats {
            memory_hits: memory.hits,
            memory_misses: memory.misses,
            memory_insertions: memory.insertions,
            memory_evictions: memory.evictions,
            memory_entries: self.memory.entry_count(),
            memory_used_bytes: self.memory.used_bytes(),
            durable_hits: durable.hits,
            durable_misses: durable.misses,
            durable_entries: self.durable.entry_count(),
            durable_bytes: self.durable.total_bytes(),
        }
    }

    /// The metrics registry this coordinator records into.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Inserts a recovered artifact into the memory tier. An artifact
    /// over the memory budget stays in the lower tiers only.
    fn promote_to_memory(&self, key: &CacheKey, content: &Bytes, width: u32, height: u32) {
        let entry = CacheEntry::new(
            content.clone(),
            ArtifactFormat::sniff(content),
            width,
            height,
            // Render time is unknown for recovered content; the
            // registry carries the real render statistics.
            0.0,
        );
        if let Err(e) = self.memory.put(key.clone(), entry) {
            debug!(tier = "memory", key = %key, error = %e, "Promotion skipped");
        }
    }
}

/// Maps a tier failure during startup or administration into the
/// public error type.
fn open_failure(e: TierError) -> CacheError {
    match e {
        TierError::Io(io) => CacheError::Io(io),
        other => CacheError::Io(std::io::Error::other(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::tier::remote::tests::{FailingRemoteStore, MockRemoteStore};
    use crate::tier::remote::RemoteStore;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn registry() -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new(MetricsConfig::default()))
    }

    fn artifact(size: usize, render_ms: f64) -> RenderedArtifact {
        RenderedArtifact::new(vec![7u8; size], ArtifactFormat::Svg, render_ms)
    }

    async fn open_local(dir: &TempDir) -> CacheCoordinator {
        let config = CacheConfig::new(dir.path());
        CacheCoordinator::open(&config, None, registry())
            .await
            .unwrap()
    }

    async fn open_with_store(
        dir: &TempDir,
        store: Arc<dyn RemoteStore>,
        memory_budget: usize,
    ) -> CacheCoordinator {
        let config = CacheConfig::new(dir.path())
            .with_memory_budget_bytes(memory_budget)
            .with_remote_store("http://test.invalid");
        let remote = RemoteTier::new(store, config.remote.as_ref().unwrap());
        CacheCoordinator::open(&config, Some(remote), registry())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_serves_from_memory() {
        let dir = TempDir::new().unwrap();
        let coordinator = open_local(&dir).await;

        coordinator
            .put("charts/bar.svg", 1920, 1080, &RenderOptions::new(), artifact(256, 40.0))
            .await
            .unwrap();
        let content = coordinator
            .get("charts/bar.svg", 1920, 1080, &RenderOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.len(), 256);

        let stats = coordinator.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.durable_hits, 0);
        // The write fanned out to the durable tier as well.
        assert_eq!(stats.durable_entries, 1);
    }

    #[tokio::test]
    async fn test_full_miss_returns_none() {
        let dir = TempDir::new().unwrap();
        let coordinator = open_local(&dir).await;
        let result = coordinator
            .get("absent.svg", 100, 100, &RenderOptions::new())
            .await
            .unwrap();
        assert!(result.is_none());

        let stats = coordinator.metrics().stats("absent.svg").unwrap();
        assert_eq!(stats.total_uses, 1);
        assert_eq!(stats.cache_hits, 0);
    }

    #[tokio::test]
    async fn test_oversized_artifact_skips_memory_but_serves_from_durable() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::new(dir.path()).with_memory_budget_bytes(16);
        let coordinator = CacheCoordinator::open(&config, None, registry())
            .await
            .unwrap();

        coordinator
            .put("big.svg", 4000, 4000, &RenderOptions::new(), artifact(100, 90.0))
            .await
            .unwrap();

        let stats = coordinator.stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.durable_entries, 1);

        // Served from L3; promotion to L1 is skipped again, silently.
        let content = coordinator
            .get("big.svg", 4000, 4000, &RenderOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.len(), 100);
        let stats = coordinator.stats();
        assert_eq!(stats.durable_hits, 1);
        assert_eq!(stats.memory_entries, 0);
    }

    #[tokio::test]
    async fn test_remote_hit_is_promoted_to_memory() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MockRemoteStore::default());

        // Seed only the distributed store, bypassing the coordinator.
        let config = CacheConfig::new(dir.path()).with_remote_store("http://test.invalid");
        let seed_tier = RemoteTier::new(store.clone(), config.remote.as_ref().unwrap());
        let key = derive_key("hot.svg", 1280, 720, &RenderOptions::new()).unwrap();
        seed_tier.put(&key, Bytes::from_static(b"shared artifact")).await.unwrap();

        let coordinator = open_with_store(&dir, store.clone(), 1024 * 1024).await;
        let first = coordinator
            .get("hot.svg", 1280, 720, &RenderOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_ref(), b"shared artifact");
        assert_eq!(store.gets.load(Ordering::Relaxed), 1);

        // Second lookup hits L1; neither L2 nor L3 is touched.
        let second = coordinator
            .get("hot.svg", 1280, 720, &RenderOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(store.gets.load(Ordering::Relaxed), 1);
        let stats = coordinator.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.durable_hits, 0);
    }

    #[tokio::test]
    async fn test_durable_hit_is_promoted_to_memory_and_remote() {
        let dir = TempDir::new().unwrap();

        // First process writes locally with no distributed tier.
        {
            let coordinator = open_local(&dir).await;
            coordinator
                .put("a.svg", 800, 600, &RenderOptions::new(), artifact(64, 10.0))
                .await
                .unwrap();
        }

        // Second process starts cold with an empty distributed store.
        let store = Arc::new(MockRemoteStore::default());
        let coordinator = open_with_store(&dir, store.clone(), 1024 * 1024).await;
        let content = coordinator
            .get("a.svg", 800, 600, &RenderOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.len(), 64);

        // The durable hit repaired both faster tiers.
        let key = derive_key("a.svg", 800, 600, &RenderOptions::new()).unwrap();
        assert!(store.contains(&key));
        assert_eq!(coordinator.stats().memory_entries, 1);
        assert_eq!(store.gets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failing_remote_degrades_to_durable() {
        let dir = TempDir::new().unwrap();
        // A 16-byte memory budget forces every lookup past L1.
        let coordinator = open_with_store(&dir, Arc::new(FailingRemoteStore), 16).await;

        coordinator
            .put("a.svg", 800, 600, &RenderOptions::new(), artifact(64, 10.0))
            .await
            .unwrap();
        let content = coordinator
            .get("a.svg", 800, 600, &RenderOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.len(), 64);
        assert_eq!(coordinator.stats().durable_hits, 1);
    }

    #[tokio::test]
    async fn test_contains_probes_local_tiers_only() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MockRemoteStore::default());
        let coordinator = open_with_store(&dir, store.clone(), 1024 * 1024).await;

        coordinator
            .put("a.svg", 800, 600, &RenderOptions::new(), artifact(32, 5.0))
            .await
            .unwrap();
        let sets_after_put = store.sets.load(Ordering::Relaxed);

        assert!(coordinator
            .contains("a.svg", 800, 600, &RenderOptions::new())
            .unwrap());
        assert!(!coordinator
            .contains("other.svg", 800, 600, &RenderOptions::new())
            .unwrap());

        // No remote traffic from either probe.
        assert_eq!(store.gets.load(Ordering::Relaxed), 0);
        assert_eq!(store.sets.load(Ordering::Relaxed), sets_after_put);
        // Probes are not lookups: no hit/miss accounting moved.
        assert_eq!(coordinator.stats().memory_hits, 0);
        assert_eq!(coordinator.stats().durable_misses, 0);
    }

    #[tokio::test]
    async fn test_clear_empties_local_tiers() {
        let dir = TempDir::new().unwrap();
        let coordinator = open_local(&dir).await;
        for label in ["a.svg", "b.svg"] {
            coordinator
                .put(label, 100, 100, &RenderOptions::new(), artifact(32, 5.0))
                .await
                .unwrap();
        }

        coordinator.clear().await.unwrap();
        let stats = coordinator.stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.durable_entries, 0);
        assert!(coordinator
            .get("a.svg", 100, 100, &RenderOptions::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_purge_reports_per_tier_counts() {
        let dir = TempDir::new().unwrap();
        let coordinator = open_local(&dir).await;

        coordinator
            .put("stale.svg", 100, 100, &RenderOptions::new(), artifact(32, 5.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        coordinator
            .put("fresh.svg", 100, 100, &RenderOptions::new(), artifact(32, 5.0))
            .await
            .unwrap();

        let (memory_purged, durable_purged) =
            coordinator.purge_older_than(Duration::from_millis(30)).await;
        assert_eq!(memory_purged, 1);
        assert_eq!(durable_purged, 1);
        assert!(coordinator
            .contains("fresh.svg", 100, 100, &RenderOptions::new())
            .unwrap());
        assert!(!coordinator
            .contains("stale.svg", 100, 100, &RenderOptions::new())
            .unwrap());
    }

    #[tokio::test]
    async fn test_malformed_options_fail_fast() {
        let dir = TempDir::new().unwrap();
        let coordinator = open_local(&dir).await;
        let options = RenderOptions::new().set("scale", f64::NAN);

        let err = coordinator
            .get("a.svg", 100, 100, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::MalformedKeyInput(_)));
    }

    #[tokio::test]
    async fn test_hit_rate_is_exact_over_lookup_sequence() {
        let dir = TempDir::new().unwrap();
        let coordinator = open_local(&dir).await;
        let options = RenderOptions::new();

        // Four misses, then a render, then six hits: 6/10 exactly.
        for _ in 0..4 {
            assert!(coordinator
                .get("chart.svg", 1920, 1080, &options)
                .await
                .unwrap()
                .is_none());
        }
        coordinator
            .put("chart.svg", 1920, 1080, &options, artifact(10_000, 120.0))
            .await
            .unwrap();
        for _ in 0..6 {
            assert!(coordinator
                .get("chart.svg", 1920, 1080, &options)
                .await
                .unwrap()
                .is_some());
        }

        let stats = coordinator.metrics().stats("chart.svg").unwrap();
        assert_eq!(stats.total_uses, 10);
        assert_eq!(stats.cache_hits, 6);
        assert_eq!(stats.cache_hit_rate(), 60.0);
        assert_eq!(stats.average_render_time_ms, 120.0);
    }
}
