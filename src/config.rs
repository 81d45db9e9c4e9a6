//! Cache engine configuration.
//!
//! All tunables are supplied at construction with documented defaults.
//! `CacheConfig::new` only needs the durable-tier directory; everything
//! else can be adjusted through the `with_*` builder methods. Hard
//! configuration errors are reported by [`CacheConfig::validate`], which
//! the service runs before wiring any tier.

use crate::error::CacheError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default memory-tier byte budget: 100 MB.
pub const DEFAULT_MEMORY_BUDGET_BYTES: usize = 100 * 1024 * 1024;

/// Default TTL for distributed-tier writes: 1 hour.
pub const DEFAULT_REMOTE_TTL_SECS: u64 = 3600;

/// Default per-operation timeout for the distributed tier: 3 seconds.
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 3;

/// Default interval between preload sweeps: 5 minutes.
pub const DEFAULT_PRELOAD_INTERVAL_SECS: u64 = 300;

/// Default interval between auto-optimize sweeps: 10 minutes.
pub const DEFAULT_OPTIMIZE_INTERVAL_SECS: u64 = 600;

/// Default retention window for cold entries: 7 days.
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// How many hot templates a preload sweep considers.
pub const DEFAULT_PRELOAD_TOP_N: usize = 5;

/// Output sizes preloaded for hot templates.
pub const DEFAULT_PRELOAD_SIZES: &[(u32, u32)] = &[(1920, 1080), (1280, 720), (854, 480)];

/// Default directory holding template sources for auto-optimization.
pub const DEFAULT_TEMPLATE_ROOT: &str = "templates";

/// Minimum compression ratio (%) before an optimized artifact is kept.
pub const DEFAULT_MIN_COMPRESSION_RATIO: f64 = 10.0;

/// Decimal places kept when normalizing numeric attributes.
pub const DEFAULT_MAX_PRECISION: u32 = 2;

/// JPEG quality used when re-encoding embedded raster payloads.
pub const DEFAULT_PAYLOAD_QUALITY: u8 = 80;

/// Optimized artifacts above this size get a "split" recommendation.
pub const DEFAULT_SIZE_THRESHOLD_BYTES: usize = 100 * 1024;

/// Average render time (ms) above which a template is flagged for
/// optimization.
pub const DEFAULT_SLOW_RENDER_THRESHOLD_MS: f64 = 500.0;

/// How many raw usage events the registry retains for analytics export.
pub const DEFAULT_EVENT_HISTORY_LIMIT: usize = 10_000;

/// How many recent events feed the per-template trend calculation.
pub const DEFAULT_TREND_WINDOW: usize = 50;

/// Memory tier (L1) settings.
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    /// Aggregate byte budget; inserts beyond it trigger LRU eviction.
    pub max_size_bytes: usize,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
        }
    }
}

/// Distributed tier (L2) settings. The tier is optional; a config
/// without one runs memory + durable only.
#[derive(Debug, Clone)]
pub struct RemoteTierConfig {
    /// Base URL of the shared key-value store.
    pub endpoint: String,
    /// TTL attached to every write; the store expires entries itself.
    pub ttl: Duration,
    /// Upper bound on any single get/set; a timeout counts as the tier
    /// being unavailable for that one operation.
    pub op_timeout: Duration,
}

impl RemoteTierConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ttl: Duration::from_secs(DEFAULT_REMOTE_TTL_SECS),
            op_timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
        }
    }
}

/// Durable tier (L3) settings.
#[derive(Debug, Clone)]
pub struct DurableTierConfig {
    /// Directory holding one content blob + one metadata sidecar per
    /// entry. Created at startup if absent.
    pub directory: PathBuf,
}

/// Template optimizer settings.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Decimal places kept for numeric attribute values.
    pub max_precision: u32,
    /// JPEG quality (1-100) for re-encoded embedded payloads.
    pub payload_quality: u8,
    /// Ratio (%) below which optimization is not worth persisting.
    pub min_compression_ratio: f64,
    /// Optimized size above which a split is recommended.
    pub size_threshold_bytes: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_precision: DEFAULT_MAX_PRECISION,
            payload_quality: DEFAULT_PAYLOAD_QUALITY,
            min_compression_ratio: DEFAULT_MIN_COMPRESSION_RATIO,
            size_threshold_bytes: DEFAULT_SIZE_THRESHOLD_BYTES,
        }
    }
}

/// Background scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub preload_interval: Duration,
    pub optimize_interval: Duration,
    /// (width, height) pairs preloaded for each hot template.
    pub preload_sizes: Vec<(u32, u32)>,
    /// How many hot templates each preload sweep covers.
    pub preload_top_n: usize,
    /// Directory the optimize sweep reloads template sources from.
    pub template_root: PathBuf,
    /// Entries not accessed within this window are purged.
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            preload_interval: Duration::from_secs(DEFAULT_PRELOAD_INTERVAL_SECS),
            optimize_interval: Duration::from_secs(DEFAULT_OPTIMIZE_INTERVAL_SECS),
            preload_sizes: DEFAULT_PRELOAD_SIZES.to_vec(),
            preload_top_n: DEFAULT_PRELOAD_TOP_N,
            template_root: PathBuf::from(DEFAULT_TEMPLATE_ROOT),
            retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * 24 * 60 * 60),
        }
    }
}

/// Metrics registry settings.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Average render time (ms) above which a template needs
    /// optimization regardless of hit rate.
    pub slow_render_threshold_ms: f64,
    /// Bounded raw-event history size; oldest events drop first.
    pub event_history_limit: usize,
    /// Recent-event window used by the trend calculation.
    pub trend_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            slow_render_threshold_ms: DEFAULT_SLOW_RENDER_THRESHOLD_MS,
            event_history_limit: DEFAULT_EVENT_HISTORY_LIMIT,
            trend_window: DEFAULT_TREND_WINDOW,
        }
    }
}

/// Top-level configuration for the cache engine.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory: MemoryTierConfig,
    pub remote: Option<RemoteTierConfig>,
    pub durable: DurableTierConfig,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    pub metrics: MetricsConfig,
}

impl CacheConfig {
    /// Creates a configuration with defaults, rooted at the given
    /// durable-tier directory. No distributed tier is configured.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            memory: MemoryTierConfig::default(),
            remote: None,
            durable: DurableTierConfig {
                directory: cache_dir.into(),
            },
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Sets the memory tier budget in megabytes.
    pub fn with_memory_budget_mb(mut self, mb: usize) -> Self {
        self.memory.max_size_bytes = mb * 1024 * 1024;
        self
    }

    /// Sets the memory tier budget in bytes.
    pub fn with_memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.memory.max_size_bytes = bytes;
        self
    }

    /// Enables the distributed tier against the given endpoint with
    /// default TTL and timeout.
    pub fn with_remote_store(mut self, endpoint: impl Into<String>) -> Self {
        self.remote = Some(RemoteTierConfig::new(endpoint));
        self
    }

    /// Sets the TTL attached to distributed-tier writes. No-op unless a
    /// remote store was configured.
    pub fn with_remote_ttl_secs(mut self, secs: u64) -> Self {
        if let Some(remote) = self.remote.as_mut() {
            remote.ttl = Duration::from_secs(secs);
        }
        self
    }

    /// Sets the per-operation timeout for the distributed tier. No-op
    /// unless a remote store was configured.
    pub fn with_remote_timeout_ms(mut self, ms: u64) -> Self {
        if let Some(remote) = self.remote.as_mut() {
            remote.op_timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Sets the directory template sources are reloaded from during
    /// auto-optimization.
    pub fn with_template_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.scheduler.template_root = path.into();
        self
    }

    /// Sets the output sizes preloaded for hot templates.
    pub fn with_preload_sizes(mut self, sizes: Vec<(u32, u32)>) -> Self {
        self.scheduler.preload_sizes = sizes;
        self
    }

    /// Sets how many hot templates each preload sweep covers.
    pub fn with_preload_top_n(mut self, n: usize) -> Self {
        self.scheduler.preload_top_n = n;
        self
    }

    pub fn with_preload_interval_secs(mut self, secs: u64) -> Self {
        self.scheduler.preload_interval = Duration::from_secs(secs);
        self
    }

    pub fn with_optimize_interval_secs(mut self, secs: u64) -> Self {
        self.scheduler.optimize_interval = Duration::from_secs(secs);
        self
    }

    /// Sets the retention window for cold entries, in days.
    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.scheduler.retention = Duration::from_secs(days * 24 * 60 * 60);
        self
    }

    /// Sets the minimum compression ratio (%) worth persisting,
    /// clamped to 0-100.
    pub fn with_min_compression_ratio(mut self, ratio: f64) -> Self {
        let clamped = ratio.clamp(0.0, 100.0);
        if clamped != ratio {
            warn!(
                requested = ratio,
                clamped = clamped,
                "Minimum compression ratio out of range, clamping"
            );
        }
        self.optimizer.min_compression_ratio = clamped;
        self
    }

    /// Sets the JPEG quality for re-encoded payloads, clamped to 1-100.
    pub fn with_payload_quality(mut self, quality: u8) -> Self {
        let clamped = quality.clamp(1, 100);
        if clamped != quality {
            warn!(
                requested = quality,
                clamped = clamped,
                "Payload quality out of range, clamping"
            );
        }
        self.optimizer.payload_quality = clamped;
        self
    }

    pub fn with_max_precision(mut self, decimals: u32) -> Self {
        self.optimizer.max_precision = decimals;
        self
    }

    pub fn with_size_threshold_bytes(mut self, bytes: usize) -> Self {
        self.optimizer.size_threshold_bytes = bytes;
        self
    }

    pub fn with_slow_render_threshold_ms(mut self, ms: f64) -> Self {
        self.metrics.slow_render_threshold_ms = ms;
        self
    }

    /// Validates the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.memory.max_size_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "memory budget must be greater than zero".to_string(),
            ));
        }
        if let Some(remote) = &self.remote {
            if remote.endpoint.trim().is_empty() {
                return Err(CacheError::InvalidConfig(
                    "remote store endpoint must not be empty".to_string(),
                ));
            }
            if remote.ttl.is_zero() {
                return Err(CacheError::InvalidConfig(
                    "remote TTL must be greater than zero".to_string(),
                ));
            }
            if remote.op_timeout.is_zero() {
                return Err(CacheError::InvalidConfig(
                    "remote operation timeout must be greater than zero".to_string(),
                ));
            }
        }
        if self.scheduler.preload_sizes.is_empty() {
            return Err(CacheError::InvalidConfig(
                "preload size list must not be empty".to_string(),
            ));
        }
        if self.scheduler.preload_top_n == 0 {
            return Err(CacheError::InvalidConfig(
                "preload top-N must be at least 1".to_string(),
            ));
        }
        if self.scheduler.preload_interval < Duration::from_secs(1)
            || self.scheduler.optimize_interval < Duration::from_secs(1)
        {
            return Err(CacheError::InvalidConfig(
                "scheduler intervals must be at least one second".to_string(),
            ));
        }
        if self.scheduler.retention.is_zero() {
            return Err(CacheError::InvalidConfig(
                "retention window must be greater than zero".to_string(),
            ));
        }
        if self.metrics.trend_window < 10 {
            return Err(CacheError::InvalidConfig(
                "trend window must be at least 10 events".to_string(),
            ));
        }
        if self.metrics.event_history_limit == 0 {
            return Err(CacheError::InvalidConfig(
                "event history limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
