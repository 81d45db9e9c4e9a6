//! platecache - Tiered asset cache and optimization engine for rendered
//! vector-template artifacts.
//!
//! This library stores, retrieves, evicts, and shrinks the artifacts a
//! content-generation pipeline renders from vector templates. It never
//! renders anything itself: a renderer asks for bytes, renders on a
//! miss, and reports the result back.
//!
//! Three tiers back every lookup with distinct latency/durability
//! tradeoffs: a budget-bounded LRU memory tier, an optional TTL-expired
//! distributed key-value tier, and a durable filesystem tier with a
//! metadata sidecar per entry. Hits are promoted upward; tier failures
//! degrade to the next tier and never surface to the caller.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides a wired facade:
//!
//! ```ignore
//! use platecache::config::CacheConfig;
//! use platecache::key::RenderOptions;
//! use platecache::service::CacheService;
//!
//! let config = CacheConfig::new("/var/cache/plates")
//!     .with_memory_budget_mb(100)
//!     .with_remote_store("http://kv.internal:7700");
//! let service = CacheService::start(config, renderer).await?;
//!
//! let options = RenderOptions::new().set("theme", "dark");
//! match service.cache().get("charts/bar.svg", 1920, 1080, &options).await? {
//!     Some(bytes) => serve(bytes),
//!     None => {
//!         let artifact = render("charts/bar.svg", 1920, 1080, &options)?;
//!         service.cache().put("charts/bar.svg", 1920, 1080, &options, artifact).await?;
//!     }
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod key;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod service;
pub mod tier;
pub mod time;

pub use config::CacheConfig;
pub use coordinator::{CacheCoordinator, CacheStats};
pub use entry::{ArtifactFormat, CacheEntry, EntryMetadata, RenderedArtifact};
pub use error::{CacheError, RemoteError, RenderError};
pub use key::{derive_key, CacheKey, OptionValue, RenderOptions};
pub use metrics::{ExportFormat, MetricsRegistry, MetricsReport, TemplateStats, Trend};
pub use optimizer::{OptimizationResult, Recommendation, TemplateOptimizer};
pub use scheduler::{Renderer, Scheduler};
pub use service::CacheService;

/// Version of the platecache library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
