//! High-level service facade for the cache engine.
//!
//! `CacheService` encapsulates component wiring: it validates the
//! configuration, opens the tiers, builds the metrics registry and the
//! optimizer, and starts the background scheduler. The service is an
//! explicitly constructed object handed into the render pipeline by
//! reference; there is no process-wide singleton and no global event
//! bus. Shut it down with [`CacheService::shutdown`] to stop the
//! daemons before dropping the tiers.
//!
//! # Example
//!
//! ```ignore
//! use platecache::service::CacheService;
//! use platecache::config::CacheConfig;
//!
//! let config = CacheConfig::new("/var/cache/plates")
//!     .with_memory_budget_mb(100)
//!     .with_remote_store("http://kv.internal:7700");
//! let service = CacheService::start(config, renderer).await?;
//!
//! // Serving path: lookup, render on miss, report back.
//! if let Some(bytes) = service.cache().get(path, w, h, &options).await? {
//!     return Ok(bytes);
//! }
//! let artifact = render(path, w, h, &options)?;
//! service.cache().put(path, w, h, &options, artifact).await?;
//!
//! service.shutdown().await;
//! ```

use crate::config::CacheConfig;
use crate::coordinator::CacheCoordinator;
use crate::error::CacheError;
use crate::metrics::MetricsRegistry;
use crate::optimizer::TemplateOptimizer;
use crate::scheduler::{Renderer, Scheduler};
use crate::tier::remote::{HttpRemoteStore, RemoteTier};
use std::sync::Arc;
use tracing::{info, warn};

/// A running cache engine with its background scheduler.
pub struct CacheService {
    coordinator: Arc<CacheCoordinator>,
    registry: Arc<MetricsRegistry>,
    optimizer: Arc<TemplateOptimizer>,
    scheduler: Scheduler,
}

impl CacheService {
    /// Validates the configuration, wires every component, and starts
    /// the scheduler daemons.
    ///
    /// The renderer is only ever called by the preloader; the serving
    /// path renders for itself and reports results through
    /// [`CacheCoordinator::put`].
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidConfig`] for a bad configuration, or
    /// [`CacheError::Io`] when the durable directory cannot be created
    /// or scanned. A distributed store that fails client construction is
    /// logged and dropped; the service runs on the local tiers.
    pub async fn start(
        config: CacheConfig,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let remote = match &config.remote {
            Some(remote_config) => match HttpRemoteStore::new(remote_config.endpoint.clone()) {
                Ok(store) => Some(RemoteTier::new(Arc::new(store), remote_config)),
                Err(e) => {
                    warn!(
                        endpoint = %remote_config.endpoint,
                        error = %e,
                        "Distributed store client failed to build, running on local tiers"
                    );
                    None
                }
            },
            None => None,
        };
        let has_remote = remote.is_some();

        let registry = Arc::new(MetricsRegistry::new(config.metrics.clone()));
        let coordinator = Arc::new(
            CacheCoordinator::open(&config, remote, Arc::clone(&registry)).await?,
        );
        let optimizer = Arc::new(TemplateOptimizer::new(config.optimizer.clone()));
        let scheduler = Scheduler::start(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            renderer,
            Arc::clone(&optimizer),
            &config.scheduler,
        );

        info!(
            memory_budget_bytes = config.memory.max_size_bytes,
            remote = has_remote,
            durable_dir = %config.durable.directory.display(),
            "Cache service started"
        );
        Ok(Self {
            coordinator,
            registry,
            optimizer,
            scheduler,
        })
    }

    /// The tier coordinator: the serving path's `get`/`put` surface.
    pub fn cache(&self) -> Arc<CacheCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// The metrics registry, for reports, analytics export, and
    /// engagement signals.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.registry)
    }

    /// The optimizer, for on-demand optimization outside the scheduler.
    pub fn optimizer(&self) -> Arc<TemplateOptimizer> {
        Arc::clone(&self.optimizer)
    }

    /// Stops the scheduler daemons and releases the tiers.
    ///
    /// Consumes the service so nothing can use the cache after its
    /// daemons are gone.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        info!("Cache service stopped");
    }
}
