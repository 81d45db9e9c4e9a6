//! Background scheduler: preloading and auto-optimization daemons.
//!
//! Two daemons run on independent timers and share a cancellation token
//! for graceful shutdown:
//!
//! - [`PreloadDaemon`] keeps the hottest templates warm at the common
//!   output sizes, asking the injected [`Renderer`] for anything absent.
//! - [`OptimizeDaemon`] reloads the source of templates flagged by the
//!   metrics report, runs the [`TemplateOptimizer`], persists worthwhile
//!   results next to the original, and purges cache entries past the
//!   retention window.
//!
//! Each sweep works from an immutable snapshot of the registry, so the
//! request path never contends with scheduler work beyond a single tier
//! operation. Cancellation between ticks simply skips the next sweep;
//! every sweep is self-contained.

use crate::config::SchedulerConfig;
use crate::coordinator::CacheCoordinator;
use crate::entry::RenderedArtifact;
use crate::error::RenderError;
use crate::key::RenderOptions;
use crate::metrics::MetricsRegistry;
use crate::optimizer::TemplateOptimizer;
use crate::tier::durable::write_atomic;
use crate::tier::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Produces rendered artifacts on behalf of the preloader.
///
/// The serving path never goes through this trait: on a miss the caller
/// renders and reports the result itself. The preloader, however, has
/// nobody to render for it, so it borrows the renderer the pipeline
/// already has. Object-safe so the daemon can hold `Arc<dyn Renderer>`.
pub trait Renderer: Send + Sync {
    fn render<'a>(
        &'a self,
        template_path: &'a str,
        width: u32,
        height: u32,
        options: &'a RenderOptions,
    ) -> BoxFuture<'a, Result<RenderedArtifact, RenderError>>;
}

/// What one preload sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadOutcome {
    /// (template, size) pairs rendered and cached.
    pub preloaded: usize,
    /// Pairs already present in a local tier.
    pub skipped: usize,
    /// Render attempts that failed.
    pub failed: usize,
}

/// What one optimize sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeOutcome {
    /// Templates whose optimized source was persisted.
    pub optimized: usize,
    /// Flagged templates whose savings fell under the threshold or whose
    /// source is unchanged since the last pass.
    pub skipped: usize,
    /// Templates whose source could not be read or written.
    pub failed: usize,
    /// Entries purged from the memory tier past retention.
    pub memory_purged: usize,
    /// Entries purged from the durable tier past retention.
    pub durable_purged: usize,
}

/// Daemon that keeps hot templates cached at the common output sizes.
pub struct PreloadDaemon {
    coordinator: Arc<CacheCoordinator>,
    registry: Arc<MetricsRegistry>,
    renderer: Arc<dyn Renderer>,
    sizes: Vec<(u32, u32)>,
    top_n: usize,
    interval: Duration,
}

impl PreloadDaemon {
    pub fn new(
        coordinator: Arc<CacheCoordinator>,
        registry: Arc<MetricsRegistry>,
        renderer: Arc<dyn Renderer>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            renderer,
            sizes: config.preload_sizes.clone(),
            top_n: config.preload_top_n,
            interval: config.preload_interval,
        }
    }

    /// Runs the daemon until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            top_n = self.top_n,
            sizes = self.sizes.len(),
            "Preload daemon starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Preload daemon shutting down");
                    break;
                }

                _ = interval.tick() => {
                    let outcome = self.sweep().await;
                    debug!(
                        preloaded = outcome.preloaded,
                        skipped = outcome.skipped,
                        failed = outcome.failed,
                        "Preload sweep complete"
                    );
                }
            }
        }
    }

    /// One preload pass over the current top templates.
    ///
    /// Idempotent: pairs already present in a local tier are skipped
    /// without touching recency or metrics. Render failures are logged
    /// and recorded against the template, never fatal to the daemon.
    pub async fn sweep(&self) -> PreloadOutcome {
        let mut outcome = PreloadOutcome::default();
        // Preloads use default options; option-specific variants stay
        // demand-driven.
        let options = RenderOptions::new();

        for row in self.registry.top_templates(self.top_n) {
            for &(width, height) in &self.sizes {
                match self
                    .coordinator
                    .contains(&row.template_path, width, height, &options)
                {
                    Ok(true) => {
                        outcome.skipped += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(template = %row.template_path, error = %e, "Preload probe failed");
                        outcome.failed += 1;
                        continue;
                    }
                }

                match self
                    .renderer
                    .render(&row.template_path, width, height, &options)
                    .await
                {
                    Ok(artifact) => {
                        if let Err(e) = self
                            .coordinator
                            .put(&row.template_path, width, height, &options, artifact)
                            .await
                        {
                            warn!(template = %row.template_path, error = %e, "Preload store failed");
                            outcome.failed += 1;
                        } else {
                            debug!(
                                template = %row.template_path,
                                width = width,
                                height = height,
                                "Preloaded template"
                            );
                            outcome.preloaded += 1;
                        }
                    }
                    Err(e) => {
                        warn!(
                            template = %row.template_path,
                            width = width,
                            height = height,
                            error = %e,
                            "Preload render failed"
                        );
                        self.registry.record_render_failure(&row.template_path);
                        outcome.failed += 1;
                    }
                }
            }
        }
        outcome
    }
}

/// Daemon that optimizes flagged template sources and prunes cold cache
/// entries.
pub struct OptimizeDaemon {
    coordinator: Arc<CacheCoordinator>,
    registry: Arc<MetricsRegistry>,
    optimizer: Arc<TemplateOptimizer>,
    template_root: PathBuf,
    retention: Duration,
    interval: Duration,
    /// Source mtime at the last successful optimization, per template.
    /// An unchanged source is not re-optimized on later sweeps.
    last_optimized: Mutex<HashMap<String, SystemTime>>,
}

impl OptimizeDaemon {
    pub fn new(
        coordinator: Arc<CacheCoordinator>,
        registry: Arc<MetricsRegistry>,
        optimizer: Arc<TemplateOptimizer>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            optimizer,
            template_root: config.template_root.clone(),
            retention: config.retention,
            interval: config.optimize_interval,
            last_optimized: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the daemon until shutdown is signalled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            template_root = %self.template_root.display(),
            retention_secs = self.retention.as_secs(),
            "Optimize daemon starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Optimize daemon shutting down");
                    break;
                }

                _ = interval.tick() => {
                    let outcome = self.sweep().await;
                    debug!(
                        optimized = outcome.optimized,
                        skipped = outcome.skipped,
                        failed = outcome.failed,
                        memory_purged = outcome.memory_purged,
                        durable_purged = outcome.durable_purged,
                        "Optimize sweep complete"
                    );
                }
            }
        }
    }

    /// One pass over the templates flagged by the metrics report,
    /// followed by a retention purge of the local tiers.
    pub async fn sweep(&self) -> OptimizeOutcome {
        let mut outcome = OptimizeOutcome::default();
        let report = self.registry.report();

        for row in &report.needs_optimization {
            match self.optimize_one(&row.template_path).await {
                Ok(true) => outcome.optimized += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    warn!(template = %row.template_path, error = %e, "Optimization pass failed");
                    outcome.failed += 1;
                }
            }
        }

        let (memory_purged, durable_purged) =
            self.coordinator.purge_older_than(self.retention).await;
        outcome.memory_purged = memory_purged;
        outcome.durable_purged = durable_purged;
        outcome
    }

    /// Optimizes one template source. `Ok(true)` means an optimized
    /// artifact was persisted; `Ok(false)` means the source was skipped
    /// (unchanged since the last pass, or savings under the threshold).
    async fn optimize_one(&self, template_path: &str) -> std::io::Result<bool> {
        let source_path = self.template_root.join(template_path);
        let mtime = fs::metadata(&source_path).await?.modified()?;

        if let Ok(seen) = self.last_optimized.lock() {
            if seen.get(template_path) == Some(&mtime) {
                return Ok(false);
            }
        }

        let raw = fs::read(&source_path).await?;
        let (optimized, result) = self.optimizer.optimize(template_path, &raw);

        if result.compression_ratio <= self.optimizer.config().min_compression_ratio {
            debug!(
                template = template_path,
                ratio = format!("{:.1}", result.compression_ratio),
                "Savings under threshold, keeping original source"
            );
            self.mark_optimized(template_path, mtime);
            return Ok(false);
        }

        let target = optimized_source_path(&source_path);
        write_atomic(&target, &optimized).await?;
        info!(
            template = template_path,
            original_size = result.original_size,
            optimized_size = result.optimized_size,
            ratio = format!("{:.1}", result.compression_ratio),
            recommendations = result.recommendations.len(),
            target = %target.display(),
            "Persisted optimized template source"
        );
        self.mark_optimized(template_path, mtime);
        Ok(true)
    }

    fn mark_optimized(&self, template_path: &str, mtime: SystemTime) {
        if let Ok(mut seen) = self.last_optimized.lock() {
            seen.insert(template_path.to_string(), mtime);
        }
    }
}

/// Path the optimized copy of a template source is written to:
/// `chart.svg` becomes `chart.opt.svg`, keeping it next to the original.
fn optimized_source_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("template");
    let name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.opt.{ext}"),
        None => format!("{stem}.opt"),
    };
    source.with_file_name(name)
}

/// Handle over the running daemons.
///
/// Both loops share one cancellation token; [`Scheduler::shutdown`]
/// cancels it and awaits both join handles.
pub struct Scheduler {
    shutdown: CancellationToken,
    preload_handle: JoinHandle<()>,
    optimize_handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawns the preload and optimize daemons on their own timers.
    pub fn start(
        coordinator: Arc<CacheCoordinator>,
        registry: Arc<MetricsRegistry>,
        renderer: Arc<dyn Renderer>,
        optimizer: Arc<TemplateOptimizer>,
        config: &SchedulerConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let preload = PreloadDaemon::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            renderer,
            config,
        );
        let optimize = OptimizeDaemon::new(coordinator, registry, optimizer, config);

        let preload_handle = tokio::spawn(preload.run(shutdown.clone()));
        let optimize_handle = tokio::spawn(optimize.run(shutdown.clone()));
        Self {
            shutdown,
            preload_handle,
            optimize_handle,
        }
    }

    /// Signals both daemons and waits for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.preload_handle.await;
        let _ = self.optimize_handle.await;
        info!("Scheduler stopped");
    }
}
