//! Per-template metrics: running statistics, reports, analytics export.
//!
//! The registry is synchronous and lock-based so accounting is exact:
//! a recorded hit is visible to the next `report()` call with no
//! sampling delay. Per-template stats live in a concurrent map; the raw
//! event history sits behind its own mutex and is bounded, dropping the
//! oldest events first. The registry is shared via `Arc` between the
//! coordinator (producer) and the scheduler (consumer of snapshots).

pub mod event;
pub mod report;
pub mod stats;

pub use event::{EventKind, UsageEvent};
pub use report::{ExportFormat, MetricsReport, MetricsSummary, TemplateReportRow};
pub use stats::{TemplateStats, Trend};

use crate::config::MetricsConfig;
use crate::error::CacheError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use report::{NEEDS_OPTIMIZATION_LIMIT, OPTIMIZATION_HIT_RATE_FLOOR, TOP_PERFORMERS_LIMIT};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

/// Registry of per-template statistics and raw usage events.
pub struct MetricsRegistry {
    templates: DashMap<String, TemplateStats>,
    history: Mutex<VecDeque<UsageEvent>>,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            templates: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(config.event_history_limit.min(1024))),
            config,
        }
    }

    /// Records one lookup for a template. `render_time_ms` may carry the
    /// measured render duration when the caller folds a miss and its
    /// subsequent render into one call.
    pub fn record_event(&self, template_path: &str, hit: bool, render_time_ms: Option<f64>) {
        let now = Utc::now();
        {
            let mut stats = self.stats_entry(template_path, now);
            stats.record_use(hit, now);
            if let Some(ms) = render_time_ms {
                stats.record_render_sample(ms);
            }
        }
        self.push_event(UsageEvent::lookup(template_path, hit, render_time_ms, now));
    }

    /// Records a successful render and its duration. Does not count as a
    /// lookup; hit-rate accounting stays exact.
    pub fn record_render(&self, template_path: &str, render_time_ms: f64) {
        let now = Utc::now();
        {
            let mut stats = self.stats_entry(template_path, now);
            stats.record_render_sample(render_time_ms);
            stats.last_used = now;
        }
        self.push_event(UsageEvent::render(template_path, render_time_ms, now));
    }

    /// Records a failed render attempt; feeds the template's error rate.
    pub fn record_render_failure(&self, template_path: &str) {
        let now = Utc::now();
        {
            let mut stats = self.stats_entry(template_path, now);
            stats.record_render_failure();
        }
        self.push_event(UsageEvent::render_error(template_path, now));
    }

    /// Records an external engagement signal for content produced from a
    /// template.
    pub fn record_engagement(&self, template_path: &str, score: f64, completed: bool) {
        let now = Utc::now();
        {
            let mut stats = self.stats_entry(template_path, now);
            stats.record_engagement(score, completed);
        }
        self.push_event(UsageEvent::engagement(template_path, score, completed, now));
    }

    /// Usage trend for one template; `Stable` when unknown.
    pub fn trend(&self, template_path: &str) -> Trend {
        self.templates
            .get(template_path)
            .map(|stats| stats.trend())
            .unwrap_or(Trend::Stable)
    }

    /// Snapshot of one template's stats.
    pub fn stats(&self, template_path: &str) -> Option<TemplateStats> {
        self.templates.get(template_path).map(|s| s.clone())
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    /// The `n` templates with the highest hit rate (at least one use),
    /// ties broken by path for stable ordering.
    pub fn top_templates(&self, n: usize) -> Vec<TemplateReportRow> {
        let mut rows: Vec<TemplateReportRow> = self
            .templates
            .iter()
            .filter(|entry| entry.value().total_uses > 0)
            .map(|entry| TemplateReportRow::from_stats(entry.key(), entry.value()))
            .collect();
        rows.sort_by(|a, b| {
            b.cache_hit_rate
                .partial_cmp(&a.cache_hit_rate)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.template_path.cmp(&b.template_path))
        });
        rows.truncate(n);
        rows
    }

    /// Builds the dashboard snapshot: rollup summary, top performers,
    /// and the templates most in need of optimization.
    pub fn report(&self) -> MetricsReport {
        let mut rows = Vec::with_capacity(self.templates.len());
        let mut total_uses = 0u64;
        let mut total_hits = 0u64;
        let mut render_time_weighted = 0.0f64;
        let mut render_samples = 0u64;

        for entry in self.templates.iter() {
            let stats = entry.value();
            total_uses += stats.total_uses;
            total_hits += stats.cache_hits;
            render_time_weighted += stats.average_render_time_ms * stats.render_samples as f64;
            render_samples += stats.render_samples;
            rows.push(TemplateReportRow::from_stats(entry.key(), stats));
        }

        let summary = MetricsSummary {
            template_count: rows.len(),
            total_uses,
            overall_hit_rate: if total_uses == 0 {
                0.0
            } else {
                total_hits as f64 / total_uses as f64 * 100.0
            },
            average_render_time_ms: if render_samples == 0 {
                0.0
            } else {
                render_time_weighted / render_samples as f64
            },
        };

        let mut top: Vec<TemplateReportRow> = rows
            .iter()
            .filter(|row| row.total_uses > 0)
            .cloned()
            .collect();
        top.sort_by(|a, b| {
            b.cache_hit_rate
                .partial_cmp(&a.cache_hit_rate)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.template_path.cmp(&b.template_path))
        });
        top.truncate(TOP_PERFORMERS_LIMIT);

        let mut needs: Vec<TemplateReportRow> = rows
            .iter()
            .filter(|row| {
                row.total_uses > 0
                    && (row.cache_hit_rate < OPTIMIZATION_HIT_RATE_FLOOR
                        || row.average_render_time_ms > self.config.slow_render_threshold_ms)
            })
            .cloned()
            .collect();
        needs.sort_by(|a, b| {
            a.cache_hit_rate
                .partial_cmp(&b.cache_hit_rate)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.template_path.cmp(&b.template_path))
        });
        needs.truncate(NEEDS_OPTIMIZATION_LIMIT);

        MetricsReport {
            generated_at: Utc::now(),
            summary,
            top_performers: top,
            needs_optimization: needs,
        }
    }

    /// Emits raw events inside `[start, end]` as JSON or CSV.
    pub fn export_analytics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        format: ExportFormat,
    ) -> Result<String, CacheError> {
        let events: Vec<UsageEvent> = match self.history.lock() {
            Ok(history) => history
                .iter()
                .filter(|e| e.timestamp >= start && e.timestamp <= end)
                .cloned()
                .collect(),
            Err(_) => {
                warn!("Event history lock poisoned, exporting empty window");
                Vec::new()
            }
        };
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&events)?),
            ExportFormat::Csv => Ok(report::events_to_csv(&events)),
        }
    }

    fn stats_entry(
        &self,
        template_path: &str,
        now: DateTime<Utc>,
    ) -> dashmap::mapref::one::RefMut<'_, String, TemplateStats> {
        self.templates
            .entry(template_path.to_string())
            .or_insert_with(|| TemplateStats::new(now, self.config.trend_window))
    }

    fn push_event(&self, event: UsageEvent) {
        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(_) => {
                warn!("Event history lock poisoned, dropping event");
                return;
            }
        };
        history.push_back(event);
        while history.len() > self.config.event_history_limit {
            history.pop_front();
        }
    }
}
