//! Per-template running statistics.
//!
//! Stats are created lazily on a template's first event and updated
//! incrementally: averages use a streaming mean, rates are counter
//! ratios, and the usage trend is computed over a bounded window of
//! recent event timestamps. Nothing here allocates per lookup beyond
//! the window ring.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Usage trend over a template's recent event window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
        }
    }
}

/// Below this many windowed events the trend is "stable" by definition.
pub const TREND_MIN_EVENTS: usize = 10;

const TREND_INCREASE_FACTOR: f64 = 1.2;
const TREND_DECREASE_FACTOR: f64 = 0.8;

/// Aggregate statistics for one template.
#[derive(Debug, Clone)]
pub struct TemplateStats {
    /// Total lookups (hits + misses).
    pub total_uses: u64,
    pub cache_hits: u64,
    /// Streaming mean over render samples reported by the renderer.
    pub average_render_time_ms: f64,
    pub render_samples: u64,
    pub render_failures: u64,
    /// Streaming mean over engagement scores (external signal).
    pub average_engagement_score: f64,
    pub engagement_samples: u64,
    pub completions: u64,
    pub last_used: DateTime<Utc>,
    /// Recent lookup timestamps feeding the trend window.
    recent: VecDeque<DateTime<Utc>>,
    window: usize,
}

impl TemplateStats {
    pub fn new(now: DateTime<Utc>, window: usize) -> Self {
        Self {
            total_uses: 0,
            cache_hits: 0,
            average_render_time_ms: 0.0,
            render_samples: 0,
            render_failures: 0,
            average_engagement_score: 0.0,
            engagement_samples: 0,
            completions: 0,
            last_used: now,
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Records one lookup (hit or miss) at the given time.
    pub fn record_use(&mut self, hit: bool, now: DateTime<Utc>) {
        self.total_uses += 1;
        if hit {
            self.cache_hits += 1;
        }
        self.last_used = now;
        self.recent.push_back(now);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }

    /// Folds one render duration into the streaming mean.
    pub fn record_render_sample(&mut self, render_time_ms: f64) {
        self.render_samples += 1;
        let n = self.render_samples as f64;
        self.average_render_time_ms =
            (self.average_render_time_ms * (n - 1.0) + render_time_ms) / n;
    }

    pub fn record_render_failure(&mut self) {
        self.render_failures += 1;
    }

    /// Folds one engagement signal into the aggregates.
    pub fn record_engagement(&mut self, score: f64, completed: bool) {
        self.engagement_samples += 1;
        let n = self.engagement_samples as f64;
        self.average_engagement_score =
            (self.average_engagement_score * (n - 1.0) + score) / n;
        if completed {
            self.completions += 1;
        }
    }

    /// Hit percentage over all lookups; 0 when the template has none.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_uses == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.total_uses as f64 * 100.0
    }

    /// Failure percentage over all render attempts.
    pub fn error_rate(&self) -> f64 {
        let attempts = self.render_samples + self.render_failures;
        if attempts == 0 {
            return 0.0;
        }
        self.render_failures as f64 / attempts as f64 * 100.0
    }

    /// Completion percentage over engagement signals.
    pub fn completion_rate(&self) -> f64 {
        if self.engagement_samples == 0 {
            return 0.0;
        }
        self.completions as f64 / self.engagement_samples as f64 * 100.0
    }

    /// Compares the request rate of the first and second half of the
    /// recent window.
    ///
    /// Degenerate spans (too few events, zero or negative time deltas,
    /// an idle first half) report `Stable` rather than dividing by zero.
    pub fn trend(&self) -> Trend {
        let n = self.recent.len();
        if n < TREND_MIN_EVENTS {
            return Trend::Stable;
        }
        let timestamps: Vec<DateTime<Utc>> = self.recent.iter().copied().collect();
        let mid = n / 2;
        let first = half_rate(&timestamps[..mid]);
        let second = half_rate(&timestamps[mid..]);
        match (first, second) {
            (Some(first), Some(second)) if first > 0.0 => {
                let ratio = second / first;
                if ratio > TREND_INCREASE_FACTOR {
                    Trend::Increasing
                } else if ratio < TREND_DECREASE_FACTOR {
                    Trend::Decreasing
                } else {
                    Trend::Stable
                }
            }
            _ => Trend::Stable,
        }
    }
}

/// Events per millisecond across one half of the window, or `None` when
/// the span is degenerate.
fn half_rate(timestamps: &[DateTime<Utc>]) -> Option<f64> {
    let (first, last) = (timestamps.first()?, timestamps.last()?);
    if timestamps.len() < 2 {
        return None;
    }
    let span_ms = (*last - *first).num_milliseconds();
    if span_ms <= 0 {
        return None;
    }
    Some(timestamps.len() as f64 / span_ms as f64)
}
