//! Report snapshot and analytics export formats.
//!
//! Everything here is a JSON-serializable snapshot for dashboards;
//! nothing mutates the registry.

use crate::error::CacheError;
use crate::metrics::event::UsageEvent;
use crate::metrics::stats::{TemplateStats, Trend};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How many templates the report's top-performer list carries.
pub const TOP_PERFORMERS_LIMIT: usize = 5;

/// How many templates the report's needs-optimization list carries.
pub const NEEDS_OPTIMIZATION_LIMIT: usize = 5;

/// Hit rate (%) below which a template needs optimization.
pub const OPTIMIZATION_HIT_RATE_FLOOR: f64 = 50.0;

/// Output format for [`export_analytics`](crate::metrics::MetricsRegistry::export_analytics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// One template's aggregates as exposed in reports.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateReportRow {
    pub template_path: String,
    pub total_uses: u64,
    pub cache_hit_rate: f64,
    pub average_render_time_ms: f64,
    pub error_rate: f64,
    pub average_engagement_score: f64,
    pub completion_rate: f64,
    pub trend: Trend,
    pub last_used: DateTime<Utc>,
}

impl TemplateReportRow {
    pub(crate) fn from_stats(template_path: &str, stats: &TemplateStats) -> Self {
        Self {
            template_path: template_path.to_string(),
            total_uses: stats.total_uses,
            cache_hit_rate: stats.cache_hit_rate(),
            average_render_time_ms: stats.average_render_time_ms,
            error_rate: stats.error_rate(),
            average_engagement_score: stats.average_engagement_score,
            completion_rate: stats.completion_rate(),
            trend: stats.trend(),
            last_used: stats.last_used,
        }
    }
}

/// Whole-registry rollup.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub template_count: usize,
    pub total_uses: u64,
    pub overall_hit_rate: f64,
    /// Render-sample-weighted mean across templates.
    pub average_render_time_ms: f64,
}

/// Snapshot returned by [`MetricsRegistry::report`](crate::metrics::MetricsRegistry::report).
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub summary: MetricsSummary,
    /// Top templates by hit rate (highest first).
    pub top_performers: Vec<TemplateReportRow>,
    /// Templates with a low hit rate or slow renders (worst first).
    pub needs_optimization: Vec<TemplateReportRow>,
}

impl MetricsReport {
    pub fn to_json(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Renders events as CSV with a fixed header row. Optional fields are
/// left empty rather than zero-filled so spreadsheets can tell "absent"
/// from "0".
pub(crate) fn events_to_csv(events: &[UsageEvent]) -> String {
    let mut out =
        String::from("timestamp,template_path,kind,render_time_ms,engagement_score,completed\n");
    for event in events {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            event.timestamp.to_rfc3339(),
            csv_field(&event.template_path),
            event.kind.as_str(),
            event
                .render_time_ms
                .map(|v| v.to_string())
                .unwrap_or_default(),
            event
                .engagement_score
                .map(|v| v.to_string())
                .unwrap_or_default(),
            event.completed.map(|v| v.to_string()).unwrap_or_default(),
        ));
    }
    out
}

/// Quotes a field when it contains CSV metacharacters.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_has_header_and_one_line_per_event() {
        let now = Utc::now();
        let events = vec![
            UsageEvent::lookup("a.svg", true, None, now),
            UsageEvent::render("a.svg", 12.5, now),
        ];
        let csv = events_to_csv(&events);
        let lines: Vec<&str> = csv.trim_end().lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,template_path,kind"));
        assert!(lines[1].contains(",hit,"));
        assert!(lines[2].contains(",render,12.5,"));
    }

    #[test]
    fn test_csv_quotes_fields_with_commas() {
        let event = UsageEvent::lookup("charts/a,b.svg", false, None, Utc::now());
        let csv = events_to_csv(&[event]);
        assert!(csv.contains("\"charts/a,b.svg\""));
    }

    #[test]
    fn test_csv_escapes_embedded_quotes() {
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("plain"), "plain");
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = MetricsReport {
            generated_at: Utc::now(),
            summary: MetricsSummary {
                template_count: 1,
                total_uses: 4,
                overall_hit_rate: 75.0,
                average_render_time_ms: 10.0,
            },
            top_performers: Vec::new(),
            needs_optimization: Vec::new(),
        };
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["total_uses"], 4);
        assert_eq!(value["summary"]["overall_hit_rate"], 75.0);
    }
}
