//! Raw usage events retained for analytics export.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What kind of activity an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hit,
    Miss,
    Render,
    RenderError,
    Engagement,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Hit => "hit",
            EventKind::Miss => "miss",
            EventKind::Render => "render",
            EventKind::RenderError => "render_error",
            EventKind::Engagement => "engagement",
        }
    }
}

/// One recorded event. Optional fields are present only for the kinds
/// that carry them.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub template_path: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl UsageEvent {
    pub fn lookup(
        template_path: &str,
        hit: bool,
        render_time_ms: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            template_path: template_path.to_string(),
            kind: if hit { EventKind::Hit } else { EventKind::Miss },
            render_time_ms,
            engagement_score: None,
            completed: None,
        }
    }

    pub fn render(template_path: &str, render_time_ms: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            template_path: template_path.to_string(),
            kind: EventKind::Render,
            render_time_ms: Some(render_time_ms),
            engagement_score: None,
            completed: None,
        }
    }

    pub fn render_error(template_path: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            template_path: template_path.to_string(),
            kind: EventKind::RenderError,
            render_time_ms: None,
            engagement_score: None,
            completed: None,
        }
    }

    pub fn engagement(
        template_path: &str,
        score: f64,
        completed: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            template_path: template_path.to_string(),
            kind: EventKind::Engagement,
            render_time_ms: None,
            engagement_score: Some(score),
            completed: Some(completed),
        }
    }
}
