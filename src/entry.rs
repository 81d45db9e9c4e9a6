//! Cache entry data model shared by the tiers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Format of a rendered artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Svg,
    Png,
    Webp,
    Jpeg,
}

impl ArtifactFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFormat::Svg => "svg",
            ArtifactFormat::Png => "png",
            ArtifactFormat::Webp => "webp",
            ArtifactFormat::Jpeg => "jpeg",
        }
    }

    /// Guesses the format from content bytes.
    ///
    /// Used when promoting from a tier that stores raw bytes without
    /// metadata (the distributed tier). Defaults to SVG, the native
    /// template format, when no magic matches.
    pub fn sniff(content: &[u8]) -> Self {
        if content.starts_with(b"\x89PNG\r\n\x1a\n") {
            return ArtifactFormat::Png;
        }
        if content.starts_with(b"\xff\xd8\xff") {
            return ArtifactFormat::Jpeg;
        }
        if content.len() >= 12 && &content[0..4] == b"RIFF" && &content[8..12] == b"WEBP" {
            return ArtifactFormat::Webp;
        }
        ArtifactFormat::Svg
    }
}

/// What a renderer hands to the cache after producing content.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub content: Bytes,
    pub format: ArtifactFormat,
    /// Wall-clock render duration measured by the renderer.
    pub render_time_ms: f64,
}

impl RenderedArtifact {
    pub fn new(content: impl Into<Bytes>, format: ArtifactFormat, render_time_ms: f64) -> Self {
        Self {
            content: content.into(),
            format,
            render_time_ms,
        }
    }
}

/// A cached artifact as held by the memory tier.
///
/// Owned exclusively by the tier holding it; recency fields are mutated
/// on every hit and drive LRU eviction.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub content: Bytes,
    pub size_bytes: usize,
    pub format: ArtifactFormat,
    pub width: u32,
    pub height: u32,
    pub last_accessed: Instant,
    pub access_count: u64,
    pub render_time_ms: f64,
}

impl CacheEntry {
    pub fn new(
        content: Bytes,
        format: ArtifactFormat,
        width: u32,
        height: u32,
        render_time_ms: f64,
    ) -> Self {
        let size_bytes = content.len();
        Self {
            content,
            size_bytes,
            format,
            width,
            height,
            last_accessed: Instant::now(),
            access_count: 0,
            render_time_ms,
        }
    }

    /// Builds an entry from a renderer result.
    pub fn from_artifact(artifact: &RenderedArtifact, width: u32, height: u32) -> Self {
        Self::new(
            artifact.content.clone(),
            artifact.format,
            width,
            height,
            artifact.render_time_ms,
        )
    }

    /// Marks the entry as used: bumps the access count and refreshes the
    /// recency timestamp.
    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }
}

/// JSON metadata sidecar persisted next to each durable-tier blob.
///
/// Lets entries be inspected and expired without reading the content
/// file itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    pub template_path: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
    pub format: ArtifactFormat,
    pub render_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

impl EntryMetadata {
    pub fn new(template_path: &str, width: u32, height: u32, artifact: &RenderedArtifact) -> Self {
        Self {
            template_path: template_path.to_string(),
            width,
            height,
            size_bytes: artifact.content.len(),
            format: artifact.format,
            render_time_ms: artifact.render_time_ms,
            created_at: Utc::now(),
        }
    }
}
