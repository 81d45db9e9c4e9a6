//! Template source optimizer.
//!
//! Shrinks SVG-style template source through three passes: structural
//! stripping (comments, inter-tag whitespace), attribute normalization
//! (bounded numeric precision, pruning of attributes that do not affect
//! rendering), and a lossy re-encode of embedded base64 raster payloads.
//!
//! Optimization is best-effort. Any pipeline failure returns the
//! original bytes unchanged with a zero compression ratio; the serving
//! path never depends on this module succeeding.

use crate::config::OptimizerConfig;
use crate::error::OptimizeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Cursor;
use tracing::{debug, warn};

/// Attribute prefixes pruned during normalization: editor metadata and
/// data annotations that renderers ignore.
const PRUNED_ATTRIBUTE_PREFIXES: &[&str] = &["data-", "inkscape:", "sodipodi:"];

/// Exact attribute names pruned during normalization.
const PRUNED_ATTRIBUTES: &[&str] = &["xml:space", "xmlns:inkscape", "xmlns:sodipodi"];

/// Advice emitted alongside an optimization result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Compression gained little; the graphic itself is the weight.
    SimplifyGraphic,
    /// Still large after optimization; split into smaller components.
    SplitComponents,
    /// Embedded binary payloads found; store them as external assets.
    ExternalizeImages,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::SimplifyGraphic => "simplify_graphic",
            Recommendation::SplitComponents => "split_components",
            Recommendation::ExternalizeImages => "externalize_images",
        }
    }
}

/// Outcome of one `optimize()` call. Ephemeral: logged and reported,
/// never cached.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub original_size: usize,
    pub optimized_size: usize,
    /// Percent of the original shaved off; 0 when optimization failed
    /// or achieved nothing.
    pub compression_ratio: f64,
    pub recommendations: Vec<Recommendation>,
}

struct PipelineOutcome {
    content: String,
    has_payload: bool,
}

/// The optimization pipeline with its configured thresholds.
pub struct TemplateOptimizer {
    config: OptimizerConfig,
}

impl TemplateOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Optimizes template source, returning the (possibly unchanged)
    /// content and a result describing the savings.
    ///
    /// Never fails: a pipeline error is logged and the original bytes
    /// come back with `compression_ratio = 0`.
    pub fn optimize(&self, template_path: &str, raw: &[u8]) -> (Bytes, OptimizationResult) {
        let original_size = raw.len();
        match self.run_pipeline(raw) {
            Ok(outcome) => {
                let optimized_size = outcome.content.len();
                let compression_ratio = if original_size == 0 {
                    0.0
                } else {
                    (original_size as f64 - optimized_size as f64) / original_size as f64 * 100.0
                };

                let mut recommendations = Vec::new();
                if compression_ratio < self.config.min_compression_ratio {
                    recommendations.push(Recommendation::SimplifyGraphic);
                }
                if optimized_size > self.config.size_threshold_bytes {
                    recommendations.push(Recommendation::SplitComponents);
                }
                if outcome.has_payload {
                    recommendations.push(Recommendation::ExternalizeImages);
                }

                debug!(
                    template = template_path,
                    original_size = original_size,
                    optimized_size = optimized_size,
                    ratio = format!("{compression_ratio:.1}"),
                    "Template optimized"
                );
                (
                    Bytes::from(outcome.content.into_bytes()),
                    OptimizationResult {
                        original_size,
                        optimized_size,
                        compression_ratio,
                        recommendations,
                    },
                )
            }
            Err(e) => {
                warn!(
                    template = template_path,
                    error = %e,
                    "Optimization failed, returning original content"
                );
                (
                    Bytes::copy_from_slice(raw),
                    OptimizationResult {
                        original_size,
                        optimized_size: original_size,
                        compression_ratio: 0.0,
                        recommendations: Vec::new(),
                    },
                )
            }
        }
    }

    fn run_pipeline(&self, raw: &[u8]) -> Result<PipelineOutcome, OptimizeError> {
        let text = std::str::from_utf8(raw).map_err(|_| OptimizeError::NotText)?;
        let stripped = strip_comments(text);
        let collapsed = collapse_intertag_whitespace(&stripped);
        let referenced = collect_referenced_ids(&collapsed);
        let normalized = self.rewrite_tags(&collapsed, &referenced);
        let (content, has_payload) = self.recompress_payloads(&normalized)?;
        Ok(PipelineOutcome {
            content,
            has_payload,
        })
    }

    /// Rewrites every tag: prunes dead attributes and normalizes
    /// numeric precision. Declarations (`<?..?>`, `<!..>`) and CDATA
    /// sections pass through untouched.
    fn rewrite_tags(&self, text: &str, referenced_ids: &HashSet<String>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('<') {
            out.push_str(&rest[..=open]);
            let tail = &rest[open + 1..];

            if let Some(cdata) = tail.strip_prefix("![CDATA[") {
                match cdata.find("]]>") {
                    Some(end) => {
                        let span = "![CDATA[".len() + end + 3;
                        out.push_str(&tail[..span]);
                        rest = &tail[span..];
                        continue;
                    }
                    None => {
                        out.push_str(tail);
                        return out;
                    }
                }
            }

            match find_tag_end(tail) {
                Some(close) => {
                    let body = &tail[..close];
                    if body.starts_with('!') || body.starts_with('?') {
                        out.push_str(body);
                    } else {
                        out.push_str(&self.rewrite_tag_body(body, referenced_ids));
                    }
                    out.push('>');
                    rest = &tail[close + 1..];
                }
                None => {
                    // Unterminated tag: keep the remainder as-is.
                    out.push_str(tail);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn rewrite_tag_body(&self, body: &str, referenced_ids: &HashSet<String>) -> String {
        let trimmed = body.trim_end();
        let self_closing = trimmed.ends_with('/');
        let core = trimmed.trim_end_matches('/').trim_end();

        let name_end = core.find(char::is_whitespace).unwrap_or(core.len());
        let mut out = String::from(&core[..name_end]);
        let mut rest = core[name_end..].trim_start();

        while !rest.is_empty() {
            match parse_attribute(rest) {
                Some((name, value, remainder)) => {
                    if !self.should_drop_attribute(name, value.map(|(_, v)| v), referenced_ids) {
                        out.push(' ');
                        out.push_str(name);
                        if let Some((quote, value)) = value {
                            out.push('=');
                            out.push(quote);
                            out.push_str(&self.normalize_numbers(value));
                            out.push(quote);
                        }
                    }
                    rest = remainder.trim_start();
                }
                None => {
                    // Unparseable tail (e.g. unterminated quote): keep verbatim.
                    out.push(' ');
                    out.push_str(rest);
                    break;
                }
            }
        }
        if self_closing {
            out.push('/');
        }
        out
    }

    fn should_drop_attribute(
        &self,
        name: &str,
        value: Option<&str>,
        referenced_ids: &HashSet<String>,
    ) -> bool {
        if PRUNED_ATTRIBUTES.contains(&name) {
            return true;
        }
        if PRUNED_ATTRIBUTE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            return true;
        }
        if name == "id" {
            if let Some(id) = value {
                return !referenced_ids.contains(id);
            }
        }
        false
    }

    /// Rounds fractional numeric tokens to the configured precision.
    ///
    /// Only tokens containing a decimal point are rewritten, and only
    /// when the rewrite does not grow them, so the pass is idempotent
    /// and never touches integers, hex colors, or base64 payloads.
    fn normalize_numbers(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut token = String::new();
        for ch in value.chars() {
            if ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+' | 'e' | 'E') {
                token.push(ch);
            } else {
                self.flush_number(&mut out, &token);
                token.clear();
                out.push(ch);
            }
        }
        self.flush_number(&mut out, &token);
        out
    }

    fn flush_number(&self, out: &mut String, token: &str) {
        if token.is_empty() {
            return;
        }
        if !token.contains('.') {
            out.push_str(token);
            return;
        }
        match token.parse::<f64>() {
            Ok(v) if v.is_finite() => {
                let formatted = format_precision(v, self.config.max_precision);
                if formatted.len() <= token.len() {
                    out.push_str(&formatted);
                } else {
                    out.push_str(token);
                }
            }
            _ => out.push_str(token),
        }
    }

    /// Re-encodes embedded base64 raster payloads as JPEG at the
    /// configured quality, keeping the original payload when the
    /// re-encode is not smaller. Returns whether any payload was seen.
    fn recompress_payloads(&self, text: &str) -> Result<(String, bool), OptimizeError> {
        const MARKER: &str = "data:image/";
        const B64_TAG: &str = ";base64,";

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut found = false;

        while let Some(pos) = rest.find(MARKER) {
            found = true;
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            // The URI ends at the first quote, whitespace, `)` or `<`
            // after the marker; the base64 tag must sit inside that
            // span or this URI carries no base64 section.
            let uri_end = tail
                .find(|c: char| matches!(c, '"' | '\'' | ')' | '<') || c.is_whitespace())
                .unwrap_or(tail.len());
            let Some(tag_at) = tail[..uri_end].find(B64_TAG) else {
                // URI-encoded payload: pass through untouched.
                out.push_str(&tail[..uri_end]);
                rest = &tail[uri_end..];
                continue;
            };
            let header = &tail[..tag_at + B64_TAG.len()];
            let payload = &tail[tag_at + B64_TAG.len()..uri_end];

            match self.reencode_payload(payload)? {
                Some(jpeg_b64) => {
                    out.push_str("data:image/jpeg;base64,");
                    out.push_str(&jpeg_b64);
                }
                None => {
                    out.push_str(header);
                    out.push_str(payload);
                }
            }
            rest = &tail[uri_end..];
        }
        out.push_str(rest);
        Ok((out, found))
    }

    /// Decodes one payload and re-encodes it lossily. `None` means the
    /// re-encode did not shrink it and the original should stay.
    fn reencode_payload(&self, payload_b64: &str) -> Result<Option<String>, OptimizeError> {
        let data = BASE64
            .decode(payload_b64)
            .map_err(|e| OptimizeError::Payload(format!("base64 decode: {e}")))?;
        let img = image::load_from_memory(&data)
            .map_err(|e| OptimizeError::Payload(format!("image decode: {e}")))?;

        let mut encoded = Vec::new();
        let encoder = JpegEncoder::new_with_quality(
            Cursor::new(&mut encoded),
            self.config.payload_quality,
        );
        // JPEG carries no alpha channel.
        image::DynamicImage::ImageRgb8(img.to_rgb8())
            .write_with_encoder(encoder)
            .map_err(|e| OptimizeError::Payload(format!("jpeg encode: {e}")))?;

        if encoded.len() < data.len() {
            Ok(Some(BASE64.encode(&encoded)))
        } else {
            Ok(None)
        }
    }
}

/// Removes `<!-- -->` comments. An unterminated comment swallows the
/// rest of the document, matching how renderers treat it.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Drops whitespace runs between a tag close and the next tag open,
/// plus leading/trailing document whitespace. Whitespace inside text
/// content and inside tags is preserved; a `>` inside a quoted
/// attribute value is not mistaken for a tag boundary.
fn collapse_intertag_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending = String::new();
    let mut in_tag = false;
    let mut quote: Option<char> = None;
    let mut after_close = true;

    for ch in text.chars() {
        if !in_tag && ch.is_whitespace() {
            pending.push(ch);
            continue;
        }
        let starts_tag = !in_tag && ch == '<';
        if !pending.is_empty() {
            if !(after_close && starts_tag) {
                out.push_str(&pending);
            }
            pending.clear();
        }
        out.push(ch);

        if in_tag {
            match quote {
                Some(q) if ch == q => quote = None,
                None if ch == '"' || ch == '\'' => quote = Some(ch),
                None if ch == '>' => {
                    in_tag = false;
                    after_close = true;
                }
                _ => {}
            }
        } else if starts_tag {
            in_tag = true;
            after_close = false;
        } else {
            after_close = false;
        }
    }
    if !pending.is_empty() && !after_close {
        out.push_str(&pending);
    }
    out
}

/// Finds the `>` ending a tag, skipping quoted attribute values.
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, ch) in s.char_indices() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                '>' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

/// Parses one `name`, `name="value"`, or `name=bare` attribute.
/// Returns the name, the optional (quote, value) pair, and the
/// remainder. `None` means the input is malformed.
fn parse_attribute(rest: &str) -> Option<(&str, Option<(char, &str)>, &str)> {
    let name_end = rest
        .char_indices()
        .find(|(_, ch)| *ch == '=' || ch.is_whitespace())
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    let name = &rest[..name_end];
    if name.is_empty() {
        return None;
    }

    let after_name = rest[name_end..].trim_start();
    let Some(after_eq) = after_name.strip_prefix('=') else {
        return Some((name, None, after_name));
    };
    let after_eq = after_eq.trim_start();
    let quote = after_eq.chars().next()?;
    if quote != '"' && quote != '\'' {
        // Unquoted value: runs to the next whitespace.
        let end = after_eq
            .find(char::is_whitespace)
            .unwrap_or(after_eq.len());
        return Some((name, Some(('"', &after_eq[..end])), &after_eq[end..]));
    }
    let value_and_rest = &after_eq[1..];
    let end = value_and_rest.find(quote)?;
    Some((
        name,
        Some((quote, &value_and_rest[..end])),
        &value_and_rest[end + 1..],
    ))
}

/// Collects ids referenced via `url(#id)` or `href="#id"` so that only
/// unreferenced `id` attributes are pruned.
fn collect_referenced_ids(text: &str) -> HashSet<String> {
    let mut ids = HashSet::new();

    let mut rest = text;
    while let Some(pos) = rest.find("url(#") {
        let tail = &rest[pos + 5..];
        match tail.find(')') {
            Some(end) => {
                ids.insert(tail[..end].trim_matches(|c| c == '"' || c == '\'').to_string());
                rest = &tail[end..];
            }
            None => break,
        }
    }

    let mut rest = text;
    while let Some(pos) = rest.find("href=") {
        let tail = &rest[pos + 5..];
        let mut chars = tail.chars();
        match chars.next() {
            Some(q @ ('"' | '\'')) => {
                let value = &tail[1..];
                if let Some(end) = value.find(q) {
                    if let Some(id) = value[..end].strip_prefix('#') {
                        ids.insert(id.to_string());
                    }
                    rest = &value[end..];
                    continue;
                }
            }
            _ => {}
        }
        rest = tail;
    }
    ids
}

/// Formats at fixed precision, trimming trailing zeros and a dangling
/// point; `-0` collapses to `0`.
fn format_precision(v: f64, decimals: u32) -> String {
    let fixed = format!("{:.*}", decimals as usize, v);
    let trimmed = if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.')
    } else {
        fixed.as_str()
    };
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
