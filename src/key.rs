//! Content-addressed cache key derivation.
//!
//! A [`CacheKey`] is the SHA-256 of a canonical serialization of
//! (template path, output dimensions, render options). Identical logical
//! inputs always produce the identical key, regardless of the order in
//! which option fields were supplied, so every tier can address content
//! by key alone.

use crate::error::CacheError;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Length of a key in lowercase hex characters (SHA-256).
pub const KEY_HEX_LEN: usize = 64;

/// File extension used for content blobs in the durable tier.
pub const CONTENT_EXTENSION: &str = "bin";

/// Suffix used for metadata sidecars in the durable tier.
pub const METADATA_SUFFIX: &str = "meta.json";

/// A content-addressed cache key.
///
/// Opaque fixed-length hash; `Display` prints the lowercase hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Returns the hex form of the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename of the content blob for this key (`<hex>.bin`).
    pub fn content_filename(&self) -> String {
        format!("{}.{}", self.0, CONTENT_EXTENSION)
    }

    /// Filename of the JSON metadata sidecar for this key
    /// (`<hex>.meta.json`).
    pub fn metadata_filename(&self) -> String {
        format!("{}.{}", self.0, METADATA_SUFFIX)
    }

    /// Parses a key back out of a content blob filename.
    ///
    /// Returns `None` for anything that is not `<64 lowercase hex>.bin`,
    /// which lets directory scans skip sidecars and stray files.
    pub fn from_content_filename(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", CONTENT_EXTENSION))?;
        if stem.len() != KEY_HEX_LEN {
            return None;
        }
        if !stem.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return None;
        }
        Some(CacheKey(stem.to_string()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A primitive render option value.
///
/// Options are restricted to primitives so they always have a canonical
/// serialization; anything nested is a caller error, not a cache fault.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

/// Render options as a canonical ordered mapping of string keys to
/// primitive values.
///
/// Backed by a `BTreeMap`, so serialization order is the lexical key
/// order no matter how the map was built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderOptions {
    values: BTreeMap<String, OptionValue>,
}

impl RenderOptions {
    /// Creates an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option, replacing any previous value for the key.
    /// Chainable for inline construction.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Builds options from a loosely-typed JSON object.
    ///
    /// This is the bridge for callers that carry options as a JSON bag.
    /// Nested objects, arrays, and nulls are rejected with
    /// [`CacheError::MalformedKeyInput`] since they have no canonical
    /// primitive form.
    pub fn from_json(value: &Value) -> Result<Self, CacheError> {
        let object = value.as_object().ok_or_else(|| {
            CacheError::MalformedKeyInput("render options must be a JSON object".to_string())
        })?;

        let mut options = RenderOptions::new();
        for (key, value) in object {
            let parsed = match value {
                Value::Bool(b) => OptionValue::Bool(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => OptionValue::Int(i),
                    // Large unsigned and fractional numbers both land here.
                    None => OptionValue::Float(n.as_f64().ok_or_else(|| {
                        CacheError::MalformedKeyInput(format!(
                            "unrepresentable number for option `{key}`"
                        ))
                    })?),
                },
                Value::String(s) => OptionValue::Text(s.clone()),
                Value::Null | Value::Array(_) | Value::Object(_) => {
                    return Err(CacheError::MalformedKeyInput(format!(
                        "non-primitive value for option `{key}`"
                    )));
                }
            };
            options.values.insert(key.clone(), parsed);
        }
        Ok(options)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Canonical JSON form with lexically sorted keys.
    ///
    /// JSON is used rather than ad-hoc concatenation so that string
    /// values containing separator characters cannot collide with other
    /// option layouts. Non-finite floats are rejected here: they have no
    /// JSON representation and would make the key non-deterministic.
    fn canonical(&self) -> Result<String, CacheError> {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.values {
            let json = match value {
                OptionValue::Bool(b) => Value::Bool(*b),
                OptionValue::Int(i) => Value::Number((*i).into()),
                OptionValue::Float(f) => {
                    let number = serde_json::Number::from_f64(*f).ok_or_else(|| {
                        CacheError::MalformedKeyInput(format!(
                            "non-finite float for option `{key}`"
                        ))
                    })?;
                    Value::Number(number)
                }
                OptionValue::Text(s) => Value::String(s.clone()),
            };
            map.insert(key.clone(), json);
        }
        // serde_json::Map is BTreeMap-backed, so this is already sorted.
        serde_json::to_string(&Value::Object(map))
            .map_err(|e| CacheError::MalformedKeyInput(format!("options not serializable: {e}")))
    }
}

/// Derives the content-addressed key for a render request.
///
/// Pure function: serializes the options canonically, concatenates with
/// the template path and dimensions, and hashes with SHA-256. Fails fast
/// with [`CacheError::MalformedKeyInput`] when the options cannot be
/// canonicalized.
pub fn derive_key(
    template_path: &str,
    width: u32,
    height: u32,
    options: &RenderOptions,
) -> Result<CacheKey, CacheError> {
    let canonical = options.canonical()?;
    let mut hasher = Sha256::new();
    hasher.update(template_path.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{width}x{height}").as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    Ok(CacheKey(format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_key_is_deterministic() {
        let options = RenderOptions::new().set("theme", "dark").set("scale", 2i64);
        let a = derive_key("charts/bar.svg", 1920, 1080, &options).unwrap();
        let b = derive_key("charts/bar.svg", 1920, 1080, &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_key_ignores_option_insertion_order() {
        let first = RenderOptions::new()
            .set("alpha", 1i64)
            .set("beta", true)
            .set("gamma", "x");
        let second = RenderOptions::new()
            .set("gamma", "x")
            .set("alpha", 1i64)
            .set("beta", true);
        let a = derive_key("t.svg", 640, 480, &first).unwrap();
        let b = derive_key("t.svg", 640, 480, &second).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_key_ignores_json_field_order() {
        let first = RenderOptions::from_json(&json!({"a": 1, "b": "two"})).unwrap();
        let second = RenderOptions::from_json(&json!({"b": "two", "a": 1})).unwrap();
        let a = derive_key("t.svg", 100, 100, &first).unwrap();
        let b = derive_key("t.svg", 100, 100, &second).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_key_varies_with_inputs() {
        let options = RenderOptions::new();
        let base = derive_key("t.svg", 100, 100, &options).unwrap();
        assert_ne!(base, derive_key("u.svg", 100, 100, &options).unwrap());
        assert_ne!(base, derive_key("t.svg", 200, 100, &options).unwrap());
        assert_ne!(base, derive_key("t.svg", 100, 200, &options).unwrap());
        assert_ne!(
            base,
            derive_key("t.svg", 100, 100, &RenderOptions::new().set("x", 1i64)).unwrap()
        );
    }

    #[test]
    fn test_derive_key_distinguishes_value_types() {
        let int = RenderOptions::new().set("v", 1i64);
        let text = RenderOptions::new().set("v", "1");
        let a = derive_key("t.svg", 100, 100, &int).unwrap();
        let b = derive_key("t.svg", 100, 100, &text).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_is_hex_of_expected_length() {
        let key = derive_key("t.svg", 1, 1, &RenderOptions::new()).unwrap();
        assert_eq!(key.as_str().len(), KEY_HEX_LEN);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_non_finite_float_is_malformed_input() {
        let options = RenderOptions::new().set("opacity", f64::NAN);
        let err = derive_key("t.svg", 100, 100, &options).unwrap_err();
        assert!(matches!(err, CacheError::MalformedKeyInput(_)));

        let options = RenderOptions::new().set("opacity", f64::INFINITY);
        assert!(derive_key("t.svg", 100, 100, &options).is_err());
    }

    #[test]
    fn test_from_json_rejects_nested_values() {
        assert!(RenderOptions::from_json(&json!({"style": {"color": "red"}})).is_err());
        assert!(RenderOptions::from_json(&json!({"items": [1, 2]})).is_err());
        assert!(RenderOptions::from_json(&json!({"missing": null})).is_err());
        assert!(RenderOptions::from_json(&json!("not an object")).is_err());
    }

    #[test]
    fn test_from_json_accepts_primitives() {
        let options =
            RenderOptions::from_json(&json!({"b": true, "i": 3, "f": 1.5, "s": "txt"})).unwrap();
        assert_eq!(options.len(), 4);
    }

    #[test]
    fn test_text_with_separator_characters_does_not_collide() {
        // A value embedding the canonical separators must not alias a
        // different option layout.
        let sneaky = RenderOptions::new().set("a", "1\",\"b\":\"2");
        let plain = RenderOptions::new().set("a", "1").set("b", "2");
        let a = derive_key("t.svg", 10, 10, &sneaky).unwrap();
        let b = derive_key("t.svg", 10, 10, &plain).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_filename_round_trip() {
        let key = derive_key("t.svg", 1920, 1080, &RenderOptions::new()).unwrap();
        let name = key.content_filename();
        assert!(name.ends_with(".bin"));
        let parsed = CacheKey::from_content_filename(&name).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_from_content_filename_rejects_strays() {
        assert!(CacheKey::from_content_filename("short.bin").is_none());
        assert!(CacheKey::from_content_filename(&"a".repeat(64)).is_none());
        let key = derive_key("t.svg", 1, 1, &RenderOptions::new()).unwrap();
        // Sidecars must not parse as content blobs.
        assert!(CacheKey::from_content_filename(&key.metadata_filename()).is_none());
        let uppercase = format!("{}.bin", key.as_str().to_uppercase());
        assert!(CacheKey::from_content_filename(&uppercase).is_none());
    }
}
