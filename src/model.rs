//! Document model.
//!
//! Stored objects are dynamic JSON maps; only the `__rerum` sub-map has a
//! fixed shape, captured here as typed structs. Everything outside that block
//! is treated as an opaque `serde_json::Value`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::Config;

/// Fixed `APIversion` carried by every `__rerum` block.
pub const API_VERSION: &str = "1.0.0";

/// Keys clients may never set or merge over.
pub const PROTECTED_KEYS: &[&str] = &["@id", "_id", "__rerum", "__deleted"];

/// Sentinel `history.prime` value for an origin node.
pub const PRIME_ROOT: &str = "root";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub prime: String,
    #[serde(default)]
    pub previous: String,
    #[serde(default)]
    pub next: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Releases {
    #[serde(default)]
    pub previous: String,
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub replaces: String,
}

/// The version-tracking bookkeeping block attached to every stored document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerumMeta {
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub releases: Releases,
    #[serde(rename = "generatedBy", default)]
    pub generated_by: String,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    #[serde(rename = "isReleased", default)]
    pub is_released: String,
    #[serde(rename = "isOverwritten", default)]
    pub is_overwritten: String,
    #[serde(rename = "APIversion", default)]
    pub api_version: String,
    #[serde(rename = "@context", default)]
    pub context: String,
    #[serde(default)]
    pub alpha: bool,
}

impl RerumMeta {
    /// Bookkeeping for a brand new origin node.
    pub fn new_root(agent: &str, config: &Config) -> Self {
        Self {
            history: History {
                prime: PRIME_ROOT.to_string(),
                previous: String::new(),
                next: Vec::new(),
            },
            releases: Releases::default(),
            generated_by: agent.to_string(),
            created_at: iso_now(),
            is_released: String::new(),
            is_overwritten: String::new(),
            api_version: API_VERSION.to_string(),
            context: config.context_url(),
            alpha: true,
        }
    }
}

/// ISO-8601 instant without a trailing zone marker, millisecond precision.
pub fn iso_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Mints a fresh opaque id suffix.
pub fn mint_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The suffix after the last `/` of an `@id`, or the input unchanged when it
/// carries no slash (already a bare `_id`).
pub fn short_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Reads the `@id` of a document, if present.
pub fn at_id(doc: &Value) -> Option<&str> {
    doc.get("@id").and_then(Value::as_str)
}

/// Parses the `__rerum` block of a document. `None` for documents without
/// one (deleted shells, foreign imports mid-flight).
pub fn meta_of(doc: &Value) -> Option<RerumMeta> {
    let raw = doc.get("__rerum")?;
    serde_json::from_value(raw.clone()).ok()
}

/// Writes a `__rerum` block onto a document map.
pub fn set_meta(doc: &mut Map<String, Value>, meta: &RerumMeta) {
    if let Ok(value) = serde_json::to_value(meta) {
        doc.insert("__rerum".to_string(), value);
    }
}

/// Whether the document is a `__deleted` shell.
pub fn is_deleted(doc: &Value) -> bool {
    doc.get("__deleted").is_some()
}

/// Whether the document has been marked released (immutable).
pub fn is_released(doc: &Value) -> bool {
    meta_of(doc).is_some_and(|m| !m.is_released.is_empty())
}

/// Builds the `__deleted` shell that replaces a deleted document.
pub fn deleted_shell(snapshot: &Value, agent: &str) -> Value {
    let id = at_id(snapshot).unwrap_or_default();
    serde_json::json!({
        "@id": id,
        "_id": short_id(id),
        "__deleted": {
            "object": snapshot,
            "deletor": agent,
            "time": iso_now(),
        }
    })
}

/// Strips client-supplied protected keys from an incoming body.
pub fn strip_protected(body: &Value) -> Map<String, Value> {
    match body.as_object() {
        Some(map) => map
            .iter()
            .filter(|(k, _)| !PROTECTED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_strips_prefix() {
        assert_eq!(short_id("http://localhost:3005/v1/id/abc123"), "abc123");
        assert_eq!(short_id("abc123"), "abc123");
    }

    #[test]
    fn test_new_root_meta() {
        let config = Config::for_tests();
        let meta = RerumMeta::new_root("http://example.org/agent/1", &config);
        assert_eq!(meta.history.prime, PRIME_ROOT);
        assert_eq!(meta.history.previous, "");
        assert!(meta.history.next.is_empty());
        assert_eq!(meta.generated_by, "http://example.org/agent/1");
        assert_eq!(meta.api_version, API_VERSION);
        assert!(meta.is_released.is_empty());
    }

    #[test]
    fn test_created_at_has_no_zone_marker() {
        let stamp = iso_now();
        assert!(!stamp.ends_with('Z'));
        assert!(!stamp.contains('+'));
        assert!(stamp.contains('T'));
    }

    #[test]
    fn test_meta_round_trip() {
        let config = Config::for_tests();
        let meta = RerumMeta::new_root("agent", &config);
        let mut doc = Map::new();
        set_meta(&mut doc, &meta);
        let parsed = meta_of(&Value::Object(doc)).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_strip_protected_removes_rerum_block() {
        let body = serde_json::json!({
            "@id": "x", "_id": "y", "__rerum": {}, "type": "T"
        });
        let stripped = strip_protected(&body);
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("type"));
    }

    #[test]
    fn test_deleted_shell_keeps_last_state() {
        let snapshot = serde_json::json!({
            "@id": "http://localhost:3005/v1/id/abc", "type": "T"
        });
        let shell = deleted_shell(&snapshot, "agent");
        assert_eq!(at_id(&shell), Some("http://localhost:3005/v1/id/abc"));
        assert!(is_deleted(&shell));
        assert_eq!(shell["__deleted"]["object"]["type"], "T");
        assert_eq!(shell["__deleted"]["deletor"], "agent");
    }
}
