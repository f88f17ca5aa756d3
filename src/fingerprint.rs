//! Cache key derivation.
//!
//! A fingerprint is `<namespace>:<hash>` where the hash is a SHA-256 digest
//! (hex, truncated) over a canonical encoding of the request shape. The
//! canonical form sorts map keys recursively, so two workers given the same
//! logical request always derive the same key regardless of the insertion
//! order of the incoming JSON.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest. Collisions at this width are
/// not a correctness concern: a collision only causes an extra invalidation.
const HASH_WIDTH: usize = 32;

pub const DEFAULT_LIMIT: i64 = 100;
pub const DEFAULT_SKIP: u64 = 0;
pub const DEFAULT_SLOP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Query,
    Search,
    SearchPhrase,
    Id,
    History,
    Since,
    GogFragments,
    GogGlosses,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Search => "search",
            Self::SearchPhrase => "searchPhrase",
            Self::Id => "id",
            Self::History => "history",
            Self::Since => "since",
            Self::GogFragments => "gog-fragments",
            Self::GogGlosses => "gog-glosses",
        }
    }
}

/// Writes the canonical encoding of `value` into `out`: compact JSON with
/// object keys sorted recursively. Independent of any map-ordering feature
/// of the JSON library.
pub fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&escape_string(key));
                out.push(':');
                canonical_json(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(&escape_string(s)),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn escape_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn digest(canonical: &str) -> String {
    let mut hex = hex::encode(Sha256::digest(canonical.as_bytes()));
    hex.truncate(HASH_WIDTH);
    hex
}

/// Fingerprint for a body-driven read (`query`, `search`, `searchPhrase`,
/// `gog-*`): canonical form of `{body, limit, skip, options?}`.
pub fn for_body(
    ns: Namespace,
    body: &Value,
    limit: i64,
    skip: u64,
    options: Option<&Value>,
) -> String {
    let mut shape = serde_json::Map::new();
    shape.insert("body".to_string(), body.clone());
    shape.insert("limit".to_string(), Value::from(limit));
    shape.insert("skip".to_string(), Value::from(skip));
    if let Some(options) = options {
        shape.insert("options".to_string(), options.clone());
    }
    let mut canonical = String::new();
    canonical_json(&Value::Object(shape), &mut canonical);
    format!("{}:{}", ns.as_str(), digest(&canonical))
}

/// Fingerprint for an id-driven read (`id`, `history`, `since`): the bare
/// `_id` suffix is the canonical form.
pub fn for_id(ns: Namespace, id: &str) -> String {
    format!("{}:{}", ns.as_str(), digest(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_insensitive() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(
            for_body(Namespace::Query, &a, 100, 0, None),
            for_body(Namespace::Query, &b, 100, 0, None)
        );
    }

    #[test]
    fn test_nested_key_order_insensitive() {
        let a = json!({"outer": {"x": [1, {"p": true, "q": null}], "y": "s"}});
        let b = json!({"outer": {"y": "s", "x": [1, {"q": null, "p": true}]}});
        assert_eq!(
            for_body(Namespace::Query, &a, 100, 0, None),
            for_body(Namespace::Query, &b, 100, 0, None)
        );
    }

    #[test]
    fn test_case_sensitive() {
        let a = json!({"type": "T"});
        let b = json!({"type": "t"});
        assert_ne!(
            for_body(Namespace::Query, &a, 100, 0, None),
            for_body(Namespace::Query, &b, 100, 0, None)
        );
    }

    #[test]
    fn test_pagination_changes_fingerprint() {
        let body = json!({"type": "T"});
        let base = for_body(Namespace::Query, &body, 100, 0, None);
        assert_ne!(base, for_body(Namespace::Query, &body, 50, 0, None));
        assert_ne!(base, for_body(Namespace::Query, &body, 100, 10, None));
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let body = json!({"text": "hello"});
        assert_ne!(
            for_body(Namespace::Search, &body, 100, 0, None),
            for_body(Namespace::SearchPhrase, &body, 100, 0, None)
        );
        assert_ne!(
            for_id(Namespace::History, "abc"),
            for_id(Namespace::Since, "abc")
        );
    }

    #[test]
    fn test_id_fingerprint_shape() {
        let fp = for_id(Namespace::Id, "abc123");
        assert!(fp.starts_with("id:"));
        assert_eq!(fp.len(), "id:".len() + HASH_WIDTH);
    }

    #[test]
    fn test_canonical_escapes_strings() {
        let mut out = String::new();
        canonical_json(&json!({"k": "line\nbreak \"quoted\""}), &mut out);
        assert_eq!(out, r#"{"k":"line\nbreak \"quoted\""}"#);
    }
}
