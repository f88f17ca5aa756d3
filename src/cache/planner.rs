//! Maps a mutation's effect to the set of cache keys every worker must drop.
//!
//! Fingerprints are deterministic digests, so the chain-related drops
//! (`id`/`history`/`since` of the object, its ancestor, and its prime) are
//! enumerated as exact keys. The open-ended drops (queries and searches that
//! might match the object) use namespace patterns and the recorded-field
//! overlap rule. Invalidating more than strictly necessary is always safe;
//! planning is deterministic and monotonic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::cache::store::CacheStore;
use crate::fingerprint::{self, Namespace};
use crate::model::{self, PRIME_ROOT, PROTECTED_KEYS};

/// Pattern covering every cacheable namespace.
const ALL_NAMESPACES: &str =
    "^(query|search|searchPhrase|id|history|since|gog-fragments|gog-glosses):";

/// Pattern covering the namespaces that any object mutation can affect in an
/// open-ended way (full-text matching cannot be routed by field names).
const TEXTUAL_NAMESPACES: &str = "^(search|searchPhrase|gog-fragments|gog-glosses):";

/// A batch of cache drops, applied atomically by each receiving worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationPlan {
    /// Exact fingerprints to drop.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Regex patterns over fingerprints to drop.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Field names routing the `query:*` overlap rule.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Drop everything, ignoring the rest of the plan.
    #[serde(default)]
    pub clear: bool,
}

impl InvalidationPlan {
    pub fn is_empty(&self) -> bool {
        !self.clear && self.keys.is_empty() && self.patterns.is_empty() && self.fields.is_empty()
    }

    /// Full-store clear, used by `/api/cache/clear`.
    pub fn clear_all() -> Self {
        Self {
            clear: true,
            ..Self::default()
        }
    }

    /// Conservative full-namespace drop: used for `release` and for any
    /// mutation whose effect body carries no id.
    pub fn full() -> Self {
        Self {
            patterns: vec![ALL_NAMESPACES.to_string()],
            ..Self::default()
        }
    }

    /// An empty plan used as a sync barrier (`waitForSync`).
    pub fn noop() -> Self {
        Self::default()
    }

    /// Plan for freshly created objects: the by-object rule for each.
    pub fn for_created<'a, I>(objects: I) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut plan = Self::default();
        for object in objects {
            plan.add_object(object);
        }
        plan.dedup();
        plan
    }

    /// Plan for an update-shaped mutation (update, patch, set, unset,
    /// overwrite, bulkUpdate items, delete on its pre-delete snapshot). The
    /// effect is the response object; falls back to the full drop when it
    /// carries no id.
    pub fn for_mutation(effect: &Value) -> Self {
        let Some(id) = model::at_id(effect) else {
            return Self::full();
        };
        let mut plan = Self::default();
        let mut chain: BTreeSet<String> = BTreeSet::new();
        chain.insert(model::short_id(id).to_string());

        if let Some(meta) = model::meta_of(effect) {
            let previous = meta.history.previous.as_str();
            if !previous.is_empty() && previous != PRIME_ROOT {
                chain.insert(model::short_id(previous).to_string());
            }
            let prime = meta.history.prime.as_str();
            if !prime.is_empty() && prime != PRIME_ROOT {
                chain.insert(model::short_id(prime).to_string());
            }
        }

        for short in &chain {
            plan.keys.push(fingerprint::for_id(Namespace::Id, short));
            plan.keys.push(fingerprint::for_id(Namespace::History, short));
            plan.keys.push(fingerprint::for_id(Namespace::Since, short));
        }
        plan.add_object(effect);
        plan.dedup();
        plan
    }

    /// By-object rule: any query touching one of the object's top-level
    /// fields may now be stale, as may any full-text result.
    fn add_object(&mut self, object: &Value) {
        self.patterns.push(TEXTUAL_NAMESPACES.to_string());
        if let Some(map) = object.as_object() {
            for key in map.keys() {
                if !PROTECTED_KEYS.contains(&key.as_str()) {
                    self.fields.push(key.clone());
                }
            }
        }
    }

    /// Union with another plan (bulk operations).
    pub fn merge(&mut self, other: Self) {
        self.clear |= other.clear;
        self.keys.extend(other.keys);
        self.patterns.extend(other.patterns);
        self.fields.extend(other.fields);
        self.dedup();
    }

    fn dedup(&mut self) {
        self.keys.sort();
        self.keys.dedup();
        self.patterns.sort();
        self.patterns.dedup();
        self.fields.sort();
        self.fields.dedup();
    }

    /// Applies the whole batch to one worker's store. Bad patterns degrade
    /// to no-ops against the store's error counter, never a fault.
    pub fn apply(&self, cache: &CacheStore) {
        if self.clear {
            cache.clear();
            return;
        }
        for key in &self.keys {
            cache.delete(key);
        }
        for pattern in &self.patterns {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    cache.invalidate(&re);
                }
                Err(_) => cache.record_error(),
            }
        }
        if !self.fields.is_empty() {
            cache.invalidate_fields(&self.fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn versioned_effect() -> Value {
        json!({
            "@id": "http://localhost:3005/v1/id/ccc",
            "type": "Annotation",
            "target": "http://example.org/target",
            "__rerum": {
                "history": {
                    "prime": "http://localhost:3005/v1/id/aaa",
                    "previous": "http://localhost:3005/v1/id/bbb",
                    "next": []
                }
            }
        })
    }

    #[test]
    fn test_mutation_plan_covers_chain() {
        let plan = InvalidationPlan::for_mutation(&versioned_effect());
        for short in ["aaa", "bbb", "ccc"] {
            for ns in [Namespace::Id, Namespace::History, Namespace::Since] {
                let key = fingerprint::for_id(ns, short);
                assert!(plan.keys.contains(&key), "missing {key}");
            }
        }
        assert!(plan.fields.contains(&"type".to_string()));
        assert!(plan.fields.contains(&"target".to_string()));
        assert!(!plan.fields.contains(&"__rerum".to_string()));
    }

    #[test]
    fn test_root_mutation_plans_single_chain_entry() {
        let effect = json!({
            "@id": "http://localhost:3005/v1/id/aaa",
            "type": "T",
            "__rerum": {"history": {"prime": "root", "previous": "", "next": []}}
        });
        let plan = InvalidationPlan::for_mutation(&effect);
        let id_keys: Vec<_> = plan.keys.iter().filter(|k| k.starts_with("id:")).collect();
        assert_eq!(id_keys.len(), 1);
    }

    #[test]
    fn test_idless_effect_falls_back_to_full() {
        let plan = InvalidationPlan::for_mutation(&json!({"type": "T"}));
        assert_eq!(plan, InvalidationPlan::full());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = InvalidationPlan::for_mutation(&versioned_effect());
        let b = InvalidationPlan::for_mutation(&versioned_effect());
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_unions_and_dedups() {
        let mut a = InvalidationPlan::for_mutation(&versioned_effect());
        let before = a.keys.len();
        a.merge(InvalidationPlan::for_mutation(&versioned_effect()));
        assert_eq!(a.keys.len(), before);
    }

    #[test]
    fn test_apply_full_drops_every_namespace() {
        let cache = CacheStore::new(100, 1 << 20, Duration::from_secs(60));
        for key in ["query:a", "search:b", "searchPhrase:c", "id:d", "history:e",
                    "since:f", "gog-fragments:g", "gog-glosses:h"] {
            cache.set(key, b"x".to_vec(), None);
        }
        InvalidationPlan::full().apply(&cache);
        assert_eq!(cache.stats().length, 0);
    }

    #[test]
    fn test_apply_clear() {
        let cache = CacheStore::new(100, 1 << 20, Duration::from_secs(60));
        cache.set("id:a", b"x".to_vec(), None);
        InvalidationPlan::clear_all().apply(&cache);
        assert_eq!(cache.stats().length, 0);
    }

    #[test]
    fn test_apply_mutation_spares_unrelated_queries() {
        let cache = CacheStore::new(100, 1 << 20, Duration::from_secs(60));
        let unrelated: BTreeSet<String> = ["motivation".to_string()].into_iter().collect();
        cache.set("query:unrelated", b"x".to_vec(), Some(unrelated));
        let overlapping: BTreeSet<String> = ["type".to_string()].into_iter().collect();
        cache.set("query:overlapping", b"x".to_vec(), Some(overlapping));
        cache.set("search:any", b"x".to_vec(), None);

        InvalidationPlan::for_mutation(&versioned_effect()).apply(&cache);
        assert!(cache.get("query:unrelated").is_some());
        assert!(cache.get("query:overlapping").is_none());
        assert!(cache.get("search:any").is_none());
    }
}
