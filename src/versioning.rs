//! Versioning engine.
//!
//! Produces the `__rerum`-configured document for every mutation, enforces
//! the authorization ladder, and owns the chain bookkeeping: prime
//! promotion, the ancestor `history.next` append (the only permitted
//! mutation of a non-released ancestor), release-tree updates, and chain
//! healing on delete.

use anyhow::Result;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::RestError;
use crate::model::{self, RerumMeta, PRIME_ROOT};
use crate::store::{DocumentStore, UpdateSpec};

/// A configured new version plus the targeted ancestor modification that
/// must land with it.
#[derive(Debug)]
pub struct NewVersion {
    pub doc: Value,
    /// `(short id, spec)` appending the new `@id` to the ancestor's
    /// `history.next`.
    pub ancestor: Option<(String, UpdateSpec)>,
}

/// Whether this agent is the configured bot, exempt from generator-match
/// and expired-token checks.
pub fn is_bot(agent: &str, config: &Config) -> bool {
    !config.bot_agent.is_empty() && agent == config.bot_agent
}

/// The authorization ladder run before any store mutation: deleted targets
/// are 404, wrong agents are 401 (bot exempt), released targets are 403.
pub fn authorize_mutation(
    original: &Value,
    agent: &str,
    auth_header: Option<&str>,
    config: &Config,
) -> Result<(), RestError> {
    if model::is_deleted(original) {
        return Err(RestError::NotFound(
            "The object you are trying to update is deleted.".to_string(),
        ));
    }
    let generator = model::meta_of(original)
        .map(|m| m.generated_by)
        .unwrap_or_default();
    if generator != agent && !is_bot(agent, config) {
        return Err(RestError::unauthenticated_for(
            "The agent of your token did not generate this object.",
            auth_header,
            config,
        ));
    }
    if model::is_released(original) {
        return Err(RestError::forbidden_for(
            "The object you are trying to update is released. Fork the release to make changes.",
            auth_header,
            config,
        ));
    }
    Ok(())
}

fn finish_document(mut content: Map<String, Value>, meta: &RerumMeta, config: &Config) -> Value {
    let id = model::mint_id();
    content.insert(
        "@id".to_string(),
        Value::String(format!("{}{id}", config.id_prefix)),
    );
    content.insert("_id".to_string(), Value::String(id));
    model::set_meta(&mut content, meta);
    Value::Object(content)
}

/// Fresh create: a new origin node.
pub fn configure_root(content: Map<String, Value>, agent: &str, config: &Config) -> Value {
    finish_document(content, &RerumMeta::new_root(agent, config), config)
}

/// External import: a foreign `@id` wrapped as a new root. The foreign id
/// is recorded in `history.previous` for provenance only; it never resolves
/// to a stored document.
pub fn configure_import(
    content: Map<String, Value>,
    foreign_id: &str,
    agent: &str,
    config: &Config,
) -> Value {
    let mut meta = RerumMeta::new_root(agent, config);
    meta.history.previous = foreign_id.to_string();
    finish_document(content, &meta, config)
}

/// Update: a new sibling appended to the chain of `original`.
pub fn configure_descendant(
    original: &Value,
    content: Map<String, Value>,
    agent: &str,
    config: &Config,
) -> NewVersion {
    let original_id = model::at_id(original).unwrap_or_default().to_string();
    let original_meta = model::meta_of(original).unwrap_or_default();

    let mut meta = RerumMeta::new_root(agent, config);
    meta.history.prime = if original_meta.history.prime == PRIME_ROOT {
        original_id.clone()
    } else {
        original_meta.history.prime.clone()
    };
    meta.history.previous = original_id.clone();
    // The releases pointer carries the nearest released ancestor forward.
    meta.releases.previous = if original_meta.is_released.is_empty() {
        original_meta.releases.previous.clone()
    } else {
        original_id.clone()
    };

    let doc = finish_document(content, &meta, config);
    let new_id = model::at_id(&doc).unwrap_or_default().to_string();
    let ancestor = (!original_id.is_empty()).then(|| {
        (
            model::short_id(&original_id).to_string(),
            UpdateSpec::default().push("__rerum.history.next", Value::String(new_id)),
        )
    });
    NewVersion { doc, ancestor }
}

// ---------------------------------------------------------------------------
// Merge semantics for patch / set / unset
// ---------------------------------------------------------------------------

/// The non-protected content of a stored document.
pub fn content_of(doc: &Value) -> Map<String, Value> {
    model::strip_protected(doc)
}

/// Replaces values of keys already present on the original; keys absent
/// from the original are ignored.
pub fn apply_patch(original: &Value, body: &Value) -> Map<String, Value> {
    let mut merged = content_of(original);
    for (key, value) in model::strip_protected(body) {
        if merged.contains_key(&key) {
            merged.insert(key, value);
        }
    }
    merged
}

/// Adds only keys absent from the original; present keys are untouched.
pub fn apply_set(original: &Value, body: &Value) -> Map<String, Value> {
    let mut merged = content_of(original);
    for (key, value) in model::strip_protected(body) {
        merged.entry(key).or_insert(value);
    }
    merged
}

/// Removes keys whose body value is null and which exist on the original;
/// anything else is ignored.
pub fn apply_unset(original: &Value, body: &Value) -> Map<String, Value> {
    let mut merged = content_of(original);
    for (key, value) in model::strip_protected(body) {
        if value.is_null() {
            merged.remove(&key);
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Chain traversal
// ---------------------------------------------------------------------------

/// The `@id` of the chain origin for a document.
pub fn prime_id(doc: &Value) -> String {
    let meta = model::meta_of(doc).unwrap_or_default();
    if meta.history.prime == PRIME_ROOT {
        model::at_id(doc).unwrap_or_default().to_string()
    } else {
        meta.history.prime
    }
}

/// Fetches every member of a document's version chain in one store query:
/// the prime itself plus everything whose `history.prime` names it.
pub async fn chain_members(store: &dyn DocumentStore, doc: &Value) -> Result<Vec<Value>> {
    let prime = prime_id(doc);
    let query = serde_json::json!({
        "$or": [
            {"__rerum.history.prime": prime},
            {"@id": prime},
        ]
    });
    store.find_many(&query, 0, 0).await
}

fn by_id(members: &[Value]) -> std::collections::HashMap<&str, &Value> {
    members
        .iter()
        .filter_map(|m| model::at_id(m).map(|id| (id, m)))
        .collect()
}

/// The chain upward from `target` to its root, nearest ancestor first.
pub fn ancestors_of(target: &Value, members: &[Value]) -> Vec<Value> {
    let index = by_id(members);
    let mut out = Vec::new();
    let mut cursor = model::meta_of(target)
        .map(|m| m.history.previous)
        .unwrap_or_default();
    while !cursor.is_empty() && cursor != PRIME_ROOT {
        let Some(doc) = index.get(cursor.as_str()) else {
            break;
        };
        out.push((*doc).clone());
        cursor = model::meta_of(doc)
            .map(|m| m.history.previous)
            .unwrap_or_default();
    }
    out
}

/// All descendants of `target`, breadth-first in generation order.
pub fn descendants_of(target: &Value, members: &[Value]) -> Vec<Value> {
    let index = by_id(members);
    let mut out = Vec::new();
    let mut queue: std::collections::VecDeque<String> = model::meta_of(target)
        .map(|m| m.history.next)
        .unwrap_or_default()
        .into();
    while let Some(id) = queue.pop_front() {
        let Some(doc) = index.get(id.as_str()) else {
            continue;
        };
        out.push((*doc).clone());
        for next in model::meta_of(doc).map(|m| m.history.next).unwrap_or_default() {
            queue.push_back(next);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Release bookkeeping
// ---------------------------------------------------------------------------

/// Finds the nearest released ancestor of `target`, if any.
pub async fn nearest_released_ancestor(
    store: &dyn DocumentStore,
    target: &Value,
) -> Result<Option<Value>> {
    let members = chain_members(store, target).await?;
    Ok(ancestors_of(target, &members)
        .into_iter()
        .find(model::is_released))
}

/// The targeted modifications performed by a release: stamp the target and
/// link it into the releases tree under its nearest released ancestor.
pub fn release_updates(
    target: &Value,
    released_ancestor: Option<&Value>,
) -> (UpdateSpec, Option<(String, UpdateSpec)>) {
    let ancestor_id = released_ancestor
        .and_then(model::at_id)
        .unwrap_or_default()
        .to_string();
    let target_spec = UpdateSpec::default()
        .set("__rerum.isReleased", Value::String(model::iso_now()))
        .set("__rerum.releases.previous", Value::String(ancestor_id.clone()))
        .set("__rerum.releases.replaces", Value::String(ancestor_id.clone()));
    let ancestor_spec = (!ancestor_id.is_empty()).then(|| {
        let target_id = model::at_id(target).unwrap_or_default().to_string();
        (
            model::short_id(&ancestor_id).to_string(),
            UpdateSpec::default().push("__rerum.releases.next", Value::String(target_id)),
        )
    });
    (target_spec, ancestor_spec)
}

// ---------------------------------------------------------------------------
// Delete healing
// ---------------------------------------------------------------------------

/// Rewires the chain around a document about to be deleted: its ancestor's
/// `history.next` swaps the deleted id for the deleted document's own
/// descendants, and each descendant's `history.previous` is repointed at
/// that ancestor (or emptied when the deleted document was the root).
pub fn heal_history(snapshot: &Value, members: &[Value]) -> Vec<(String, UpdateSpec)> {
    let meta = model::meta_of(snapshot).unwrap_or_default();
    let snapshot_id = model::at_id(snapshot).unwrap_or_default();
    let index = by_id(members);
    let mut updates = Vec::new();

    let previous = meta.history.previous.clone();
    if let Some(ancestor) = index.get(previous.as_str()) {
        let ancestor_meta = model::meta_of(ancestor).unwrap_or_default();
        let rewired: Vec<Value> = ancestor_meta
            .history
            .next
            .iter()
            .filter(|id| id.as_str() != snapshot_id)
            .cloned()
            .chain(meta.history.next.iter().cloned())
            .map(Value::String)
            .collect();
        updates.push((
            model::short_id(&previous).to_string(),
            UpdateSpec::default().set("__rerum.history.next", Value::Array(rewired)),
        ));
    }

    let new_previous = if index.contains_key(previous.as_str()) {
        previous
    } else {
        String::new()
    };
    for child in &meta.history.next {
        if index.contains_key(child.as_str()) {
            updates.push((
                model::short_id(child).to_string(),
                UpdateSpec::default()
                    .set("__rerum.history.previous", Value::String(new_previous.clone())),
            ));
        }
    }
    updates
}
