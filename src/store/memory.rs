//! In-process document store.
//!
//! Implements the same query semantics the Mongo adapter relies on (dotted
//! paths, array traversal, `$exists` / `$size` / `$in` / `$ne` / `$regex`,
//! `$or` / `$and`) plus word and phrase text search, so the whole pipeline
//! can run without external services. Backs the test suite and the
//! standalone mode.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{DocumentStore, UpdateSpec};

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn doc_id(doc: &Value) -> Result<String> {
        doc.get("_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("document is missing a string _id"))
    }

    async fn matching(&self, query: &Value) -> Vec<Value> {
        let docs = self.docs.read().await;
        let mut found: Vec<Value> = docs
            .values()
            .filter(|doc| matches_query(doc, query))
            .cloned()
            .collect();
        found.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        found
    }
}

fn sort_key(doc: &Value) -> (String, String) {
    let created = doc
        .pointer("/__rerum/createdAt")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let id = doc
        .get("_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (created, id)
}

fn paginate(found: Vec<Value>, limit: i64, skip: u64) -> Vec<Value> {
    let take = if limit <= 0 {
        usize::MAX
    } else {
        usize::try_from(limit).unwrap_or(usize::MAX)
    };
    found
        .into_iter()
        .skip(usize::try_from(skip).unwrap_or(0))
        .take(take)
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(&self, query: &Value) -> Result<Option<Value>> {
        Ok(self.matching(query).await.into_iter().next())
    }

    async fn find_many(&self, query: &Value, limit: i64, skip: u64) -> Result<Vec<Value>> {
        Ok(paginate(self.matching(query).await, limit, skip))
    }

    async fn insert_one(&self, doc: &Value) -> Result<()> {
        let id = Self::doc_id(doc)?;
        let mut docs = self.docs.write().await;
        if docs.contains_key(&id) {
            anyhow::bail!("duplicate _id: {id}");
        }
        docs.insert(id, doc.clone());
        Ok(())
    }

    async fn insert_many(&self, batch: &[Value]) -> Result<()> {
        let mut docs = self.docs.write().await;
        for doc in batch {
            let id = Self::doc_id(doc)?;
            if docs.contains_key(&id) {
                anyhow::bail!("duplicate _id: {id}");
            }
            docs.insert(id, doc.clone());
        }
        Ok(())
    }

    async fn replace_one(&self, id: &str, doc: &Value) -> Result<bool> {
        let mut docs = self.docs.write().await;
        if !docs.contains_key(id) {
            return Ok(false);
        }
        docs.insert(id.to_string(), doc.clone());
        Ok(true)
    }

    async fn update_one(&self, id: &str, spec: &UpdateSpec) -> Result<bool> {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.get_mut(id) else {
            return Ok(false);
        };
        for (path, value) in &spec.set {
            set_path(doc, path, value.clone());
        }
        for (path, value) in &spec.push {
            push_path(doc, path, value.clone());
        }
        Ok(true)
    }

    async fn text_search(&self, text: &str, limit: i64, skip: u64) -> Result<Vec<Value>> {
        let words = tokenize(text);
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.docs.read().await;
        let mut found: Vec<Value> = docs
            .values()
            .filter(|doc| {
                let mut tokens = Vec::new();
                collect_tokens(doc, &mut tokens);
                words.iter().any(|w| tokens.iter().any(|t| t == w))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        Ok(paginate(found, limit, skip))
    }

    async fn phrase_search(
        &self,
        text: &str,
        slop: u32,
        limit: i64,
        skip: u64,
    ) -> Result<Vec<Value>> {
        let words = tokenize(text);
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.docs.read().await;
        let mut found: Vec<Value> = docs
            .values()
            .filter(|doc| {
                let mut fields = Vec::new();
                collect_strings(doc, &mut fields);
                fields
                    .iter()
                    .any(|field| phrase_matches(&tokenize(field), &words, slop as usize))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        Ok(paginate(found, limit, skip))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Query matching
// ---------------------------------------------------------------------------

fn matches_query(doc: &Value, query: &Value) -> bool {
    let Some(conditions) = query.as_object() else {
        return false;
    };
    conditions.iter().all(|(key, cond)| match key.as_str() {
        "$or" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().any(|sub| matches_query(doc, sub))),
        "$and" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().all(|sub| matches_query(doc, sub))),
        path => {
            let mut candidates = Vec::new();
            resolve_path(doc, &path.split('.').collect::<Vec<_>>(), &mut candidates);
            matches_condition(&candidates, cond)
        }
    })
}

/// Collects every value reachable at a dotted path, traversing arrays at
/// each step the way the document database does.
fn resolve_path<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                resolve_path(next, rest, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_path(item, segments, out);
            }
        }
        _ => {}
    }
}

fn matches_condition(candidates: &[&Value], cond: &Value) -> bool {
    if let Some(operators) = operator_map(cond) {
        return operators.iter().all(|(op, arg)| match op.as_str() {
            "$exists" => arg.as_bool().unwrap_or(true) == !candidates.is_empty(),
            "$size" => candidates.iter().any(|c| {
                c.as_array()
                    .is_some_and(|a| Some(a.len() as u64) == arg.as_u64())
            }),
            "$in" => arg
                .as_array()
                .is_some_and(|options| options.iter().any(|o| equals_any(candidates, o))),
            "$ne" => !equals_any(candidates, arg),
            "$regex" => {
                let options = operators
                    .get("$options")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                regex_matches(candidates, arg, options)
            }
            "$options" => true,
            "$gt" | "$gte" | "$lt" | "$lte" => numeric_compare(candidates, op, arg),
            _ => false,
        });
    }
    equals_any(candidates, cond)
}

/// A condition object whose keys all start with `$` is an operator map;
/// anything else is matched as a literal value.
fn operator_map(cond: &Value) -> Option<&serde_json::Map<String, Value>> {
    let map = cond.as_object()?;
    if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) {
        Some(map)
    } else {
        None
    }
}

fn equals_any(candidates: &[&Value], needle: &Value) -> bool {
    candidates.iter().any(|c| {
        *c == needle || c.as_array().is_some_and(|items| items.contains(needle))
    })
}

fn regex_matches(candidates: &[&Value], pattern: &Value, options: &str) -> bool {
    let Some(raw) = pattern.as_str() else {
        return false;
    };
    let full = if options.contains('i') {
        format!("(?i){raw}")
    } else {
        raw.to_string()
    };
    let Ok(re) = regex::Regex::new(&full) else {
        return false;
    };
    candidates
        .iter()
        .any(|c| c.as_str().is_some_and(|s| re.is_match(s)))
}

fn numeric_compare(candidates: &[&Value], op: &str, arg: &Value) -> bool {
    let Some(rhs) = arg.as_f64() else {
        return false;
    };
    candidates.iter().any(|c| {
        c.as_f64().is_some_and(|lhs| match op {
            "$gt" => lhs > rhs,
            "$gte" => lhs >= rhs,
            "$lt" => lhs < rhs,
            "$lte" => lhs <= rhs,
            _ => false,
        })
    })
}

// ---------------------------------------------------------------------------
// Targeted modification
// ---------------------------------------------------------------------------

/// Walks to the parent of the final path segment, creating intermediate
/// objects along the way.
fn descend<'a>(mut current: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    for segment in segments {
        let map = current.as_object_mut()?;
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Some(current)
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    if let Some(parent) = descend(doc, parents).and_then(Value::as_object_mut) {
        parent.insert((*last).to_string(), value);
    }
}

fn push_path(doc: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let Some(parent) = descend(doc, parents).and_then(Value::as_object_mut) else {
        return;
    };
    let slot = parent
        .entry((*last).to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(items) = slot.as_array_mut() {
        items.push(value);
    }
}

// ---------------------------------------------------------------------------
// Text search
// ---------------------------------------------------------------------------

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Walks every searchable string value; ids and bookkeeping are excluded.
fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => {
            for (key, v) in map {
                if !matches!(key.as_str(), "_id" | "@id" | "__rerum" | "__deleted") {
                    collect_strings(v, out);
                }
            }
        }
        _ => {}
    }
}

fn collect_tokens(value: &Value, out: &mut Vec<String>) {
    let mut fields = Vec::new();
    collect_strings(value, &mut fields);
    for field in fields {
        out.extend(tokenize(&field));
    }
}

/// Whether `words` appear in order within `tokens`, tolerating up to `slop`
/// extra positions across the whole phrase.
fn phrase_matches(tokens: &[String], words: &[String], slop: usize) -> bool {
    let Some(first) = words.first() else {
        return false;
    };
    'starts: for (start, token) in tokens.iter().enumerate() {
        if token != first {
            continue;
        }
        let mut pos = start;
        let mut budget = slop;
        for word in &words[1..] {
            let window_end = (pos + 2 + budget).min(tokens.len());
            let Some(found) = (pos + 1..window_end).find(|&j| &tokens[j] == word) else {
                continue 'starts;
            };
            budget -= found - pos - 1;
            pos = found;
        }
        return true;
    }
    false
}
