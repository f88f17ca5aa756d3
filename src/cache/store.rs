//! Per-worker in-memory cache.
//!
//! A bounded map from fingerprint to opaque response bytes with LRU
//! eviction, a byte cap, and a per-entry TTL. Every operation is total: an
//! internal failure degrades to a miss or no-op and bumps the `errors`
//! counter, never the client response.
//!
//! The mutex only guards pure in-memory work and is never held across an
//! await point.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    size: usize,
    /// LRU position; freshest access holds the highest sequence number.
    seq: u64,
    expires_at: Instant,
    inserted_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    /// Top-level field names of the canonical query body, recorded for
    /// `query:*` entries so the planner can invalidate by field overlap.
    fields: Option<BTreeSet<String>>,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    bytes: usize,
    hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
}

pub struct CacheStore {
    inner: Mutex<Inner>,
    errors: AtomicU64,
    max_length: usize,
    max_bytes: usize,
    ttl: Duration,
}

/// Counter snapshot for `/api/cache/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub errors: u64,
    pub length: usize,
    pub bytes: usize,
    pub ttl: u64,
    #[serde(rename = "maxLength")]
    pub max_length: usize,
    #[serde(rename = "maxBytes")]
    pub max_bytes: usize,
}

/// One row of the `?details=true` listing.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: usize,
    #[serde(rename = "insertedAt")]
    pub inserted_at: DateTime<Utc>,
    #[serde(rename = "lastAccessed")]
    pub last_accessed: DateTime<Utc>,
}

impl CacheStore {
    pub fn new(max_length: usize, max_bytes: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            errors: AtomicU64::new(0),
            max_length,
            max_bytes,
            ttl,
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns the cached bytes, or `None` on a miss or an expired entry.
    /// Expired entries are dropped and counted as evictions.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let Some(mut inner) = self.lock() else {
            return None;
        };
        let now = Instant::now();
        let expired = inner.map.get(key).map(|entry| entry.expires_at <= now);
        let Some(expired) = expired else {
            inner.misses += 1;
            return None;
        };
        if expired {
            remove_entry(&mut inner, key);
            inner.evictions += 1;
            inner.misses += 1;
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let entry = inner.map.get_mut(key)?;
        let old_seq = entry.seq;
        entry.seq = seq;
        entry.last_accessed = Utc::now();
        let value = entry.value.clone();
        inner.order.remove(&old_seq);
        inner.order.insert(seq, key.to_string());
        inner.hits += 1;
        Some(value)
    }

    /// Stores opaque bytes under `key`, evicting least-recently-used entries
    /// until both caps hold. `fields` records the indexable field names of a
    /// `query:*` entry for field-overlap invalidation.
    pub fn set(&self, key: &str, value: Vec<u8>, fields: Option<BTreeSet<String>>) {
        let Some(mut inner) = self.lock() else {
            return;
        };
        remove_entry(&mut inner, key);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let size = value.len();
        let now = Utc::now();
        inner.map.insert(
            key.to_string(),
            Entry {
                value,
                size,
                seq,
                expires_at: Instant::now() + self.ttl,
                inserted_at: now,
                last_accessed: now,
                fields,
            },
        );
        inner.order.insert(seq, key.to_string());
        inner.bytes += size;
        inner.sets += 1;

        while inner.map.len() > self.max_length || inner.bytes > self.max_bytes {
            let Some((_, victim)) = inner.order.iter().next().map(|(s, k)| (*s, k.clone()))
            else {
                break;
            };
            remove_entry(&mut inner, &victim);
            inner.evictions += 1;
        }
    }

    /// Drops a single key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let Some(mut inner) = self.lock() else {
            return false;
        };
        let removed = remove_entry(&mut inner, key);
        if removed {
            inner.evictions += 1;
        }
        removed
    }

    /// Drops every key matching `pattern`. Returns the number removed.
    pub fn invalidate(&self, pattern: &Regex) -> usize {
        let Some(mut inner) = self.lock() else {
            return 0;
        };
        let victims: Vec<String> = inner
            .map
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect();
        for key in &victims {
            remove_entry(&mut inner, key);
        }
        inner.evictions += victims.len() as u64;
        victims.len()
    }

    /// Drops every `query:*` entry whose recorded field set intersects
    /// `fields`, and every one with no recorded field set. Invalidating more
    /// than strictly necessary is always safe.
    pub fn invalidate_fields(&self, fields: &[String]) -> usize {
        let Some(mut inner) = self.lock() else {
            return 0;
        };
        let victims: Vec<String> = inner
            .map
            .iter()
            .filter(|(key, entry)| {
                key.starts_with("query:")
                    && match &entry.fields {
                        None => true,
                        Some(recorded) => fields.iter().any(|f| recorded.contains(f)),
                    }
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &victims {
            remove_entry(&mut inner, key);
        }
        inner.evictions += victims.len() as u64;
        victims.len()
    }

    /// Drops everything. Counters other than `length`/`bytes` are cumulative
    /// and survive a clear.
    pub fn clear(&self) {
        let Some(mut inner) = self.lock() else {
            return;
        };
        inner.map.clear();
        inner.order.clear();
        inner.bytes = 0;
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheMetrics {
        let errors = self.errors.load(Ordering::Relaxed);
        let Some(inner) = self.lock() else {
            return CacheMetrics {
                hits: 0,
                misses: 0,
                sets: 0,
                evictions: 0,
                errors,
                length: 0,
                bytes: 0,
                ttl: self.ttl.as_secs(),
                max_length: self.max_length,
                max_bytes: self.max_bytes,
            };
        };
        CacheMetrics {
            hits: inner.hits,
            misses: inner.misses,
            sets: inner.sets,
            evictions: inner.evictions,
            errors,
            length: inner.map.len(),
            bytes: inner.bytes,
            ttl: self.ttl.as_secs(),
            max_length: self.max_length,
            max_bytes: self.max_bytes,
        }
    }

    /// Per-entry listing for `/api/cache/stats?details=true`.
    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let Some(inner) = self.lock() else {
            return Vec::new();
        };
        let mut listing: Vec<CacheEntryInfo> = inner
            .map
            .iter()
            .map(|(key, entry)| CacheEntryInfo {
                key: key.clone(),
                size_bytes: entry.size,
                inserted_at: entry.inserted_at,
                last_accessed: entry.last_accessed,
            })
            .collect();
        listing.sort_by(|a, b| a.key.cmp(&b.key));
        listing
    }
}

fn remove_entry(inner: &mut Inner, key: &str) -> bool {
    match inner.map.remove(key) {
        Some(entry) => {
            inner.order.remove(&entry.seq);
            inner.bytes -= entry.size;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_length: usize, max_bytes: usize, ttl_ms: u64) -> CacheStore {
        CacheStore::new(max_length, max_bytes, Duration::from_millis(ttl_ms))
    }

    #[test]
    fn test_get_miss_then_hit() {
        let cache = store(10, 1024, 60_000);
        assert!(cache.get("id:a").is_none());
        cache.set("id:a", b"payload".to_vec(), None);
        assert_eq!(cache.get("id:a").unwrap(), b"payload");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
    }

    #[test]
    fn test_length_cap_evicts_lru() {
        let cache = store(2, 1024, 60_000);
        cache.set("id:a", b"a".to_vec(), None);
        cache.set("id:b", b"b".to_vec(), None);
        // Touch a so b becomes the least recently used.
        cache.get("id:a");
        cache.set("id:c", b"c".to_vec(), None);
        assert!(cache.get("id:a").is_some());
        assert!(cache.get("id:b").is_none());
        assert!(cache.get("id:c").is_some());
        assert!(cache.stats().length <= 2);
    }

    #[test]
    fn test_byte_cap_holds_after_every_set() {
        let cache = store(100, 10, 60_000);
        cache.set("id:a", vec![0u8; 6], None);
        cache.set("id:b", vec![0u8; 6], None);
        let stats = cache.stats();
        assert!(stats.bytes <= 10, "bytes {} over cap", stats.bytes);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_oversized_entry_is_dropped() {
        let cache = store(100, 10, 60_000);
        cache.set("id:a", vec![0u8; 32], None);
        assert!(cache.get("id:a").is_none());
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn test_ttl_expiry_counts_as_eviction() {
        let cache = store(10, 1024, 10);
        cache.set("id:a", b"a".to_vec(), None);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("id:a").is_none());
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_pattern_invalidation() {
        let cache = store(10, 1024, 60_000);
        cache.set("history:aaa", b"1".to_vec(), None);
        cache.set("since:aaa", b"2".to_vec(), None);
        cache.set("history:bbb", b"3".to_vec(), None);
        let pattern = Regex::new("^(history|since):aaa$").unwrap();
        assert_eq!(cache.invalidate(&pattern), 2);
        assert!(cache.get("history:aaa").is_none());
        assert!(cache.get("history:bbb").is_some());
    }

    #[test]
    fn test_field_invalidation_spares_disjoint_queries() {
        let cache = store(10, 1024, 60_000);
        let fields = |names: &[&str]| {
            Some(names.iter().map(ToString::to_string).collect::<BTreeSet<_>>())
        };
        cache.set("query:one", b"1".to_vec(), fields(&["type", "target"]));
        cache.set("query:two", b"2".to_vec(), fields(&["creator"]));
        cache.set("query:three", b"3".to_vec(), None);
        cache.set("search:x", b"4".to_vec(), None);

        let removed = cache.invalidate_fields(&["type".to_string()]);
        // Overlapping and unknown-field queries go; disjoint stays; other
        // namespaces are untouched.
        assert_eq!(removed, 2);
        assert!(cache.get("query:one").is_none());
        assert!(cache.get("query:two").is_some());
        assert!(cache.get("query:three").is_none());
        assert!(cache.get("search:x").is_some());
    }

    #[test]
    fn test_clear_resets_length_and_bytes_only() {
        let cache = store(10, 1024, 60_000);
        cache.set("id:a", b"abc".to_vec(), None);
        cache.get("id:a");
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.length, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.sets, 1);
    }

    #[test]
    fn test_details_listing() {
        let cache = store(10, 1024, 60_000);
        cache.set("id:b", b"bb".to_vec(), None);
        cache.set("id:a", b"a".to_vec(), None);
        let entries = cache.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "id:a");
        assert_eq!(entries[0].size_bytes, 1);
        assert_eq!(entries[1].key, "id:b");
    }

    #[test]
    fn test_replacing_a_key_does_not_leak_bytes() {
        let cache = store(10, 1024, 60_000);
        cache.set("id:a", vec![0u8; 8], None);
        cache.set("id:a", vec![0u8; 2], None);
        let stats = cache.stats();
        assert_eq!(stats.length, 1);
        assert_eq!(stats.bytes, 2);
    }
}
