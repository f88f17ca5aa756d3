//! Document store adapter.
//!
//! The pipelines only ever talk to this trait. `MongoStore` is the deployed
//! adapter (one shared collection); `MemoryStore` implements the same query
//! semantics in-process for tests and the standalone mode.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// A targeted single-document modification expressed as dotted paths, the
/// only kind of in-place mutation the versioning engine performs.
#[derive(Debug, Clone, Default)]
pub struct UpdateSpec {
    /// `$set`-style assignments.
    pub set: Vec<(String, Value)>,
    /// `$push`-style appends onto array fields.
    pub push: Vec<(String, Value)>,
}

impl UpdateSpec {
    pub fn set(mut self, path: &str, value: Value) -> Self {
        self.set.push((path.to_string(), value));
        self
    }

    pub fn push(mut self, path: &str, value: Value) -> Self {
        self.push.push((path.to_string(), value));
        self
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(&self, query: &Value) -> Result<Option<Value>>;

    /// `limit <= 0` means unbounded.
    async fn find_many(&self, query: &Value, limit: i64, skip: u64) -> Result<Vec<Value>>;

    async fn insert_one(&self, doc: &Value) -> Result<()>;

    async fn insert_many(&self, docs: &[Value]) -> Result<()>;

    /// Replaces the document with `_id == id`. Returns whether one matched.
    async fn replace_one(&self, id: &str, doc: &Value) -> Result<bool>;

    /// Applies a targeted modification. Returns whether one matched.
    async fn update_one(&self, id: &str, spec: &UpdateSpec) -> Result<bool>;

    /// Word-based full-text search over document content.
    async fn text_search(&self, text: &str, limit: i64, skip: u64) -> Result<Vec<Value>>;

    /// Phrase search; `slop` is the number of extra positions tolerated
    /// between consecutive phrase words.
    async fn phrase_search(&self, text: &str, slop: u32, limit: i64, skip: u64)
        -> Result<Vec<Value>>;

    async fn ping(&self) -> Result<()>;
}

/// Query selecting a single document by its opaque id suffix.
pub fn id_query(id: &str) -> Value {
    json!({ "_id": id })
}
