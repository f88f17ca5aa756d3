//! MongoDB adapter: one shared collection behind the `DocumentStore` trait.
//!
//! Documents cross this boundary as plain JSON; conversion to and from BSON
//! happens only here. Text search runs through the Atlas Search `$search`
//! aggregation stage (index name `default`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::options::{ClientOptions, FindOptions};
use mongodb::{Client, Collection, Database};
use serde_json::Value;

use super::{DocumentStore, UpdateSpec};

pub struct MongoStore {
    database: Database,
    collection: Collection<Document>,
}

impl MongoStore {
    pub async fn connect(uri: &str, db: &str, collection: &str) -> Result<Self> {
        let options = ClientOptions::parse(uri)
            .await
            .context("invalid MongoDB connection string")?;
        let client = Client::with_options(options)?;
        let database = client.database(db);
        database
            .run_command(doc! {"ping": 1}, None)
            .await
            .context("MongoDB ping failed")?;
        tracing::info!("Connected to MongoDB collection {db}.{collection}");
        Ok(Self {
            collection: database.collection::<Document>(collection),
            database,
        })
    }

    fn to_document(value: &Value) -> Result<Document> {
        bson::to_document(value).context("JSON value is not a document")
    }

    fn from_document(doc: Document) -> Result<Value> {
        serde_json::to_value(&doc).context("BSON document is not plain JSON")
    }

    async fn collect(&self, cursor: mongodb::Cursor<Document>) -> Result<Vec<Value>> {
        let docs: Vec<Document> = cursor.try_collect().await?;
        docs.into_iter().map(Self::from_document).collect()
    }

    async fn search_pipeline(
        &self,
        operator: Document,
        limit: i64,
        skip: u64,
    ) -> Result<Vec<Value>> {
        let mut search = doc! {"index": "default"};
        search.extend(operator);
        let pipeline = vec![
            doc! {"$search": search},
            doc! {"$skip": skip as i64},
            doc! {"$limit": if limit <= 0 { i64::MAX } else { limit }},
        ];
        let cursor = self.collection.aggregate(pipeline, None).await?;
        self.collect(cursor).await
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn find_one(&self, query: &Value) -> Result<Option<Value>> {
        let filter = Self::to_document(query)?;
        match self.collection.find_one(filter, None).await? {
            Some(doc) => Ok(Some(Self::from_document(doc)?)),
            None => Ok(None),
        }
    }

    async fn find_many(&self, query: &Value, limit: i64, skip: u64) -> Result<Vec<Value>> {
        let filter = Self::to_document(query)?;
        let options = FindOptions::builder()
            .limit(if limit <= 0 { None } else { Some(limit) })
            .skip(if skip == 0 { None } else { Some(skip) })
            .build();
        let cursor = self.collection.find(filter, options).await?;
        self.collect(cursor).await
    }

    async fn insert_one(&self, doc: &Value) -> Result<()> {
        self.collection
            .insert_one(Self::to_document(doc)?, None)
            .await?;
        Ok(())
    }

    async fn insert_many(&self, docs: &[Value]) -> Result<()> {
        let batch: Result<Vec<Document>> = docs.iter().map(Self::to_document).collect();
        self.collection.insert_many(batch?, None).await?;
        Ok(())
    }

    async fn replace_one(&self, id: &str, doc: &Value) -> Result<bool> {
        let result = self
            .collection
            .replace_one(doc! {"_id": id}, Self::to_document(doc)?, None)
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn update_one(&self, id: &str, spec: &UpdateSpec) -> Result<bool> {
        let mut update = Document::new();
        if !spec.set.is_empty() {
            let mut set = Document::new();
            for (path, value) in &spec.set {
                set.insert(path.clone(), bson::to_bson(value)?);
            }
            update.insert("$set", set);
        }
        if !spec.push.is_empty() {
            let mut push = Document::new();
            for (path, value) in &spec.push {
                push.insert(path.clone(), bson::to_bson(value)?);
            }
            update.insert("$push", push);
        }
        if update.is_empty() {
            return Ok(true);
        }
        let result = self
            .collection
            .update_one(doc! {"_id": id}, update, None)
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn text_search(&self, text: &str, limit: i64, skip: u64) -> Result<Vec<Value>> {
        let operator = doc! {
            "text": {"query": text, "path": {"wildcard": "*"}}
        };
        self.search_pipeline(operator, limit, skip).await
    }

    async fn phrase_search(
        &self,
        text: &str,
        slop: u32,
        limit: i64,
        skip: u64,
    ) -> Result<Vec<Value>> {
        let operator = doc! {
            "phrase": {"query": text, "path": {"wildcard": "*"}, "slop": slop as i64}
        };
        self.search_pipeline(operator, limit, skip).await
    }

    async fn ping(&self) -> Result<()> {
        self.database.run_command(doc! {"ping": 1}, None).await?;
        Ok(())
    }
}
