//! Document store seam.
//!
//! Documents are JSON values addressed by `(collection, id)`. Subcollections
//! are plain collections whose name embeds the parent, e.g.
//! `wall_items/123/shards`. Every backend provides ordered, cursor-paginated
//! queries, optimistic multi-document transactions with automatic retry, and
//! per-document change subscriptions.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::utils::security::{b64_decode, b64_encode};
use crate::utils::thread_state::generate_id_string;

pub mod changes;
pub mod conn;
pub mod feed;
pub mod memory;
pub mod postgres;
#[cfg(test)]
pub mod testing;

pub use changes::Subscription;

/// Attempts a backend makes before giving up on a conflicting transaction.
pub const MAX_TX_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("pubsub error: {0}")]
    PubSub(#[from] fred::error::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("document {0} not found")]
    NotFound(DocRef),

    #[error("document {0} already exists")]
    AlreadyExists(DocRef),

    #[error("transaction conflict persisted after {attempts} attempts")]
    Conflict { attempts: u32 },

    #[error("transaction read {0} outside its declared read set")]
    UndeclaredRead(DocRef),

    #[error("invalid cursor")]
    InvalidCursor,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocRef {
    pub collection: String,
    pub id: String,
}

impl DocRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn subcollection(&self, name: &str) -> String {
        format!("{}/{}/{}", self.collection, self.id, name)
    }

    pub fn child(&self, name: &str, id: impl Into<String>) -> DocRef {
        DocRef::new(self.subcollection(name), id)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub data: Value,
    pub version: u64,
}

impl Document {
    pub fn doc_ref(&self) -> DocRef {
        DocRef::new(self.collection.clone(), self.id.clone())
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(T::deserialize(&self.data)?)
    }

    pub fn field(&self, name: &str) -> &Value {
        self.data.get(name).unwrap_or(&Value::Null)
    }
}

/// Equality constraint on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// Continuation token: the sort key and id of the last document seen.
/// Serialized as an opaque url-safe string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Cursor {
    pub sort_key: Value,
    pub id: String,
}

#[derive(Serialize, Deserialize)]
struct CursorRepr {
    k: Value,
    i: String,
}

impl Cursor {
    pub fn after(doc: &Document, order_field: &str) -> Self {
        Self {
            sort_key: doc.field(order_field).clone(),
            id: doc.id.clone(),
        }
    }

    pub fn encode(&self) -> String {
        let repr = CursorRepr {
            k: self.sort_key.clone(),
            i: self.id.clone(),
        };
        // Serializing a Value and a String cannot fail.
        b64_encode(serde_json::to_string(&repr).unwrap_or_default().as_bytes())
    }

    pub fn decode(token: &str) -> Result<Self, StoreError> {
        let raw = b64_decode(token).map_err(|_| StoreError::InvalidCursor)?;
        let repr: CursorRepr =
            serde_json::from_slice(&raw).map_err(|_| StoreError::InvalidCursor)?;
        Ok(Self {
            sort_key: repr.k,
            id: repr.i,
        })
    }

    /// Whether `doc` sorts strictly after this cursor under `order`.
    pub fn precedes(&self, doc: &Document, order: &OrderBy) -> bool {
        let ordering = compare_values(doc.field(&order.field), &self.sort_key)
            .then_with(|| doc.id.cmp(&self.id));
        if order.descending {
            ordering == Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.encode()
    }
}

impl TryFrom<String> for Cursor {
    type Error = StoreError;

    fn try_from(token: String) -> Result<Self, Self::Error> {
        Cursor::decode(&token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
    pub order_by: OrderBy,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: OrderBy {
                field: "created_at".to_string(),
                descending: true,
            },
            cursor: None,
            limit: 20,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = OrderBy {
            field: field.into(),
            descending,
        };
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.collection == self.collection
            && self.filters.iter().all(|f| doc.field(&f.field) == &f.value)
            && self
                .cursor
                .as_ref()
                .is_none_or(|cursor| cursor.precedes(doc, &self.order_by))
    }

    /// Total order used by every backend: sort field, then id.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let ordering = compare_values(a.field(&self.order_by.field), b.field(&self.order_by.field))
            .then_with(|| a.id.cmp(&b.id));
        if self.order_by.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub documents: Vec<Document>,
    /// Rows the backend returned before any caller-side filtering.
    pub raw_count: usize,
}

impl QueryPage {
    pub fn next_cursor(&self, order_field: &str) -> Option<Cursor> {
        self.documents
            .last()
            .map(|doc| Cursor::after(doc, order_field))
    }
}

/// Mirrors jsonb ordering for the value kinds we sort on.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::String(_) => 1,
            Value::Number(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxWrite {
    Set { doc: DocRef, data: Value },
    Delete(DocRef),
}

impl TxWrite {
    pub fn doc_ref(&self) -> &DocRef {
        match self {
            TxWrite::Set { doc, .. } => doc,
            TxWrite::Delete(doc) => doc,
        }
    }
}

/// View handed to a transaction body: a snapshot of the declared read set
/// and a buffer of writes applied only if the snapshot is still current at
/// commit time.
#[derive(Debug)]
pub struct TxContext {
    snapshot: HashMap<DocRef, Option<Document>>,
    writes: Vec<TxWrite>,
}

impl TxContext {
    pub fn new(snapshot: HashMap<DocRef, Option<Document>>) -> Self {
        Self {
            snapshot,
            writes: Vec::new(),
        }
    }

    pub fn get(&self, doc: &DocRef) -> Result<Option<&Document>, StoreError> {
        self.snapshot
            .get(doc)
            .map(Option::as_ref)
            .ok_or_else(|| StoreError::UndeclaredRead(doc.clone()))
    }

    pub fn get_typed<T: DeserializeOwned>(&self, doc: &DocRef) -> Result<Option<T>, StoreError> {
        self.get(doc)?.map(Document::decode).transpose()
    }

    /// Writes to documents outside the read set are blind upserts.
    pub fn set(&mut self, doc: DocRef, data: Value) {
        self.writes.push(TxWrite::Set { doc, data });
    }

    pub fn set_typed<T: Serialize>(&mut self, doc: DocRef, value: &T) -> Result<(), StoreError> {
        self.set(doc, serde_json::to_value(value)?);
        Ok(())
    }

    pub fn delete(&mut self, doc: DocRef) {
        self.writes.push(TxWrite::Delete(doc));
    }

    /// Version each read document had when the body ran; `None` for absent.
    pub fn read_versions(&self) -> impl Iterator<Item = (&DocRef, Option<u64>)> {
        self.snapshot
            .iter()
            .map(|(doc, found)| (doc, found.as_ref().map(|d| d.version)))
    }

    pub fn into_writes(self) -> Vec<TxWrite> {
        self.writes
    }
}

/// Documents as they stand after a committed transaction.
#[derive(Debug, Clone, Default)]
pub struct TxCommit {
    pub written: Vec<Document>,
    pub deleted: Vec<DocRef>,
}

impl TxCommit {
    pub fn document(&self, doc: &DocRef) -> Option<&Document> {
        self.written.iter().rev().find(|d| d.doc_ref() == *doc)
    }
}

/// A transaction body. It may run several times, once per attempt.
pub type TxBody<'a> = &'a (dyn Fn(&mut TxContext) -> Result<(), StoreError> + Send + Sync);

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<QueryPage, StoreError>;

    /// Inserts a new document, failing if the id is taken.
    async fn create(&self, doc: &DocRef, data: Value) -> Result<Document, StoreError>;

    /// Reads `reads`, runs `body`, and commits its writes atomically. On a
    /// concurrent modification of any read document the whole
    /// read-run-commit sequence is retried, up to [`MAX_TX_ATTEMPTS`].
    async fn run_transaction(
        &self,
        reads: &[DocRef],
        body: TxBody<'_>,
    ) -> Result<TxCommit, StoreError>;

    async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, StoreError>;

    async fn add_doc(&self, collection: &str, data: Value) -> Result<Document, StoreError> {
        let doc = DocRef::new(collection, generate_id_string());
        self.create(&doc, data).await
    }
}
