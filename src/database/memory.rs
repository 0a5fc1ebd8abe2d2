use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::changes::ChangeFeed;
use super::{
    DocRef, Document, DocumentStore, MAX_TX_ATTEMPTS, Query, QueryPage, StoreError, Subscription,
    TxBody, TxCommit, TxContext, TxWrite,
};

/// Process-local store used for development and tests. Transactions follow
/// the same optimistic protocol as the Postgres backend: snapshot, run,
/// then validate versions under the write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<DocRef, Document>>,
    changes: ChangeFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn snapshot(&self, reads: &[DocRef]) -> HashMap<DocRef, Option<Document>> {
        let docs = self.docs.read().await;
        reads
            .iter()
            .map(|doc| (doc.clone(), docs.get(doc).cloned()))
            .collect()
    }

    /// Applies `writes` if every read is still at the version the body saw.
    /// Returns `None` on conflict.
    async fn try_commit(&self, ctx: TxContext) -> Option<TxCommit> {
        let mut docs = self.docs.write().await;

        let stale = ctx
            .read_versions()
            .any(|(doc, seen)| docs.get(doc).map(|d| d.version) != seen);
        if stale {
            return None;
        }

        let mut commit = TxCommit::default();
        for write in ctx.into_writes() {
            match write {
                TxWrite::Set { doc, data } => {
                    let version = docs.get(&doc).map_or(1, |d| d.version + 1);
                    let stored = Document {
                        collection: doc.collection.clone(),
                        id: doc.id.clone(),
                        data,
                        version,
                    };
                    docs.insert(doc, stored.clone());
                    commit.written.push(stored);
                }
                TxWrite::Delete(doc) => {
                    if docs.remove(&doc).is_some() {
                        commit.deleted.push(doc);
                    }
                }
            }
        }
        Some(commit)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        Ok(self.docs.read().await.get(doc).cloned())
    }

    async fn query(&self, query: &Query) -> Result<QueryPage, StoreError> {
        let docs = self.docs.read().await;
        let mut matched: Vec<Document> = docs
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        matched.sort_by(|a, b| query.compare(a, b));
        matched.truncate(query.limit);

        Ok(QueryPage {
            raw_count: matched.len(),
            documents: matched,
        })
    }

    async fn create(&self, doc: &DocRef, data: Value) -> Result<Document, StoreError> {
        let stored = {
            let mut docs = self.docs.write().await;
            if docs.contains_key(doc) {
                return Err(StoreError::AlreadyExists(doc.clone()));
            }
            let stored = Document {
                collection: doc.collection.clone(),
                id: doc.id.clone(),
                data,
                version: 1,
            };
            docs.insert(doc.clone(), stored.clone());
            stored
        };
        self.changes.publish(stored.clone());
        Ok(stored)
    }

    async fn run_transaction(
        &self,
        reads: &[DocRef],
        body: TxBody<'_>,
    ) -> Result<TxCommit, StoreError> {
        for attempt in 1..=MAX_TX_ATTEMPTS {
            let mut ctx = TxContext::new(self.snapshot(reads).await);
            body(&mut ctx)?;

            if let Some(commit) = self.try_commit(ctx).await {
                for doc in &commit.written {
                    self.changes.publish(doc.clone());
                }
                return Ok(commit);
            }
            debug!("Transaction conflict on attempt {}, retrying", attempt);
        }
        Err(StoreError::Conflict {
            attempts: MAX_TX_ATTEMPTS,
        })
    }

    async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, StoreError> {
        Ok(self.changes.subscribe(doc))
    }
}
