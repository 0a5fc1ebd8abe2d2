//! Store wrappers for exercising failure and timing paths in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::memory::MemoryStore;
use super::{
    DocRef, Document, DocumentStore, Query, QueryPage, StoreError, Subscription, TxBody, TxCommit,
};

/// Wraps a [`MemoryStore`] and can fail, replay, or hold queries.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_queries: AtomicBool,
    fail_creates: AtomicBool,
    replay_previous: AtomicBool,
    last_page_tail: std::sync::Mutex<Option<Document>>,
    gate: std::sync::Mutex<Option<Arc<Semaphore>>>,
    pub queries: AtomicUsize,
    running: AtomicUsize,
    /// Highest number of queries seen running at the same time.
    pub max_running: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// When a query resumes from the last document of the previous page,
    /// that document is returned again at the head of the page, the way a
    /// replaying backend would.
    pub fn replay_previous(&self, replay: bool) {
        self.replay_previous.store(replay, Ordering::SeqCst);
    }

    /// Queries block until a permit is added to the returned semaphore.
    pub fn hold_queries(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release_queries(&self) {
        *self.gate.lock().unwrap() = None;
    }

    async fn run_query(&self, query: &Query) -> Result<QueryPage, StoreError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict { attempts: 0 });
        }

        let mut page = self.inner.query(query).await?;
        if self.replay_previous.load(Ordering::SeqCst) {
            let previous = self.last_page_tail.lock().unwrap().clone();
            let resumes_from_previous = matches!(
                (&previous, &query.cursor),
                (Some(prev), Some(cursor)) if prev.id == cursor.id
            );
            if let (true, Some(previous)) = (resumes_from_previous, previous) {
                page.documents.insert(0, previous);
                page.documents.truncate(query.limit);
                page.raw_count = page.documents.len();
            }
        }
        *self.last_page_tail.lock().unwrap() = page.documents.last().cloned();
        Ok(page)
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        self.inner.get(doc).await
    }

    async fn query(&self, query: &Query) -> Result<QueryPage, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let result = self.run_query(query).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn create(&self, doc: &DocRef, data: Value) -> Result<Document, StoreError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StoreError::AlreadyExists(doc.clone()));
        }
        self.inner.create(doc, data).await
    }

    async fn run_transaction(
        &self,
        reads: &[DocRef],
        body: TxBody<'_>,
    ) -> Result<TxCommit, StoreError> {
        self.inner.run_transaction(reads, body).await
    }

    async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, StoreError> {
        self.inner.subscribe(doc).await
    }
}
