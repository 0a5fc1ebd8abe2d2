use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Pool, Transaction};
use fred::clients::{Client as RedisClient, SubscriberClient};
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use fred::prelude::{Builder, Config as RedisConfig};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;
use tracing::{debug, info, warn};

use super::changes::ChangeFeed;
use super::conn::LazyConn;
use super::{
    DocRef, Document, DocumentStore, MAX_TX_ATTEMPTS, Query, QueryPage, StoreError, Subscription,
    TxBody, TxCommit, TxContext, TxWrite,
};

pub static SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        doc_id     TEXT NOT NULL,
        data       JSONB NOT NULL,
        version    BIGINT NOT NULL DEFAULT 1,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (collection, doc_id)
    );
    CREATE INDEX IF NOT EXISTS documents_created_at_idx
        ON documents (collection, (data -> 'created_at') DESC, doc_id DESC);
";

static SELECT_SQL: &str = "
    SELECT doc_id, data, version
    FROM documents
    WHERE collection = $1 AND doc_id = $2
";

static UPDATE_SQL: &str = "
    UPDATE documents
    SET data = $3, version = version + 1, updated_at = now()
    WHERE collection = $1 AND doc_id = $2 AND version = $4
    RETURNING version
";

static INSERT_SQL: &str = "
    INSERT INTO documents (collection, doc_id, data, version)
    VALUES ($1, $2, $3, 1)
    ON CONFLICT DO NOTHING
    RETURNING version
";

static UPSERT_SQL: &str = "
    INSERT INTO documents (collection, doc_id, data, version)
    VALUES ($1, $2, $3, 1)
    ON CONFLICT (collection, doc_id)
    DO UPDATE SET data = EXCLUDED.data,
                  version = documents.version + 1,
                  updated_at = now()
    RETURNING version
";

static CHANNEL_PATTERN: &str = "doc:*";

fn channel_for(doc: &Document) -> String {
    format!("doc:{}:{}", doc.collection, doc.id)
}

/// Private function to get a Document from a row of
/// `doc_id, data, version`
fn row_to_document(collection: &str, row: &Row) -> Result<Document, StoreError> {
    let version: i64 = row.try_get("version")?;
    Ok(Document {
        collection: collection.to_string(),
        id: row.try_get("doc_id")?,
        data: row.try_get("data")?,
        version: version.max(0) as u64,
    })
}

type SqlParams = Vec<Box<dyn ToSql + Sync + Send>>;

/// SQL and positional parameters for a [`Query`]. `$2` is always the
/// order field, so the cursor comparison can reuse it.
fn build_query(query: &Query) -> (String, SqlParams) {
    let mut params: SqlParams = vec![
        Box::new(query.collection.clone()),
        Box::new(query.order_by.field.clone()),
    ];
    let mut where_clauses = vec!["collection = $1".to_string()];

    for filter in &query.filters {
        params.push(Box::new(filter.field.clone()));
        params.push(Box::new(filter.value.clone()));
        where_clauses.push(format!(
            "data -> ${}::text = ${}::jsonb",
            params.len() - 1,
            params.len()
        ));
    }

    let direction = if query.order_by.descending { "DESC" } else { "ASC" };
    if let Some(cursor) = &query.cursor {
        params.push(Box::new(cursor.sort_key.clone()));
        params.push(Box::new(cursor.id.clone()));
        let op = if query.order_by.descending { "<" } else { ">" };
        where_clauses.push(format!(
            "(data -> $2::text, doc_id) {} (${}::jsonb, ${}::text)",
            op,
            params.len() - 1,
            params.len()
        ));
    }

    params.push(Box::new(query.limit as i64));
    let sql = format!(
        "SELECT doc_id, data, version FROM documents
         WHERE {}
         ORDER BY data -> $2::text {}, doc_id {}
         LIMIT ${}",
        where_clauses.join(" AND "),
        direction,
        direction,
        params.len()
    );
    (sql, params)
}

/// jsonb documents in one table, optimistic versioning per row, and Redis
/// pub/sub so every instance sees every commit.
pub struct PgStore {
    pool: Arc<Pool>,
    changes: ChangeFeed,
    publisher: Option<RedisClient>,
}

impl PgStore {
    pub async fn connect(pool: Arc<Pool>, pubsub_url: Option<&str>) -> Result<Self, StoreError> {
        let mut conn = LazyConn::new(pool.clone());
        conn.get_client().await?.batch_execute(SCHEMA_SQL).await?;

        let changes = ChangeFeed::default();
        let publisher = match pubsub_url {
            Some(url) => Some(Self::start_pubsub(url, changes.clone()).await?),
            None => {
                info!("No pub/sub configured, change notifications stay in-process");
                None
            }
        };

        Ok(Self {
            pool,
            changes,
            publisher,
        })
    }

    async fn start_pubsub(url: &str, changes: ChangeFeed) -> Result<RedisClient, StoreError> {
        let config = RedisConfig::from_url(url)?;
        let publisher = Builder::from_config(config.clone()).build()?;
        let subscriber: SubscriberClient = Builder::from_config(config).build_subscriber_client()?;

        publisher.init().await?;
        subscriber.init().await?;

        let mut messages = subscriber.message_rx();
        subscriber.psubscribe(CHANNEL_PATTERN).await?;

        tokio::spawn(async move {
            // Keeps the subscriber connection alive for the task's lifetime.
            let _subscriber = subscriber;
            loop {
                let message = match messages.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Pub/sub listener lagged, skipped {} messages", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(payload) = message.value.as_str() else {
                    warn!("Non-text pub/sub payload on {}", message.channel);
                    continue;
                };
                match serde_json::from_str::<Document>(&payload) {
                    Ok(doc) => changes.publish(doc),
                    Err(err) => warn!("Malformed change on {}: {}", message.channel, err),
                }
            }
            info!("Pub/sub listener stopped");
        });

        Ok(publisher)
    }

    async fn fetch(
        tx: &Transaction<'_>,
        doc: &DocRef,
    ) -> Result<Option<Document>, StoreError> {
        let row = tx.query_opt(SELECT_SQL, &[&doc.collection, &doc.id]).await?;
        row.map(|row| row_to_document(&doc.collection, &row))
            .transpose()
    }

    /// Applies the buffered writes of `ctx`, checking each touched row still
    /// has the version the body read. `None` means a concurrent writer won.
    async fn apply(
        tx: &Transaction<'_>,
        ctx: TxContext,
    ) -> Result<Option<TxCommit>, StoreError> {
        let mut expected: HashMap<DocRef, Option<u64>> = ctx
            .read_versions()
            .map(|(doc, version)| (doc.clone(), version))
            .collect();
        let writes = ctx.into_writes();

        // Reads that are not written still have to be current.
        for (doc, version) in &expected {
            if writes.iter().any(|w| w.doc_ref() == doc) {
                continue;
            }
            let row = tx
                .query_opt(
                    "SELECT version FROM documents
                     WHERE collection = $1 AND doc_id = $2 FOR SHARE",
                    &[&doc.collection, &doc.id],
                )
                .await?;
            let current = match row {
                Some(row) => Some(row.try_get::<_, i64>("version")?.max(0) as u64),
                None => None,
            };
            if current != *version {
                return Ok(None);
            }
        }

        let mut commit = TxCommit::default();
        for write in writes {
            match write {
                TxWrite::Set { doc, data } => {
                    let row = match expected.get(&doc).copied() {
                        Some(Some(version)) => {
                            let version = version as i64;
                            tx.query_opt(UPDATE_SQL, &[&doc.collection, &doc.id, &data, &version])
                                .await?
                        }
                        Some(None) => {
                            tx.query_opt(INSERT_SQL, &[&doc.collection, &doc.id, &data])
                                .await?
                        }
                        None => {
                            tx.query_opt(UPSERT_SQL, &[&doc.collection, &doc.id, &data])
                                .await?
                        }
                    };
                    let Some(row) = row else {
                        return Ok(None);
                    };
                    let version = row.try_get::<_, i64>("version")?.max(0) as u64;
                    expected.insert(doc.clone(), Some(version));
                    commit.written.push(Document {
                        collection: doc.collection,
                        id: doc.id,
                        data,
                        version,
                    });
                }
                TxWrite::Delete(doc) => {
                    let deleted = match expected.get(&doc).copied() {
                        Some(Some(version)) => {
                            let version = version as i64;
                            let n = tx
                                .execute(
                                    "DELETE FROM documents
                                     WHERE collection = $1 AND doc_id = $2 AND version = $3",
                                    &[&doc.collection, &doc.id, &version],
                                )
                                .await?;
                            if n == 0 {
                                return Ok(None);
                            }
                            true
                        }
                        _ => {
                            tx.execute(
                                "DELETE FROM documents WHERE collection = $1 AND doc_id = $2",
                                &[&doc.collection, &doc.id],
                            )
                            .await?
                                > 0
                        }
                    };
                    expected.insert(doc.clone(), None);
                    if deleted {
                        commit.deleted.push(doc);
                    }
                }
            }
        }
        Ok(Some(commit))
    }

    async fn announce(&self, docs: &[Document]) {
        let Some(publisher) = &self.publisher else {
            for doc in docs {
                self.changes.publish(doc.clone());
            }
            return;
        };

        for doc in docs {
            let payload = match serde_json::to_string(doc) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("Could not encode change for {}: {}", doc.doc_ref(), err);
                    continue;
                }
            };
            if let Err(err) = publisher
                .publish::<(), _, _>(channel_for(doc), payload)
                .await
            {
                // The commit stands; subscribers catch up on the next change.
                warn!("Failed to publish change for {}: {}", doc.doc_ref(), err);
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        let mut conn = LazyConn::new(self.pool.clone());
        let db = conn.get_client().await?;
        let row = db.query_opt(SELECT_SQL, &[&doc.collection, &doc.id]).await?;
        row.map(|row| row_to_document(&doc.collection, &row))
            .transpose()
    }

    async fn query(&self, query: &Query) -> Result<QueryPage, StoreError> {
        let (sql, params) = build_query(query);
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let mut conn = LazyConn::new(self.pool.clone());
        let db = conn.get_client().await?;
        let rows = db.query(sql.as_str(), &refs).await?;

        let documents = rows
            .iter()
            .map(|row| row_to_document(&query.collection, row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryPage {
            raw_count: rows.len(),
            documents,
        })
    }

    async fn create(&self, doc: &DocRef, data: Value) -> Result<Document, StoreError> {
        let mut conn = LazyConn::new(self.pool.clone());
        let db = conn.get_client().await?;
        let row = db
            .query_opt(INSERT_SQL, &[&doc.collection, &doc.id, &data])
            .await?
            .ok_or_else(|| StoreError::AlreadyExists(doc.clone()))?;

        let stored = Document {
            collection: doc.collection.clone(),
            id: doc.id.clone(),
            data,
            version: row.try_get::<_, i64>("version")?.max(0) as u64,
        };
        self.announce(std::slice::from_ref(&stored)).await;
        Ok(stored)
    }

    async fn run_transaction(
        &self,
        reads: &[DocRef],
        body: TxBody<'_>,
    ) -> Result<TxCommit, StoreError> {
        let mut conn = LazyConn::new(self.pool.clone());

        for attempt in 1..=MAX_TX_ATTEMPTS {
            let tx = conn.transaction().await?;

            let mut snapshot = HashMap::with_capacity(reads.len());
            for doc in reads {
                snapshot.insert(doc.clone(), Self::fetch(&tx, doc).await?);
            }

            let mut ctx = TxContext::new(snapshot);
            // An error from the body drops `tx`, which rolls it back.
            body(&mut ctx)?;

            match Self::apply(&tx, ctx).await? {
                Some(commit) => {
                    tx.commit().await?;
                    self.announce(&commit.written).await;
                    return Ok(commit);
                }
                None => {
                    tx.rollback().await?;
                    debug!("Transaction conflict on attempt {}, retrying", attempt);
                }
            }
        }

        Err(StoreError::Conflict {
            attempts: MAX_TX_ATTEMPTS,
        })
    }

    async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, StoreError> {
        Ok(self.changes.subscribe(doc))
    }
}
