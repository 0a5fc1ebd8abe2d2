//! Contention-free tallies.
//!
//! Instead of incrementing a hot field on the item, every change appends a
//! `+1`/`-1` shard under the item. A background aggregator folds the shards
//! into the item's `support_count`; until it does, readers see the previous
//! total.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::database::feed::get_item;
use crate::database::{DocRef, Document, DocumentStore, Query, StoreError};
use crate::entities::feed_item::FeedKind;
use crate::entities::shard::{CounterShard, Delta, SupportRecord};

pub const SHARDS: &str = "shards";
pub const SUPPORTERS: &str = "supporters";
const BASE_FIELD: &str = "support_base";
const COUNT_FIELD: &str = "support_count";
const FOLD_PAGE: usize = 500;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Appends shards and tells the aggregator which entities changed.
#[derive(Clone)]
pub struct ShardWriter {
    store: Arc<dyn DocumentStore>,
    folds: Option<mpsc::UnboundedSender<DocRef>>,
}

impl ShardWriter {
    pub fn new(store: Arc<dyn DocumentStore>, folds: Option<mpsc::UnboundedSender<DocRef>>) -> Self {
        Self { store, folds }
    }

    /// Append one immutable shard for `entity`. Never reads the aggregate.
    pub async fn record_delta(&self, entity: &DocRef, delta: Delta) -> Result<Document, StoreError> {
        let shard = CounterShard {
            delta,
            created_at: now_ms(),
        };
        let doc = self
            .store
            .add_doc(&entity.subcollection(SHARDS), serde_json::to_value(&shard)?)
            .await?;

        if let Some(folds) = &self.folds {
            if folds.send(entity.clone()).is_err() {
                warn!("Aggregator stopped; {} will be folded on a later change", entity);
            }
        }
        Ok(doc)
    }
}

/// Folds shards into the displayed total.
#[derive(Clone)]
pub struct CounterAggregator {
    store: Arc<dyn DocumentStore>,
}

impl CounterAggregator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn shard_sum(&self, entity: &DocRef) -> Result<i64, StoreError> {
        let mut sum = 0i64;
        let mut cursor = None;
        loop {
            let query = Query::new(entity.subcollection(SHARDS))
                .order_by("created_at", false)
                .start_after(cursor)
                .limit(FOLD_PAGE);
            let page = self.store.query(&query).await?;
            for doc in &page.documents {
                sum += doc.decode::<CounterShard>()?.delta.value();
            }
            if page.raw_count < FOLD_PAGE {
                return Ok(sum);
            }
            cursor = page.next_cursor("created_at");
        }
    }

    /// Recompute `support_count = max(0, support_base + sum(shards))`.
    /// Returns the new total, or `None` when it was already current.
    pub async fn fold(&self, entity: &DocRef) -> Result<Option<u64>, StoreError> {
        let sum = self.shard_sum(entity).await?;
        let reads = [entity.clone()];

        let commit = self
            .store
            .run_transaction(&reads, &|ctx| {
                let doc = ctx
                    .get(entity)?
                    .ok_or_else(|| StoreError::NotFound(entity.clone()))?;
                let base = doc.field(BASE_FIELD).as_u64().unwrap_or(0);
                let total = (base as i64 + sum).max(0) as u64;
                if doc.field(COUNT_FIELD).as_u64() == Some(total) {
                    return Ok(());
                }

                let mut data = doc.data.clone();
                if let Some(fields) = data.as_object_mut() {
                    fields.insert(COUNT_FIELD.to_string(), Value::from(total));
                }
                ctx.set(entity.clone(), data);
                Ok(())
            })
            .await?;

        Ok(commit
            .document(entity)
            .and_then(|doc| doc.field(COUNT_FIELD).as_u64()))
    }

    /// Fold every entity announced on `rx` until all writers are gone.
    /// Bursts of changes to one entity collapse into a single fold.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<DocRef>) {
        info!("Counter aggregator started");
        while let Some(first) = rx.recv().await {
            let mut pending = BTreeSet::from([first]);
            while let Ok(more) = rx.try_recv() {
                pending.insert(more);
            }

            for entity in pending {
                match self.fold(&entity).await {
                    Ok(Some(total)) => debug!("Folded {} to {}", entity, total),
                    Ok(None) => {}
                    Err(StoreError::NotFound(_)) => debug!("Skipping fold of deleted {}", entity),
                    Err(err) => error!("Folding {} failed: {}", entity, err),
                }
            }
        }
        info!("Counter aggregator stopped");
    }
}

#[derive(Error, Debug)]
pub enum SupportError {
    #[error("supporting requires a signed-in user")]
    Unauthenticated,

    #[error("item {0} not found")]
    ItemNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportState {
    pub item_id: String,
    pub supported: bool,
    /// Last folded total; may trail a toggle that just happened.
    pub support_count: u64,
}

async fn existing_item(
    store: &dyn DocumentStore,
    feed: FeedKind,
    item_id: &str,
) -> Result<u64, SupportError> {
    get_item(store, feed, item_id)
        .await?
        .map(|item| item.support_count)
        .ok_or_else(|| SupportError::ItemNotFound(item_id.to_string()))
}

/// Flip the presence of `record` and report whether it exists afterwards.
async fn flip_record(
    store: &dyn DocumentStore,
    record: &DocRef,
    user_id: &str,
) -> Result<bool, StoreError> {
    let created = SupportRecord {
        user_id: user_id.to_string(),
        created_at: now_ms(),
    };
    let reads = [record.clone()];
    let commit = store
        .run_transaction(&reads, &|ctx| {
            if ctx.get(record)?.is_some() {
                ctx.delete(record.clone());
                Ok(())
            } else {
                ctx.set_typed(record.clone(), &created)
            }
        })
        .await?;
    Ok(commit.document(record).is_some())
}

/// The "pray" button. The per-user record is the source of truth for the
/// button state; the shard keeps the public tally in step with it.
pub async fn toggle_support(
    store: &dyn DocumentStore,
    shards: &ShardWriter,
    feed: FeedKind,
    item_id: &str,
    user_id: &str,
) -> Result<SupportState, SupportError> {
    if user_id.is_empty() {
        return Err(SupportError::Unauthenticated);
    }
    let support_count = existing_item(store, feed, item_id).await?;

    let item = feed.item_ref(item_id);
    let record = item.child(SUPPORTERS, user_id);
    let supported = flip_record(store, &record, user_id).await?;
    let delta = if supported {
        Delta::Increment
    } else {
        Delta::Decrement
    };

    if let Err(err) = shards.record_delta(&item, delta).await {
        warn!("Recording {:?} for {} failed, reverting support: {}", delta, item, err);
        if let Err(revert_err) = flip_record(store, &record, user_id).await {
            error!("Could not revert support record {}: {}", record, revert_err);
        }
        return Err(err.into());
    }

    Ok(SupportState {
        item_id: item_id.to_string(),
        supported,
        support_count,
    })
}

pub async fn support_state(
    store: &dyn DocumentStore,
    feed: FeedKind,
    item_id: &str,
    user_id: &str,
) -> Result<SupportState, SupportError> {
    if user_id.is_empty() {
        return Err(SupportError::Unauthenticated);
    }
    let support_count = existing_item(store, feed, item_id).await?;
    let record = feed.item_ref(item_id).child(SUPPORTERS, user_id);
    Ok(SupportState {
        item_id: item_id.to_string(),
        supported: store.get(&record).await?.is_some(),
        support_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::feed::{NewItem, insert_item};
    use crate::database::testing::FlakyStore;
    use crate::entities::user::{AuthorSummary, DisplayHint};
    use std::time::Duration;

    async fn wall_item(store: &FlakyStore) -> String {
        insert_item(
            &store.inner,
            FeedKind::Wall,
            NewItem {
                author: AuthorSummary {
                    user_id: "author".to_string(),
                    display_name: "Naomi".to_string(),
                    avatar_url: None,
                    display: DisplayHint::Anonymous,
                },
                body: "Please pray for my mother".to_string(),
                category: None,
                post_type: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    fn setup() -> (Arc<FlakyStore>, ShardWriter, CounterAggregator) {
        let store = Arc::new(FlakyStore::new());
        let writer = ShardWriter::new(store.clone(), None);
        let aggregator = CounterAggregator::new(store.clone());
        (store, writer, aggregator)
    }

    #[tokio::test]
    async fn record_delta_only_appends() {
        let (store, writer, aggregator) = setup();
        let id = wall_item(&store).await;
        let item = FeedKind::Wall.item_ref(&id);

        writer.record_delta(&item, Delta::Increment).await.unwrap();
        writer.record_delta(&item, Delta::Increment).await.unwrap();
        writer.record_delta(&item, Delta::Decrement).await.unwrap();

        let stored = store.get(&item).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(aggregator.shard_sum(&item).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fold_adds_base_and_never_goes_negative() {
        let (store, writer, aggregator) = setup();
        let id = wall_item(&store).await;
        let item = FeedKind::Wall.item_ref(&id);

        writer.record_delta(&item, Delta::Increment).await.unwrap();
        assert_eq!(aggregator.fold(&item).await.unwrap(), Some(1));
        assert_eq!(aggregator.fold(&item).await.unwrap(), None);

        writer.record_delta(&item, Delta::Decrement).await.unwrap();
        writer.record_delta(&item, Delta::Decrement).await.unwrap();
        assert_eq!(aggregator.fold(&item).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn toggling_twice_returns_to_the_base_count() {
        let (store, writer, aggregator) = setup();
        let id = wall_item(&store).await;
        let item = FeedKind::Wall.item_ref(&id);

        let on = toggle_support(store.as_ref(), &writer, FeedKind::Wall, &id, "userA")
            .await
            .unwrap();
        assert!(on.supported);
        assert_eq!(on.support_count, 0);
        assert_eq!(aggregator.fold(&item).await.unwrap(), Some(1));

        let state = support_state(store.as_ref(), FeedKind::Wall, &id, "userA").await.unwrap();
        assert!(state.supported);
        assert_eq!(state.support_count, 1);

        let off = toggle_support(store.as_ref(), &writer, FeedKind::Wall, &id, "userA")
            .await
            .unwrap();
        assert!(!off.supported);
        assert_eq!(aggregator.fold(&item).await.unwrap(), Some(0));
        assert_eq!(aggregator.shard_sum(&item).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_shard_append_reverts_the_record() {
        let (store, writer, _) = setup();
        let id = wall_item(&store).await;

        store.fail_creates(true);
        let err = toggle_support(store.as_ref(), &writer, FeedKind::Wall, &id, "userA").await;
        assert!(matches!(err, Err(SupportError::Store(_))));
        store.fail_creates(false);

        let state = support_state(store.as_ref(), FeedKind::Wall, &id, "userA").await.unwrap();
        assert!(!state.supported);
    }

    #[tokio::test]
    async fn support_requires_user_and_item() {
        let (store, writer, _) = setup();
        assert!(matches!(
            toggle_support(store.as_ref(), &writer, FeedKind::Wall, "1", "").await,
            Err(SupportError::Unauthenticated)
        ));
        assert!(matches!(
            toggle_support(store.as_ref(), &writer, FeedKind::Wall, "404", "userA").await,
            Err(SupportError::ItemNotFound(id)) if id == "404"
        ));
    }

    #[tokio::test]
    async fn aggregator_task_publishes_new_total() {
        let store = Arc::new(FlakyStore::new());
        let id = wall_item(&store).await;
        let item = FeedKind::Wall.item_ref(&id);

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = ShardWriter::new(store.clone(), Some(tx));
        tokio::spawn(CounterAggregator::new(store.clone()).run(rx));

        let mut live = store.subscribe(&item).await.unwrap();
        toggle_support(store.as_ref(), &writer, FeedKind::Wall, &id, "userA")
            .await
            .unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), live.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changed.field("support_count"), &Value::from(1u64));
    }
}
