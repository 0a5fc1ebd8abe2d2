use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::database::{DocumentStore, StoreError};
use crate::entities::feed_item::{FeedItem, FeedKind, ReactionKind};

#[derive(Error, Debug)]
pub enum ReactionError {
    #[error("reacting requires a signed-in user")]
    Unauthenticated,

    #[error("item {0} not found")]
    ItemNotFound(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReactionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(doc) => ReactionError::ItemNotFound(doc.id),
            other => ReactionError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReactionOutcome {
    pub item_id: String,
    pub reactions: BTreeMap<ReactionKind, u64>,
    pub active: Option<ReactionKind>,
}

/// Make `kind` the user's only reaction on `item`, or clear it if it already
/// was. Returns the user's active reaction afterwards.
pub fn toggle_reaction(item: &mut FeedItem, user_id: &str, kind: ReactionKind) -> Option<ReactionKind> {
    let previous = item.user_reactions.remove(user_id);

    if let Some(previous) = previous {
        if let Some(count) = item.reactions.get_mut(&previous) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                item.reactions.remove(&previous);
            }
        }
    }

    if previous == Some(kind) {
        return None;
    }

    *item.reactions.entry(kind).or_insert(0) += 1;
    item.user_reactions.insert(user_id.to_string(), kind);
    Some(kind)
}

/// Transactionally apply [`toggle_reaction`] to a stored item.
///
/// Concurrent reactions from other users are serialized by the store's
/// transaction retry; nothing is retried here.
pub async fn set_reaction(
    store: &dyn DocumentStore,
    feed: FeedKind,
    item_id: &str,
    user_id: &str,
    kind: ReactionKind,
) -> Result<ReactionOutcome, ReactionError> {
    if user_id.is_empty() {
        return Err(ReactionError::Unauthenticated);
    }

    let doc = feed.item_ref(item_id);
    let reads = [doc.clone()];
    let commit = store
        .run_transaction(&reads, &|ctx| {
            let mut item: FeedItem = ctx
                .get_typed(&doc)?
                .ok_or_else(|| StoreError::NotFound(doc.clone()))?;
            toggle_reaction(&mut item, user_id, kind);
            ctx.set_typed(doc.clone(), &item)
        })
        .await?;

    let item: FeedItem = commit
        .document(&doc)
        .ok_or_else(|| StoreError::NotFound(doc.clone()))?
        .decode()?;
    let active = item.reaction_of(user_id);
    debug!("User {} reaction on {} is now {:?}", user_id, doc, active);

    Ok(ReactionOutcome {
        item_id: item.id,
        reactions: item.reactions,
        active,
    })
}
