use serde::Serialize;

use crate::{
    database::{Cursor, Document, DocumentStore, Query, StoreError},
    entities::{
        feed_item::{Category, FeedFilter, FeedItem, FeedKind, PostType},
        user::AuthorSummary,
    },
    utils::{snowflake::SnowflakeGenerator, thread_state::generate_id},
};

pub const ORDER_FIELD: &str = "created_at";

/// Private function to get FeedItem entity from a stored document
fn doc_to_item(doc: &Document) -> Result<FeedItem, StoreError> {
    let mut item: FeedItem = doc.decode()?;
    // The document id is authoritative over whatever the payload says.
    item.id = doc.id.clone();
    Ok(item)
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub author: AuthorSummary,
    pub body: String,
    pub category: Option<Category>,
    pub post_type: Option<PostType>,
}

/// One store page of items plus what is needed to fetch the next one.
#[derive(Debug, Clone, Serialize)]
pub struct ItemsPage {
    pub items: Vec<FeedItem>,
    pub cursor: Option<Cursor>,
    pub has_more: bool,
}

pub fn page_query(
    feed: FeedKind,
    filter: FeedFilter,
    cursor: Option<Cursor>,
    limit: usize,
) -> Query {
    let query = Query::new(feed.collection())
        .order_by(ORDER_FIELD, true)
        .start_after(cursor)
        .limit(limit);
    match filter.constraint() {
        Some((field, value)) => query.filter(field, value),
        None => query,
    }
}

/// Fetch one page, newest first.
/// A short page means the filter is exhausted.
pub async fn list_items(
    store: &dyn DocumentStore,
    feed: FeedKind,
    filter: FeedFilter,
    cursor: Option<Cursor>,
    limit: usize,
) -> Result<ItemsPage, StoreError> {
    let page = store
        .query(&page_query(feed, filter, cursor, limit))
        .await?;
    let items = page
        .documents
        .iter()
        .map(doc_to_item)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ItemsPage {
        cursor: page.next_cursor(ORDER_FIELD),
        has_more: page.raw_count == limit,
        items,
    })
}

pub async fn get_item(
    store: &dyn DocumentStore,
    feed: FeedKind,
    item_id: &str,
) -> Result<Option<FeedItem>, StoreError> {
    store
        .get(&feed.item_ref(item_id))
        .await?
        .as_ref()
        .map(doc_to_item)
        .transpose()
}

/// Insert a new item; its timestamp comes from the generated id.
pub async fn insert_item(
    store: &dyn DocumentStore,
    feed: FeedKind,
    new: NewItem,
) -> Result<FeedItem, StoreError> {
    let id = generate_id();
    let item = FeedItem {
        id: id.to_string(),
        author: new.author,
        body: new.body,
        created_at: SnowflakeGenerator::parse(id).timestamp_ms as i64,
        category: new.category,
        post_type: new.post_type,
        reactions: Default::default(),
        user_reactions: Default::default(),
        support_base: 0,
        support_count: 0,
    };

    let doc = store
        .create(&feed.item_ref(&item.id), serde_json::to_value(&item)?)
        .await?;
    doc_to_item(&doc)
}
