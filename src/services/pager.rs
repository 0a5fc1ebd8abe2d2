//! Incremental "load more" accumulation per filter.
//!
//! A pager holds, for every filter key it has seen, the items fetched so far,
//! the cursor to resume from, and whether another page may exist. Loads for
//! one filter never overlap; a load that finishes after its filter was reset
//! is discarded instead of being merged into the fresh state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::database::feed::{ItemsPage, list_items};
use crate::database::{Cursor, DocumentStore, StoreError};
use crate::entities::feed_item::{FeedFilter, FeedItem, FeedKind};

pub const DEFAULT_PAGE_SIZE: usize = 5;

#[derive(Debug, Clone)]
struct FeedPageState {
    items: Vec<FeedItem>,
    seen: HashSet<String>,
    cursor: Option<Cursor>,
    has_more: bool,
    loading: bool,
    epoch: u64,
}

impl FeedPageState {
    fn fresh(epoch: u64) -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
            cursor: None,
            has_more: true,
            loading: false,
            epoch,
        }
    }

    /// Appends unseen items in arrival order; returns how many were new.
    fn absorb(&mut self, page: ItemsPage) -> usize {
        let before = self.items.len();
        for item in page.items {
            if self.seen.insert(item.id.clone()) {
                self.items.push(item);
            }
        }
        if page.cursor.is_some() {
            self.cursor = page.cursor;
        }
        self.has_more = page.has_more;
        self.items.len() - before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InFlight,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded { appended: usize, has_more: bool },
    Skipped { reason: SkipReason },
    /// The filter was reset while the page was in flight.
    Discarded,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageSnapshot {
    pub filter: String,
    pub items: Vec<FeedItem>,
    pub has_more: bool,
    pub loading: bool,
}

type Pages = Mutex<HashMap<FeedFilter, FeedPageState>>;

fn lock(pages: &Pages) -> MutexGuard<'_, HashMap<FeedFilter, FeedPageState>> {
    pages.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight flag if the load is abandoned, e.g. when the
/// request driving it is cancelled.
/// Disarmed once the load's outcome is applied, so it never touches a
/// newer load of the same epoch.
struct InFlight<'a> {
    pages: &'a Pages,
    filter: FeedFilter,
    epoch: u64,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(state) = lock(self.pages).get_mut(&self.filter) {
            if state.epoch == self.epoch {
                state.loading = false;
            }
        }
    }
}

pub struct FeedPager {
    store: Arc<dyn DocumentStore>,
    feed: FeedKind,
    page_size: usize,
    pages: Pages,
}

impl FeedPager {
    pub fn new(store: Arc<dyn DocumentStore>, feed: FeedKind, page_size: usize) -> Self {
        Self {
            store,
            feed,
            page_size: page_size.max(1),
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the next page for `filter` and append its unseen items.
    ///
    /// A no-op when a load for the same filter is already running or the
    /// filter is exhausted. On error the accumulated state is unchanged and
    /// the call can simply be repeated.
    pub async fn load_page(&self, filter: FeedFilter) -> Result<LoadOutcome, StoreError> {
        let (cursor, epoch) = {
            let mut pages = lock(&self.pages);
            let state = pages
                .entry(filter)
                .or_insert_with(|| FeedPageState::fresh(0));
            if state.loading {
                return Ok(LoadOutcome::Skipped {
                    reason: SkipReason::InFlight,
                });
            }
            if !state.has_more {
                return Ok(LoadOutcome::Skipped {
                    reason: SkipReason::Exhausted,
                });
            }
            state.loading = true;
            (state.cursor.clone(), state.epoch)
        };
        let mut in_flight = InFlight {
            pages: &self.pages,
            filter,
            epoch,
            armed: true,
        };

        let result = list_items(self.store.as_ref(), self.feed, filter, cursor, self.page_size).await;

        let mut pages = lock(&self.pages);
        let Some(state) = pages.get_mut(&filter).filter(|s| s.epoch == epoch) else {
            debug!("Dropping stale {} page for filter {}", self.feed.collection(), filter);
            return Ok(LoadOutcome::Discarded);
        };
        state.loading = false;
        in_flight.armed = false;

        let page = result.inspect_err(|err| {
            warn!("Loading {} page for filter {} failed: {}", self.feed.collection(), filter, err);
        })?;
        let appended = state.absorb(page);
        Ok(LoadOutcome::Loaded {
            appended,
            has_more: state.has_more,
        })
    }

    /// Forget everything loaded for `filter`. Other filters are untouched.
    pub fn reset(&self, filter: FeedFilter) {
        let mut pages = lock(&self.pages);
        let epoch = pages.get(&filter).map_or(0, |s| s.epoch + 1);
        pages.insert(filter, FeedPageState::fresh(epoch));
    }

    pub fn snapshot(&self, filter: FeedFilter) -> PageSnapshot {
        let pages = lock(&self.pages);
        match pages.get(&filter) {
            Some(state) => PageSnapshot {
                filter: filter.to_string(),
                items: state.items.clone(),
                has_more: state.has_more,
                loading: state.loading,
            },
            None => PageSnapshot {
                filter: filter.to_string(),
                items: Vec::new(),
                has_more: true,
                loading: false,
            },
        }
    }

    #[cfg(test)]
    pub fn items(&self, filter: FeedFilter) -> Vec<FeedItem> {
        lock(&self.pages)
            .get(&filter)
            .map(|s| s.items.clone())
            .unwrap_or_default()
    }
}

/// One pager per (session, feed), dropped after sitting idle.
pub struct PagerRegistry {
    store: Arc<dyn DocumentStore>,
    page_size: usize,
    idle: Duration,
    pagers: Mutex<HashMap<(String, FeedKind), (Arc<FeedPager>, Instant)>>,
}

impl PagerRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, page_size: usize, idle: Duration) -> Self {
        Self {
            store,
            page_size,
            idle,
            pagers: Mutex::new(HashMap::new()),
        }
    }

    pub fn pager(&self, session_id: &str, feed: FeedKind) -> Arc<FeedPager> {
        let now = Instant::now();
        let mut pagers = self.pagers.lock().unwrap_or_else(PoisonError::into_inner);
        pagers.retain(|_, (_, last_used)| now.duration_since(*last_used) < self.idle);

        let (pager, last_used) = pagers
            .entry((session_id.to_string(), feed))
            .or_insert_with(|| {
                (
                    Arc::new(FeedPager::new(self.store.clone(), feed, self.page_size)),
                    now,
                )
            });
        *last_used = now;
        pager.clone()
    }

    /// After `session_id` creates `item`, reset every filter that would show
    /// it so the next load starts from the top.
    pub fn reset_covering(&self, session_id: &str, feed: FeedKind, item: &FeedItem) {
        let pager = {
            let pagers = self.pagers.lock().unwrap_or_else(PoisonError::into_inner);
            pagers
                .get(&(session_id.to_string(), feed))
                .map(|(pager, _)| pager.clone())
        };
        if let Some(pager) = pager {
            for filter in FeedFilter::covering(item) {
                pager.reset(filter);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pagers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
