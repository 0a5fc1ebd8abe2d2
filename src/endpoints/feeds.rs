use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};

use crate::{
    database::Cursor,
    endpoints::{parse_feed, parse_filter, present},
    entities::feed_item::PublicFeedItem,
    extractors::auth::AuthSession,
    utils::{
        response::{ApiResponse, AppError, FuncError, response},
        state::ArcAppState,
    },
};

const MAX_PAGE_LIMIT: usize = 50;

mod list_items {
    use crate::database::feed::list_items;

    use super::*;

    #[derive(Debug, Deserialize)]
    pub struct Params {
        pub filter: Option<String>,
        pub cursor: Option<String>,
        pub limit: Option<usize>,
    }

    #[derive(Debug, Serialize)]
    pub struct Returns {
        pub items: Vec<PublicFeedItem>,
        pub cursor: Option<Cursor>,
        pub has_more: bool,
    }

    // One stateless page; clients pass `cursor` back to continue
    pub async fn handler(
        viewer: Option<AuthSession>,
        State(state): State<ArcAppState>,
        Path(feed): Path<String>,
        Query(params): Query<Params>,
    ) -> Result<ApiResponse<Returns>, AppError> {
        let feed = parse_feed(&feed)?;
        let filter = parse_filter(params.filter.as_deref())?;
        let cursor = params
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()?;
        let limit = params
            .limit
            .unwrap_or(state.config.page_size)
            .clamp(1, MAX_PAGE_LIMIT);

        let page = list_items(state.store.as_ref(), feed, filter, cursor, limit).await?;
        let viewer = viewer.as_ref().map(|s| s.user_id.as_str());

        Ok(response(
            Returns {
                items: page
                    .items
                    .iter()
                    .map(|item| present(item, viewer, &state))
                    .collect(),
                cursor: page.cursor,
                has_more: page.has_more,
            },
            StatusCode::OK,
        ))
    }
}

mod create_item {
    use tracing::warn;
    use validator::Validate;

    use super::*;
    use crate::{
        database::feed::{NewItem, insert_item},
        entities::{
            feed_item::{Category, PostType},
            user::{AuthorSummary, DisplayHint},
        },
        utils::validate::ValidatedJson,
    };

    #[derive(Debug, Deserialize, Validate)]
    pub struct Payload {
        #[validate(length(min = 1, max = 5000))]
        pub body: String,
        #[validate(length(min = 1, max = 64))]
        pub display_name: String,
        #[validate(length(max = 512))]
        pub avatar_url: Option<String>,
        #[serde(default)]
        pub anonymous: bool,
        pub category: Option<Category>,
        pub post_type: Option<PostType>,
    }

    pub async fn handler(
        session: AuthSession,
        State(state): State<ArcAppState>,
        Path(feed): Path<String>,
        ValidatedJson(payload): ValidatedJson<Payload>,
    ) -> Result<ApiResponse<PublicFeedItem>, AppError> {
        let feed = parse_feed(&feed)?;

        let mut category = payload.category;
        if category.is_none() {
            if let Some(text) = &state.text {
                // Uncategorized posts are still accepted
                category = match text.classify(&payload.body).await {
                    Ok(found) => Some(found),
                    Err(err) => {
                        warn!("Classification failed, storing uncategorized: {}", err);
                        None
                    }
                };
            }
        }

        let item = insert_item(
            state.store.as_ref(),
            feed,
            NewItem {
                author: AuthorSummary {
                    user_id: session.user_id.clone(),
                    display_name: payload.display_name,
                    avatar_url: payload.avatar_url,
                    display: if payload.anonymous {
                        DisplayHint::Anonymous
                    } else {
                        DisplayHint::Named
                    },
                },
                body: payload.body,
                category,
                post_type: payload.post_type,
            },
        )
        .await?;

        state
            .pagers
            .reset_covering(&session.session_id, feed, &item);

        Ok(response(
            present(&item, Some(&session.user_id), &state),
            StatusCode::CREATED,
        ))
    }
}

mod get_item {
    use crate::database::feed::get_item;

    use super::*;

    pub async fn handler(
        viewer: Option<AuthSession>,
        State(state): State<ArcAppState>,
        Path((feed, item_id)): Path<(String, String)>,
    ) -> Result<ApiResponse<PublicFeedItem>, AppError> {
        let feed = parse_feed(&feed)?;
        let item = get_item(state.store.as_ref(), feed, &item_id)
            .await?
            .ok_or(FuncError::ItemNotFound)?;
        let viewer = viewer.as_ref().map(|s| s.user_id.as_str());

        Ok(response(present(&item, viewer, &state), StatusCode::OK))
    }
}

mod react {
    use validator::Validate;

    use super::*;
    use crate::{
        entities::feed_item::ReactionKind,
        services::reactions::{ReactionOutcome, set_reaction},
        utils::validate::ValidatedJson,
    };

    #[derive(Debug, Deserialize, Validate)]
    pub struct Payload {
        pub kind: ReactionKind,
    }

    // Same kind twice clears the reaction
    pub async fn handler(
        session: AuthSession,
        State(state): State<ArcAppState>,
        Path((feed, item_id)): Path<(String, String)>,
        ValidatedJson(payload): ValidatedJson<Payload>,
    ) -> Result<ApiResponse<ReactionOutcome>, AppError> {
        let feed = parse_feed(&feed)?;
        let outcome = set_reaction(
            state.store.as_ref(),
            feed,
            &item_id,
            &session.user_id,
            payload.kind,
        )
        .await?;
        Ok(response(outcome, StatusCode::OK))
    }
}

mod support {
    use super::*;
    use crate::services::counters::{SupportState, support_state, toggle_support};

    pub async fn get_handler(
        session: AuthSession,
        State(state): State<ArcAppState>,
        Path((feed, item_id)): Path<(String, String)>,
    ) -> Result<ApiResponse<SupportState>, AppError> {
        let feed = parse_feed(&feed)?;
        let current = support_state(state.store.as_ref(), feed, &item_id, &session.user_id).await?;
        Ok(response(current, StatusCode::OK))
    }

    pub async fn toggle_handler(
        session: AuthSession,
        State(state): State<ArcAppState>,
        Path((feed, item_id)): Path<(String, String)>,
    ) -> Result<ApiResponse<SupportState>, AppError> {
        let feed = parse_feed(&feed)?;
        let toggled = toggle_support(
            state.store.as_ref(),
            &state.shards,
            feed,
            &item_id,
            &session.user_id,
        )
        .await?;
        Ok(response(toggled, StatusCode::OK))
    }
}

mod live {
    use std::convert::Infallible;

    use axum::response::sse::{Event, KeepAlive, Sse};
    use futures::{Stream, StreamExt};
    use tracing::debug;

    use super::*;
    use crate::{database::feed::get_item, entities::feed_item::FeedItem};

    // Server-sent events carrying every committed state of one item
    pub async fn handler(
        viewer: Option<AuthSession>,
        State(state): State<ArcAppState>,
        Path((feed, item_id)): Path<(String, String)>,
    ) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
        let feed = parse_feed(&feed)?;
        if get_item(state.store.as_ref(), feed, &item_id).await?.is_none() {
            return Err(FuncError::ItemNotFound.into());
        }

        let subscription = state.store.subscribe(&feed.item_ref(&item_id)).await?;
        let viewer = viewer.map(|s| s.user_id);
        debug!("Streaming changes of {}", subscription.doc_ref());

        let events = subscription.into_stream().filter_map(move |doc| {
            let state = state.clone();
            let viewer = viewer.clone();
            async move {
                let item: FeedItem = doc.decode().ok()?;
                let public = present(&item, viewer.as_deref(), &state);
                Event::default()
                    .event("item")
                    .json_data(public)
                    .ok()
                    .map(Ok)
            }
        });

        Ok(Sse::new(events).keep_alive(KeepAlive::default()))
    }
}

mod pager_next {
    use super::*;
    use crate::services::pager::LoadOutcome;

    #[derive(Debug, Serialize)]
    pub struct Returns {
        pub outcome: LoadOutcome,
        pub filter: String,
        pub items: Vec<PublicFeedItem>,
        pub has_more: bool,
        pub loading: bool,
    }

    // Append the next page to this session's accumulated list
    pub async fn handler(
        session: AuthSession,
        State(state): State<ArcAppState>,
        Path((feed, filter)): Path<(String, String)>,
    ) -> Result<ApiResponse<Returns>, AppError> {
        let feed = parse_feed(&feed)?;
        let filter = parse_filter(Some(&filter))?;

        let pager = state.pagers.pager(&session.session_id, feed);
        let outcome = pager.load_page(filter).await?;
        let snapshot = pager.snapshot(filter);

        Ok(response(
            Returns {
                outcome,
                filter: snapshot.filter,
                items: snapshot
                    .items
                    .iter()
                    .map(|item| present(item, Some(&session.user_id), &state))
                    .collect(),
                has_more: snapshot.has_more,
                loading: snapshot.loading,
            },
            StatusCode::OK,
        ))
    }
}

mod pager_reset {
    use super::*;

    pub async fn handler(
        session: AuthSession,
        State(state): State<ArcAppState>,
        Path((feed, filter)): Path<(String, String)>,
    ) -> Result<StatusCode, AppError> {
        let feed = parse_feed(&feed)?;
        let filter = parse_filter(Some(&filter))?;
        state.pagers.pager(&session.session_id, feed).reset(filter);
        Ok(StatusCode::NO_CONTENT)
    }
}

pub fn router() -> Router<ArcAppState> {
    Router::new()
        .route(
            "/{feed}/items",
            get(list_items::handler).post(create_item::handler),
        )
        .route("/{feed}/items/{item_id}", get(get_item::handler))
        .route("/{feed}/items/{item_id}/reaction", put(react::handler))
        .route(
            "/{feed}/items/{item_id}/support",
            get(support::get_handler).post(support::toggle_handler),
        )
        .route("/{feed}/items/{item_id}/live", get(live::handler))
        .route("/{feed}/pager/{filter}/next", post(pager_next::handler))
        .route("/{feed}/pager/{filter}", delete(pager_reset::handler))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::endpoints::test_support::{app, call, token};
    use crate::entities::feed_item::Category;
    use crate::services::text::{TextService, fake::FakeTextService};
    use crate::utils::state::testing::test_state;

    fn post_body(body: &str) -> Value {
        json!({ "body": body, "display_name": "Ruth", "post_type": "testimonies" })
    }

    #[tokio::test]
    async fn create_then_list_with_cursor() {
        let app = app(test_state(None));
        let auth = token("1001", "s1");
        for body in ["one", "two", "three"] {
            let (status, json) =
                call(&app, "POST", "/v1/feeds/feed/items", Some(&auth), Some(post_body(body))).await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(json["data"]["post_type"], "testimony");
        }

        let (status, first) = call(&app, "GET", "/v1/feeds/feed/items", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["data"]["items"].as_array().unwrap().len(), 2);
        assert_eq!(first["data"]["items"][0]["body"], "three");
        assert_eq!(first["data"]["has_more"], true);

        let cursor = first["data"]["cursor"].as_str().unwrap();
        let (_, rest) = call(
            &app,
            "GET",
            &format!("/v1/feeds/feed/items?cursor={cursor}"),
            None,
            None,
        )
        .await;
        assert_eq!(rest["data"]["items"].as_array().unwrap().len(), 1);
        assert_eq!(rest["data"]["items"][0]["body"], "one");
        assert_eq!(rest["data"]["has_more"], false);
    }

    #[tokio::test]
    async fn bad_inputs_are_rejected_before_the_store() {
        let app = app(test_state(None));
        let (status, json) = call(&app, "GET", "/v1/feeds/blog/items", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "UNKNOWN_FEED");

        let (status, json) =
            call(&app, "GET", "/v1/feeds/feed/items?filter=weather", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "UNKNOWN_FILTER");

        let (status, json) =
            call(&app, "GET", "/v1/feeds/feed/items?cursor=bogus", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "INVALID_CURSOR");

        let (status, _) =
            call(&app, "POST", "/v1/feeds/feed/items", None, Some(post_body("x"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(
            &app,
            "POST",
            "/v1/feeds/feed/items",
            Some(&token("1001", "s1")),
            Some(post_body("")),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn reactions_toggle_and_show_only_the_viewers_choice() {
        let app = app(test_state(None));
        let alice = token("1001", "s1");
        let bob = token("1002", "s2");
        let (_, created) =
            call(&app, "POST", "/v1/feeds/wall/items", Some(&alice), Some(post_body("hi"))).await;
        let id = created["data"]["id"].as_str().unwrap().to_string();
        let uri = format!("/v1/feeds/wall/items/{id}/reaction");

        let (status, json) =
            call(&app, "PUT", &uri, Some(&bob), Some(json!({ "kind": "praying" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["active"], "praying");

        let item_uri = format!("/v1/feeds/wall/items/{id}");
        let (_, as_bob) = call(&app, "GET", &item_uri, Some(&bob), None).await;
        assert_eq!(as_bob["data"]["my_reaction"], "praying");
        assert_eq!(as_bob["data"]["reactions"]["praying"], 1);
        let (_, as_alice) = call(&app, "GET", &item_uri, Some(&alice), None).await;
        assert_eq!(as_alice["data"]["my_reaction"], Value::Null);

        let (_, json) =
            call(&app, "PUT", &uri, Some(&bob), Some(json!({ "kind": "praying" }))).await;
        assert_eq!(json["data"]["active"], Value::Null);

        let (status, _) = call(
            &app,
            "PUT",
            "/v1/feeds/wall/items/404/reaction",
            Some(&bob),
            Some(json!({ "kind": "praying" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn live_view_emits_the_item_after_a_reaction() {
        let app = app(test_state(None));
        let alice = token("1001", "s1");
        let (_, created) =
            call(&app, "POST", "/v1/feeds/wall/items", Some(&alice), Some(post_body("hi"))).await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/v1/feeds/wall/items/{id}/live"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        let mut body = response.into_body();

        let uri = format!("/v1/feeds/wall/items/{id}/reaction");
        let (status, _) =
            call(&app, "PUT", &uri, Some(&alice), Some(json!({ "kind": "praying" }))).await;
        assert_eq!(status, StatusCode::OK);

        let mut received = String::new();
        while !(received.contains("event: item") && received.ends_with("\n\n")) {
            let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
                .await
                .expect("no event within 2s")
                .unwrap()
                .unwrap();
            if let Ok(data) = frame.into_data() {
                received.push_str(std::str::from_utf8(&data).unwrap());
            }
        }
        assert_eq!(received.matches("event: item").count(), 1);
        assert!(received.contains(&format!("\"id\":\"{id}\"")));
        assert!(received.contains("\"praying\":1"));
    }

    #[tokio::test]
    async fn support_toggle_is_folded_into_the_count() {
        let app = app(test_state(None));
        let alice = token("1001", "s1");
        let (_, created) =
            call(&app, "POST", "/v1/feeds/wall/items", Some(&alice), Some(post_body("pray"))).await;
        let id = created["data"]["id"].as_str().unwrap().to_string();
        let uri = format!("/v1/feeds/wall/items/{id}/support");

        let (status, json) = call(&app, "POST", &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["supported"], true);

        let mut folded = Value::Null;
        for _ in 0..50 {
            let (_, json) = call(&app, "GET", &uri, Some(&alice), None).await;
            if json["data"]["support_count"] == 1 {
                folded = json;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(folded["data"]["supported"], true);
    }

    #[tokio::test]
    async fn session_pager_accumulates_and_resets_after_posting() {
        let app = app(test_state(None));
        let auth = token("1001", "s1");
        for body in ["a", "b", "c"] {
            call(&app, "POST", "/v1/feeds/feed/items", Some(&auth), Some(post_body(body))).await;
        }

        let next = "/v1/feeds/feed/pager/testimonies/next";
        let (_, first) = call(&app, "POST", next, Some(&auth), None).await;
        assert_eq!(first["data"]["outcome"]["status"], "loaded");
        assert_eq!(first["data"]["items"].as_array().unwrap().len(), 2);

        let (_, second) = call(&app, "POST", next, Some(&auth), None).await;
        assert_eq!(second["data"]["items"].as_array().unwrap().len(), 3);
        assert_eq!(second["data"]["has_more"], false);

        let (_, third) = call(&app, "POST", next, Some(&auth), None).await;
        assert_eq!(third["data"]["outcome"]["status"], "skipped");
        assert_eq!(third["data"]["outcome"]["reason"], "exhausted");

        call(&app, "POST", "/v1/feeds/feed/items", Some(&auth), Some(post_body("d"))).await;
        let (_, fresh) = call(&app, "POST", next, Some(&auth), None).await;
        assert_eq!(fresh["data"]["items"][0]["body"], "d");
        assert_eq!(fresh["data"]["items"].as_array().unwrap().len(), 2);

        let (status, _) =
            call(&app, "DELETE", "/v1/feeds/feed/pager/testimonies", Some(&auth), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, after_reset) = call(&app, "POST", next, Some(&auth), None).await;
        assert_eq!(after_reset["data"]["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn classification_fills_missing_category() {
        let text = Arc::new(FakeTextService {
            category: Some(Category::Healing),
            ..Default::default()
        });
        let app = app(test_state(Some(text.clone() as Arc<dyn TextService>)));
        let auth = token("1001", "s1");

        let (_, created) =
            call(&app, "POST", "/v1/feeds/feed/items", Some(&auth), Some(post_body("better"))).await;
        assert_eq!(created["data"]["category"], "healing");
        assert_eq!(text.classify_calls.load(Ordering::SeqCst), 1);

        let (_, listed) =
            call(&app, "GET", "/v1/feeds/feed/items?filter=healing", None, None).await;
        assert_eq!(listed["data"]["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_classification_still_stores_the_item() {
        let text: Arc<dyn TextService> = Arc::new(FakeTextService::default());
        let app = app(test_state(Some(text)));
        let (status, created) = call(
            &app,
            "POST",
            "/v1/feeds/feed/items",
            Some(&token("1001", "s1")),
            Some(post_body("unsure")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["category"], Value::Null);
    }
}
