use axum::Router;

use crate::{
    entities::feed_item::{FeedFilter, FeedItem, FeedKind, PublicFeedItem},
    utils::{
        response::{AppError, FuncError},
        state::{AppState, ArcAppState},
        storage::normalize_url,
    },
};

pub mod assist;
pub mod feeds;

pub fn create_router() -> Router<ArcAppState> {
    Router::new()
        .nest("/feeds", feeds::router())
        .nest("/assist", assist::router())
}

pub(crate) fn parse_feed(name: &str) -> Result<FeedKind, AppError> {
    match name {
        "feed" => Ok(FeedKind::Feed),
        "wall" => Ok(FeedKind::Wall),
        _ => Err(FuncError::UnknownFeed.into()),
    }
}

pub(crate) fn parse_filter(name: Option<&str>) -> Result<FeedFilter, AppError> {
    match name {
        None | Some("") => Ok(FeedFilter::All),
        Some(name) => name
            .parse()
            .map_err(|_| FuncError::UnknownFilter.into()),
    }
}

/// Shape an item for `viewer`, with a loadable avatar URL.
pub(crate) fn present(item: &FeedItem, viewer: Option<&str>, state: &AppState) -> PublicFeedItem {
    let mut public = PublicFeedItem::for_viewer(item, viewer);
    public.author.avatar_url = normalize_url(
        public.author.avatar_url.as_deref(),
        &state.config.public_storage_url,
    );
    public
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::utils::security::generate_token;
    use crate::utils::state::{ArcAppState, testing::TEST_KEY};

    pub fn app(state: ArcAppState) -> Router {
        Router::new()
            .nest("/v1", super::create_router())
            .with_state(state)
    }

    pub fn token(user_id: &str, session_id: &str) -> String {
        generate_token(user_id, "access", 3600, session_id, TEST_KEY)
    }

    pub async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, token);
        }
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}
