use std::{any, sync::Arc, time::Duration};

use crate::utils::state::AppState;
use anyhow::Context;
use axum::Router;
use dotenvy::dotenv;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
};
use tracing::{error, info};

use axum::http::Response;
use bytes::Bytes;
use http_body_util::Full;

mod database;
mod endpoints;
mod entities;
mod extractors;
mod services;
mod utils;

fn panic_handler(err: Box<dyn any::Any + Send + 'static>) -> Response<Full<Bytes>> {
    let msg = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    };
    error!("PANIC: {}", msg);

    let body = serde_json::json!({
        "success": false,
        "error": "INTERNAL_SERVER_ERROR",
    })
    .to_string();

    Response::builder()
        .status(500)
        .header("content-type", "application/json")
        .body(Full::from(body))
        .unwrap_or_default()
}

fn app(state: Arc<AppState>) -> Router {
    let v1_router: Router<()> = endpoints::create_router().with_state(state);
    Router::new().nest("/v1", v1_router).layer(
        tower::ServiceBuilder::new()
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .max_age(Duration::from_secs(3600)),
            )
            .layer(CatchPanicLayer::custom(panic_handler)),
    )
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt::fmt()
        .with_writer(std::io::stderr)
        .init();

    let state = match AppState::create_from_env().await {
        Ok(state) => state,
        Err(err) => {
            error!("Failed to create AppState: {:?}", err);
            return Err(err.into());
        }
    };
    let shared_state = Arc::new(state);
    let url = shared_state.config.url.clone();

    let listener = tokio::net::TcpListener::bind(&url)
        .await
        .with_context(|| format!("binding {}", url))?;
    info!("Listening on {:?}", url);
    axum::serve(listener, app(shared_state))
        .await
        .context("server stopped")?;
    Ok(())
}
