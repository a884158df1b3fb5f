//! Route wiring for the proxy's HTTP surface.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::error::with_security_headers;
use crate::handler::ProxyService;

/// `/health`, `/metrics` and `/stats`, with every other path treated as
/// an APT proxy target.
pub fn router(service: Arc<ProxyService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn proxy(State(service): State<Arc<ProxyService>>, req: Request) -> Response {
    service.handle_request(req).await
}

async fn health() -> Response {
    with_security_headers((StatusCode::OK, "OK").into_response())
}

async fn metrics(State(service): State<Arc<ProxyService>>) -> Response {
    let text = service.metrics().encode();
    with_security_headers(
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
    )
}

async fn stats(State(service): State<Arc<ProxyService>>) -> Response {
    let snapshot = service.stats_snapshot().await;
    with_security_headers(Json(snapshot).into_response())
}
