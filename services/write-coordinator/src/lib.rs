//! The write-coordinator service: a thin `axum` front door over
//! [`write_core`]'s decode/route/repack/dispatch pipeline.
//!
//! `POST /insert` accepts a raw TBF insert batch and blocks until the job
//! resolves (locally applied, forwarded to every owning peer, replicated if
//! configured). `POST /internal/pool-insert` is the peer-to-peer route an
//! [`crate::transport_http::HttpPoolTransport`] on another node posts to.

pub mod config;
pub mod state;
pub mod transport_http;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use state::AppState;
use write_core::InsertResponse;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/insert", post(insert))
        .route("/internal/pool-insert", post(pool_insert))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

fn status_for(response: &InsertResponse) -> StatusCode {
    match response {
        InsertResponse::Success { .. } => StatusCode::OK,
        InsertResponse::Error { .. } => StatusCode::BAD_GATEWAY,
        InsertResponse::Critical { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize, Default)]
struct InsertQuery {
    #[serde(default)]
    test: bool,
}

/// The client-facing insert route. `?test=true` requests the test (re-route and
/// forward) LocalApply variant regardless of reindex state, mirroring the
/// wire contract's `INSERT_TEST_SERVER` tag.
async fn insert(
    State(state): State<AppState>,
    Query(query): Query<InsertQuery>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let response = state.handle_insert(&body, query.test).await;
    let status = status_for(&response);
    (status, response.to_wire())
}

/// The peer-to-peer route: applies a buffer a sibling pool already decoded
/// and routed to us. The tag header picks which LocalApply variant to run.
async fn pool_insert(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let test_variant = matches!(
        headers.get("X-Peer-Tag").and_then(|v| v.to_str().ok()),
        Some("test-pool") | Some("test-server")
    );
    match state.apply_peer_packet(test_variant, &body).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
