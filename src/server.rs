//! Axum router construction.
//!
//! Every endpoint maps to exactly one handler; nothing dispatches on
//! query parameters inside a shared entry point, so the route table
//! below is the complete API surface.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{download, link, probe, upload};
use crate::AppState;

/// Build the router with all gateway routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Liveness, also used by the heartbeat self-check.
        .route("/health", get(probe::health))
        // Ownership probe used by peers to route staged uids.
        .route("/proxy", get(probe::probe_ownership))
        // Link issuance and upload bookkeeping.
        .route("/link/upload", post(link::gen_upload_links))
        .route("/link/download", post(link::gen_download_links))
        .route("/resume", post(link::resume))
        .route("/checkpoint", get(link::checkpoint))
        // Data plane.
        .route("/upload", put(upload::upload_single))
        .route("/upload/multi", put(upload::upload_chunk))
        .route("/upload/merge", put(upload::upload_merge))
        .route("/download", get(download::download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // Uploads can be large; the 2MB default limit does not apply.
        .layer(DefaultBodyLimit::disable())
}
