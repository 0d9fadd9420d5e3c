//! Ownership probe and health endpoints used by peer gateways.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::errors::{ApiResponse, GatewayError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ProbeQuery {
    pub uid: String,
}

/// GET /proxy: does this node own the uid's staging directory?
/// Peers fan this out to find which node can accept a chunk or serve a
/// not-yet-merged object.
pub async fn probe_ownership(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProbeQuery>,
) -> Result<Json<ApiResponse<bool>>, GatewayError> {
    let uid: i64 = query.uid.parse().map_err(|e| GatewayError::InvalidParam {
        message: format!("invalid uid parameter: {e}"),
    })?;
    Ok(Json(ApiResponse::ok(state.staging.owns(uid))))
}

/// GET /health: liveness check, also consulted by the heartbeat loop
/// before re-registering this node with the cluster.
pub async fn health() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::ok("ok"))
}
