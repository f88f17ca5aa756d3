//! Cache introspection and the cluster-wide clear.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{RestError, RestResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub details: bool,
}

/// GET /v1/api/cache/stats — this worker's counters; `?details=true` adds a
/// per-entry listing.
pub async fn stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Response {
    let mut body = match serde_json::to_value(state.cache.stats()) {
        Ok(value) => value,
        Err(err) => {
            return RestError::StoreFailure(format!("Unserializable stats: {err}"))
                .into_response()
        }
    };
    body["caching"] = json!(state.config.caching);
    body["busIncidents"] = json!(state.bus.incidents());
    if params.details {
        body["entries"] = json!(state.cache.entries());
    }
    (StatusCode::OK, Json(body)).into_response()
}

/// POST /v1/api/cache/clear — clears every worker's store and waits for the
/// cluster to confirm before reporting.
pub async fn clear(State(state): State<AppState>) -> RestResult<Response> {
    let ack = state
        .bus
        .broadcast_clear()
        .await
        .map_err(|err| RestError::StoreFailure(format!("Cluster clear failed: {err}")))?;
    if !ack.is_coherent() {
        return Err(RestError::ClusterIncoherent {
            acked: ack.acked,
            unacked: ack.unacked,
        });
    }
    state
        .bus
        .wait_for_sync(state.config.cluster_sync_budget)
        .await
        .map_err(|err| RestError::StoreFailure(format!("Cluster sync failed: {err}")))?;

    let current = state.cache.stats().length;
    Ok((
        StatusCode::OK,
        Json(json!({"message": "Cache cleared", "currentSize": current})),
    )
        .into_response())
}
