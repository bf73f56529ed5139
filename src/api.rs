// =============================================================================
// Optional read-only HTTP surface -- GET /futures/movers?timeframe=...
// =============================================================================

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::types::{MoversResult, Timeframe};

pub struct ApiState {
    pub latest: RwLock<Option<MoversResult>>,
}

impl ApiState {
    pub fn new() -> Self {
        Self { latest: RwLock::new(None) }
    }

    pub fn publish(&self, result: MoversResult) {
        *self.latest.write() = Some(result);
    }
}

impl Default for ApiState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct MoversQuery {
    timeframe: Option<String>,
}

async fn get_movers(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MoversQuery>,
) -> impl IntoResponse {
    let guard = state.latest.read();
    let Some(result) = guard.as_ref() else {
        return (StatusCode::OK, Json(serde_json::json!({}))).into_response();
    };

    match query.timeframe {
        None => (StatusCode::OK, Json(serde_json::to_value(&result.snapshots).unwrap())).into_response(),
        Some(label) => {
            if Timeframe::from_label(&label).is_none() {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "invalid timeframe" })),
                )
                    .into_response();
            }
            match result.snapshots.get(&label) {
                Some(snapshot) => {
                    (StatusCode::OK, Json(serde_json::to_value(snapshot).unwrap())).into_response()
                }
                None => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
            }
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/futures/movers", get(get_movers))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replaces_latest() {
        let state = ApiState::new();
        assert!(state.latest.read().is_none());
        state.publish(MoversResult {
            snapshots: Default::default(),
            aggregated_top: Vec::new(),
            metrics: Default::default(),
            liquidity_penalty: Default::default(),
        });
        assert!(state.latest.read().is_some());
    }
}
