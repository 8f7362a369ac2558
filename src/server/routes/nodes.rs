//! `GET /nodes` (§4.H): queue-manager stats, unauthenticated.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::kernel::jobs::NodeStats;
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<NodeStats>,
}

pub async fn nodes(State(state): State<AppState>) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: state.queue.stats(),
    })
}
