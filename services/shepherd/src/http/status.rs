//! `/status`: the current agent registry as JSON.

use axum::extract::State;
use axum::Json;

use crate::state::AppState;
use crate::supervisor::{self, AgentStatus};

/// `GET /status`: one entry per supervised agent, with liveness queried at
/// response time.
pub async fn get_status(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    Json(supervisor::status(&state).await)
}
