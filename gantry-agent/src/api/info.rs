//! Agent Info API Handler

use axum::{Json, extract::State};
use gantry_core::dto::agent::AgentInfo;

use crate::api::AgentState;

/// GET /info
/// Platform, core count and protocol version of this agent
pub async fn get_info(State(state): State<AgentState>) -> Json<AgentInfo> {
    Json(state.info)
}
