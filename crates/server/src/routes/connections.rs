use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use supervisor::{ConnectionInfo, ConnectionStats};

use crate::{AppState, response::ApiResponse};

#[derive(Debug, Serialize)]
pub struct ConnectionsOverview {
    pub stats: ConnectionStats,
    pub connections: Vec<ConnectionInfo>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/connections", get(list_connections))
}

async fn list_connections(State(state): State<AppState>) -> Json<ApiResponse<ConnectionsOverview>> {
    let mut connections = state.connections.list();
    connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
    Json(ApiResponse::success(ConnectionsOverview {
        stats: state.connections.stats(),
        connections,
    }))
}
