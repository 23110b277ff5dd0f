use std::{convert::Infallible, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::stream::{self, Stream};
use supervisor::{FlowState, SupervisorEvent};
use tokio::sync::broadcast::{Receiver, error::RecvError};

use crate::{AppState, error::ApiError, response::ApiResponse};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/flows", get(list_flows))
        .route("/flows/{flow_id}", get(get_flow))
        .route("/flows/{flow_id}/events", get(stream_flow_events))
}

async fn list_flows(State(state): State<AppState>) -> Json<ApiResponse<Vec<String>>> {
    let mut flow_ids = state.engine.flows().flow_ids();
    flow_ids.sort();
    Json(ApiResponse::success(flow_ids))
}

async fn get_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Result<Json<ApiResponse<FlowState>>, ApiError> {
    let snapshot = state.engine.flows().snapshot(&flow_id).await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

fn to_sse(event: &SupervisorEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_type()).data(data)
}

/// Live events of one flow until its `agent_completed` event
async fn stream_flow_events(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // subscribe before the existence check so no event slips between the two
    let receiver = state.engine.broadcaster().subscribe();
    if !state.engine.flows().contains(&flow_id) {
        return Err(ApiError::NotFound(format!("Flow not found: {}", flow_id)));
    }

    let stream = stream::unfold(
        (receiver, flow_id, false),
        |(mut receiver, flow_id, finished): (Receiver<SupervisorEvent>, String, bool)| async move {
            if finished {
                return None;
            }
            loop {
                match receiver.recv().await {
                    Ok(event) if event.flow_id == flow_id => {
                        let done = event.is_terminal();
                        return Some((Ok(to_sse(&event)), (receiver, flow_id, done)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "[SSE] Subscriber for {} lagged, skipped {} events",
                            flow_id,
                            skipped
                        );
                        let event = Event::default().comment("lagged");
                        return Some((Ok(event), (receiver, flow_id, false)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
