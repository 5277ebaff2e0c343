//! Notification stream endpoint.

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use tracing::instrument;

use crate::events::EventFilter;
use crate::gateway;
use crate::server::AppState;

/// Query of `GET /1.0/events`.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event types
    #[serde(rename = "type")]
    pub types: Option<String>,
}

/// `GET /1.0/events`
#[instrument(skip_all)]
pub async fn subscribe(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let filter = EventFilter::parse(query.types.as_deref());
    ws.on_upgrade(move |socket| gateway::serve_events(socket, state, filter))
}
