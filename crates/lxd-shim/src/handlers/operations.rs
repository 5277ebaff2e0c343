//! Operation endpoints.

use std::collections::BTreeMap;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use lxd_shim_core::{Error, OperationId, OperationStatus};

use crate::gateway;
use crate::response::{sync, ApiResult, OperationMetadata};
use crate::server::AppState;

/// Query of `GET /1.0/operations`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// `0` for URLs, anything higher for full objects
    #[serde(default)]
    pub recursion: u8,
}

/// Query of the websocket endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct SecretQuery {
    /// Channel secret
    pub secret: Option<String>,
}

fn parse_id(raw: &str) -> Result<OperationId, Error> {
    raw.parse()
}

fn group_name(status: OperationStatus) -> &'static str {
    match status {
        OperationStatus::Running => "running",
        OperationStatus::Success => "success",
        OperationStatus::Failure => "failure",
    }
}

/// `GET /1.0/operations`
#[instrument(skip_all)]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let location = &state.events.settings().location;
    let mut operations = state.operations.list();
    operations.sort_by_key(|op| op.created_at);

    let mut groups: BTreeMap<&'static str, Vec<serde_json::Value>> = BTreeMap::new();
    for operation in operations {
        let entry = if query.recursion > 0 {
            let channel = state.channels.get(&operation.id).ok();
            serde_json::to_value(OperationMetadata::new(
                &operation,
                channel.as_ref(),
                location,
            ))
            .map_err(Error::from)?
        } else {
            serde_json::Value::String(operation.url())
        };
        groups
            .entry(group_name(operation.status))
            .or_default()
            .push(entry);
    }

    Ok(sync(groups).into_response())
}

/// `GET /1.0/operations/{id}`, or an attach when sent with upgrade headers.
#[instrument(skip_all, fields(operation = %raw_id))]
pub async fn get(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<SecretQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> ApiResult<Response> {
    if let Ok(ws) = ws {
        return upgrade(ws, state, raw_id, query);
    }

    let id = parse_id(&raw_id)?;
    let operation = state.operations.get(&id)?;
    let channel = state.channels.get(&id).ok();
    let metadata = OperationMetadata::new(
        &operation,
        channel.as_ref(),
        &state.events.settings().location,
    );
    Ok(sync(metadata).into_response())
}

/// `DELETE /1.0/operations/{id}`
#[instrument(skip_all, fields(operation = %raw_id))]
pub async fn delete(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id(&raw_id)?;
    let operation = state.operations.delete(&id)?;
    match state.channels.delete(&id) {
        // Task operations have no channel
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => debug!("Channel for operation {} not removed: {}", id, e),
    }

    if state.sessions.cancel(&id) {
        info!("Cancelled live session for operation {}", id);
    }
    info!(
        "Deleted operation {} ({}, {})",
        id, operation.description, operation.status
    );
    Ok(sync(serde_json::json!({})).into_response())
}

/// `GET /1.0/operations/{id}/websocket?secret=...`
#[instrument(skip_all, fields(operation = %raw_id))]
pub async fn websocket(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<SecretQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    upgrade(ws, state, raw_id, query)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    raw_id: String,
    query: SecretQuery,
) -> ApiResult<Response> {
    let secret = query
        .secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput("missing secret".into()))?;
    Ok(ws.on_upgrade(move |socket| gateway::attach(socket, state, raw_id, secret)))
}
