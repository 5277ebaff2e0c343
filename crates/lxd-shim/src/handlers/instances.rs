//! Instance endpoints: state changes and interactive sessions.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use lxd_shim_core::{
    merge_environment, Channel, Dimensions, Error, Operation, OperationClass, SessionParams,
};
use lxd_shim_session::validate_instance_name;

use crate::actions::{run_plan, InstanceAction};
use crate::events::best_effort;
use crate::handlers::parse_body;
use crate::response::{created, ApiResult, OperationMetadata};
use crate::server::AppState;

/// Body of `PUT /1.0/instances/{name}/state`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StateRequest {
    /// `start`, `stop`, `restart`, `freeze` or `unfreeze`
    pub action: String,
    /// Accepted for compatibility; tools run to completion
    pub timeout: i64,
    /// Accepted for compatibility
    pub force: bool,
}

/// Body of the exec and console endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    /// Command to run (exec only)
    pub command: Vec<String>,
    /// Extra environment, merged over the defaults
    pub environment: HashMap<String, String>,
    /// Numeric user id
    pub user: u32,
    /// Numeric group id
    pub group: u32,
    /// Terminal columns
    pub width: Option<u16>,
    /// Terminal rows
    pub height: Option<u16>,
    /// Interactive terminal (defaults to true)
    pub interactive: Option<bool>,
}

/// `PUT /1.0/instances/{name}/state`
#[instrument(skip_all, fields(instance = %name))]
pub async fn change_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    validate_instance_name(&name)?;
    let request: StateRequest = parse_body(&body)?;
    let action: InstanceAction = request.action.parse()?;
    let location = state.events.settings().location.clone();

    let operation = Operation::new(OperationClass::Task, &name, action.description());
    let id = operation.id;
    state.operations.add(operation.clone())?;
    best_effort(
        "operation",
        state
            .events
            .operation(OperationMetadata::new(&operation, None, &location)),
    );

    info!("Running {:?} on instance '{}'", action, name);
    let plan = action.plan(&state.config.tools, &name);
    let runner = state.runner.clone();
    let outcome = tokio::task::spawn_blocking(move || run_plan(runner.as_ref(), &plan))
        .await
        .unwrap_or_else(|e| Err(Error::ActionFailed(format!("action panicked: {e}"))));

    let finished = match outcome {
        Ok(()) => state.operations.complete(&id)?,
        Err(e) => {
            warn!("Action {:?} on '{}' failed: {}", action, name, e);
            let failed = state.operations.fail(&id, e.to_string())?;
            best_effort(
                "operation",
                state
                    .events
                    .operation(OperationMetadata::new(&failed, None, &location)),
            );
            return Err(e.into());
        }
    };

    let metadata = OperationMetadata::new(&finished, None, &location);
    best_effort("operation", state.events.operation(metadata.clone()));
    Ok(created(metadata).into_response())
}

/// `POST /1.0/instances/{name}/exec`
#[instrument(skip_all, fields(instance = %name))]
pub async fn exec(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let request: SessionRequest = parse_body(&body)?;
    start_session(&state, &name, request, false)
}

/// `POST /1.0/instances/{name}/console`
#[instrument(skip_all, fields(instance = %name))]
pub async fn console(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let request: SessionRequest = parse_body(&body)?;
    start_session(&state, &name, request, true)
}

fn start_session(
    state: &AppState,
    name: &str,
    request: SessionRequest,
    is_console: bool,
) -> ApiResult<Response> {
    validate_instance_name(name)?;
    if !is_console && request.command.is_empty() {
        return Err(Error::InvalidInput("exec command cannot be empty".into()).into());
    }

    let defaults = state.config.sessions.default_dimensions();
    let params = SessionParams {
        command: if is_console { Vec::new() } else { request.command },
        environment: merge_environment(request.environment),
        user: request.user,
        group: request.group,
        dimensions: Dimensions::from_width_height(request.width, request.height, defaults),
        is_console,
        interactive: request.interactive.unwrap_or(true),
    };

    let (description, action) = if is_console {
        ("Showing console", "instance-console")
    } else {
        ("Executing command", "instance-exec")
    };

    let operation =
        Operation::new(OperationClass::Websocket, name, description).with_console(is_console);
    let channel = Channel::new(operation.id, params);
    state.operations.add(operation.clone())?;
    if let Err(e) = state.channels.add(channel.clone()) {
        match state.operations.delete(&operation.id) {
            Ok(_) => {}
            Err(cleanup) if cleanup.is_not_found() => {}
            Err(cleanup) => debug!(
                "Operation {} not removed after channel failure: {}",
                operation.id, cleanup
            ),
        }
        return Err(e.into());
    }

    let location = &state.events.settings().location;
    let metadata = OperationMetadata::new(&operation, Some(&channel), location);
    best_effort("operation", state.events.operation(metadata.clone().pending()));
    best_effort("operation", state.events.operation(metadata.clone()));
    best_effort(
        "lifecycle",
        state
            .events
            .lifecycle(action, name, &channel.session.command),
    );

    info!(
        "Created {} operation {} for instance '{}'",
        if is_console { "console" } else { "exec" },
        operation.id,
        name
    );
    Ok(created(metadata).into_response())
}
