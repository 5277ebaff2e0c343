//! WebSocket endpoints: the notification stream and per-operation channels.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use lxd_shim_core::{ChannelRole, Dimensions, Error, OperationId};
use lxd_shim_session::LaunchRequest;

use crate::bridge::{truncate_reason, ControlCommand, Finisher, SessionEnd, StreamBridge};
use crate::events::{best_effort, EventFilter};
use crate::response::OperationMetadata;
use crate::server::AppState;

const ACKNOWLEDGED: &str = "Acknowledged";

/// Serve one `/1.0/events` subscriber until it disconnects.
pub async fn serve_events(socket: WebSocket, state: AppState, filter: EventFilter) {
    let mut events = state.events.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!(
        "Event subscriber attached ({} total)",
        state.events.subscriber_count()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if !filter.accepts(&event) {
                        continue;
                    }
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    if ws_tx.send(Message::Text(ACKNOWLEDGED.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Event subscriber receive error: {}", e);
                    break;
                }
            },
        }
    }

    debug!("Event subscriber detached");
}

/// Attach a client to an operation's channel with `secret`.
pub async fn attach(mut socket: WebSocket, state: AppState, raw_id: String, secret: String) {
    let id = match raw_id.parse::<OperationId>() {
        Ok(id) => id,
        Err(_) => {
            reject(&mut socket, close_code::POLICY, "unknown operation").await;
            return;
        }
    };

    let operation = match state.operations.get(&id) {
        Ok(op) => op,
        Err(_) => {
            reject(&mut socket, close_code::POLICY, "unknown operation").await;
            return;
        }
    };

    let role = match state.channels.get(&id) {
        Ok(channel) => channel.role_of(&secret),
        Err(_) => None,
    };

    match role {
        Some(ChannelRole::Data) => {
            // Reserve before claiming so a full server leaves the secret usable
            let slot = match state.sessions.reserve(id) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("Rejecting attach to {}: {}", id, e);
                    reject(&mut socket, close_code::AGAIN, &e.to_string()).await;
                    return;
                }
            };

            let channel = match state.channels.claim(&id, &secret) {
                Ok((_, channel)) => channel,
                Err(e) => {
                    warn!("Rejecting attach to {}: {}", id, e);
                    drop(slot);
                    reject(&mut socket, close_code::POLICY, &e.to_string()).await;
                    return;
                }
            };

            let request = LaunchRequest::from_channel(operation.instance.clone(), &channel);
            info!(
                "Launching {} session for operation {}",
                request.mode.name(),
                id
            );
            let launcher = state.launcher.clone();
            let launched =
                tokio::task::spawn_blocking(move || launcher.launch(&request)).await;
            let session = match launched {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    drop(slot);
                    fail_launch(&state, id, &mut socket, e.to_string()).await;
                    return;
                }
                Err(e) => {
                    drop(slot);
                    fail_launch(&state, id, &mut socket, format!("launch panicked: {e}")).await;
                    return;
                }
            };
            if slot.is_cancelled() {
                info!("Operation {} cancelled while launching", id);
            }

            let idle = Duration::from_secs(state.config.sessions.idle_timeout_secs);
            StreamBridge::new(session, slot, finisher(state.clone(), id))
                .idle_timeout(idle)
                .run(socket)
                .await;
        }
        Some(ChannelRole::Control) => {
            if let Err(e) = state.channels.claim(&id, &secret) {
                warn!("Rejecting control attach to {}: {}", id, e);
                reject(&mut socket, close_code::POLICY, &e.to_string()).await;
                return;
            }
            info!("Control channel attached for operation {}", id);
            serve_control(socket, state, id).await;
        }
        None => {
            warn!("Rejecting attach to {}: {}", id, Error::AuthMismatch);
            reject(&mut socket, close_code::POLICY, &Error::AuthMismatch.to_string()).await;
        }
    }
}

/// Close with `code` and `reason` before any data flows.
async fn reject(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: truncate_reason(reason.to_string()).into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

async fn fail_launch(state: &AppState, id: OperationId, socket: &mut WebSocket, err: String) {
    error!("Failed to launch session for operation {}: {}", id, err);
    finisher(state.clone(), id)(SessionEnd::Failed(err.clone()));
    reject(socket, close_code::ERROR, &err).await;
}

/// Record a session's ending on its operation and announce it.
fn finisher(state: AppState, id: OperationId) -> Finisher {
    Box::new(move |end: SessionEnd| {
        match state.operations.update(&id, end.status(), end.error()) {
            Ok(operation) => {
                let channel = state.channels.get(&id).ok();
                let metadata = OperationMetadata::new(
                    &operation,
                    channel.as_ref(),
                    &state.events.settings().location,
                );
                best_effort("operation", state.events.operation(metadata));
            }
            Err(e) => debug!("Operation {} not updated after session end: {}", id, e),
        }
    })
}

/// Wire form of a control-channel message.
#[derive(Debug, Deserialize)]
pub struct ControlMessage {
    /// `window-resize` or `signal`
    pub command: String,
    /// String-valued arguments (`width`, `height`)
    #[serde(default)]
    pub args: std::collections::HashMap<String, String>,
    /// Signal number for `signal`
    #[serde(default)]
    pub signal: Option<i32>,
}

impl ControlMessage {
    /// Translate into a session command.
    pub fn into_command(self) -> Option<ControlCommand> {
        match self.command.as_str() {
            "window-resize" => {
                let width = self.args.get("width")?.parse().ok()?;
                let height = self.args.get("height")?.parse().ok()?;
                if width == 0 || height == 0 {
                    return None;
                }
                Some(ControlCommand::Resize(Dimensions::new(height, width)))
            }
            "signal" => self.signal.map(ControlCommand::Signal),
            _ => None,
        }
    }
}

async fn serve_control(socket: WebSocket, state: AppState, id: OperationId) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    while let Some(msg) = ws_rx.next().await {
        let payload = match msg {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("Control channel receive error for {}: {}", id, e);
                break;
            }
        };

        match serde_json::from_slice::<ControlMessage>(&payload) {
            Ok(message) => match message.into_command() {
                Some(command) => {
                    debug!("Control command for {}: {:?}", id, command);
                    if !state.sessions.send(&id, command) {
                        debug!("Control command for {} dropped: no live session", id);
                    }
                }
                None => debug!("Ignoring unsupported control message for {}", id),
            },
            Err(e) => debug!("Ignoring malformed control message for {}: {}", id, e),
        }

        if ws_tx.send(Message::Text(ACKNOWLEDGED.into())).await.is_err() {
            break;
        }
    }

    debug!("Control channel for operation {} closed", id);
}
