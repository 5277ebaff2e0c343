//! LXD response envelopes and the HTTP error mapping.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use lxd_shim_core::{Channel, Error, Operation, OperationClass, OperationId, OperationStatus};

/// Wire status code for an operation that has been created but not started.
pub const STATUS_CODE_CREATED: u16 = 100;
/// Wire status code for an operation announced before it starts running.
pub const STATUS_CODE_PENDING: u16 = 105;

/// Top-level response body shared by every endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    /// `sync`, `async` or `error`
    #[serde(rename = "type")]
    pub response_type: &'static str,
    /// Status text
    pub status: String,
    /// Status code
    pub status_code: u16,
    /// Operation URL (async responses only)
    pub operation: String,
    /// HTTP error code (error responses only)
    pub error_code: u16,
    /// Error text (error responses only)
    pub error: String,
    /// Payload
    pub metadata: T,
}

/// A `sync` success response.
pub fn sync<T: Serialize>(metadata: T) -> Json<Envelope<T>> {
    Json(Envelope {
        response_type: "sync",
        status: OperationStatus::Success.to_string(),
        status_code: OperationStatus::Success.code(),
        operation: String::new(),
        error_code: 0,
        error: String::new(),
        metadata,
    })
}

/// An `async` "Operation created" response.
pub fn created(metadata: OperationMetadata) -> (StatusCode, Json<Envelope<OperationMetadata>>) {
    let envelope = Envelope {
        response_type: "async",
        status: "Operation created".to_string(),
        status_code: STATUS_CODE_CREATED,
        operation: lxd_shim_core::operation_url(&metadata.id),
        error_code: 0,
        error: String::new(),
        metadata,
    };
    (StatusCode::ACCEPTED, Json(envelope))
}

/// Instances an operation touches.
#[derive(Debug, Clone, Serialize)]
pub struct Resources {
    /// Instance URLs
    pub instances: Vec<String>,
}

/// Session details announced for websocket-class operations.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    /// Command being run (empty for console sessions)
    pub command: Vec<String>,
    /// Environment the command runs with
    pub environment: BTreeMap<String, String>,
    /// Secrets, keyed `"0"` (data) and `"control"`
    pub fds: BTreeMap<String, String>,
    /// Interactive terminal requested
    pub interactive: bool,
}

impl From<&Channel> for SessionMetadata {
    fn from(channel: &Channel) -> Self {
        Self {
            command: channel.session.command.clone(),
            environment: channel.session.environment.clone(),
            fds: channel.fds(),
            interactive: channel.session.interactive,
        }
    }
}

/// Wire form of an operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetadata {
    /// Operation id
    pub id: OperationId,
    /// `task` or `websocket`
    pub class: OperationClass,
    /// Human-readable label
    pub description: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
    /// Status text
    pub status: String,
    /// Status code
    pub status_code: u16,
    /// Affected instances
    pub resources: Resources,
    /// Session details, `null` for tasks
    pub metadata: Option<SessionMetadata>,
    /// Operations are never cancellable through this field
    pub may_cancel: bool,
    /// Error text
    pub err: String,
    /// Cluster location
    pub location: String,
}

impl OperationMetadata {
    /// Render `operation`, attaching session details from `channel` if given.
    pub fn new(operation: &Operation, channel: Option<&Channel>, location: &str) -> Self {
        let metadata = match operation.class {
            OperationClass::Websocket => channel.map(SessionMetadata::from),
            OperationClass::Task => None,
        };
        Self {
            id: operation.id,
            class: operation.class,
            description: operation.description.clone(),
            created_at: operation.created_at,
            updated_at: operation.updated_at,
            status: operation.status.to_string(),
            status_code: operation.status.code(),
            resources: Resources {
                instances: vec![operation.instance_url()],
            },
            metadata,
            may_cancel: false,
            err: operation.err.clone(),
            location: location.to_string(),
        }
    }

    /// Present the operation as not yet started.
    pub fn pending(mut self) -> Self {
        self.status = "Pending".to_string();
        self.status_code = STATUS_CODE_PENDING;
        self
    }
}

/// Error returned from a handler, rendered as an LXD `error` envelope.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    /// HTTP status for the wrapped error.
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::OperationNotFound(_) | Error::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::InvalidInput(_) | Error::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            Error::AuthMismatch => StatusCode::FORBIDDEN,
            Error::SessionLimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Envelope {
            response_type: "error",
            status: String::new(),
            status_code: 0,
            operation: String::new(),
            error_code: status.as_u16(),
            error: self.0.to_string(),
            metadata: serde_json::Value::Null,
        };
        (status, Json(body)).into_response()
    }
}

/// Handler result type.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use lxd_shim_core::SessionParams;

    #[test]
    fn test_error_status_mapping() {
        let id = OperationId::new();
        let cases = [
            (Error::OperationNotFound(id), StatusCode::NOT_FOUND),
            (Error::ChannelNotFound(id), StatusCode::NOT_FOUND),
            (Error::AlreadyExists(id), StatusCode::CONFLICT),
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (
                Error::InvalidTransition {
                    from: OperationStatus::Success,
                    to: OperationStatus::Failure,
                },
                StatusCode::BAD_REQUEST,
            ),
            (Error::AuthMismatch, StatusCode::FORBIDDEN),
            (Error::SessionLimitReached(4), StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::ActionFailed("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::SpawnFailure("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }

    #[test]
    fn test_task_metadata_is_null() {
        let op = Operation::new(OperationClass::Task, "web1", "Starting instance");
        let json = serde_json::to_value(OperationMetadata::new(&op, None, "none")).unwrap();
        assert!(json["metadata"].is_null());
        assert_eq!(json["class"], "task");
        assert_eq!(json["status"], "Running");
        assert_eq!(json["status_code"], 103);
        assert_eq!(json["resources"]["instances"][0], "/1.0/instances/web1");
        assert_eq!(json["may_cancel"], false);
        assert_eq!(json["location"], "none");
    }

    #[test]
    fn test_websocket_metadata_announces_fds() {
        let op = Operation::new(OperationClass::Websocket, "web1", "Executing command");
        let channel = Channel::new(
            op.id,
            SessionParams {
                command: vec!["ls".into()],
                ..SessionParams::default()
            },
        );
        let meta = OperationMetadata::new(&op, Some(&channel), "none").pending();
        let json = serde_json::to_value(meta).unwrap();
        assert_eq!(json["status"], "Pending");
        assert_eq!(json["status_code"], 105);
        assert_eq!(json["metadata"]["fds"]["0"], channel.data_secret.as_str());
        assert_eq!(json["metadata"]["fds"]["control"], channel.control_secret.as_str());
        assert_eq!(json["metadata"]["command"][0], "ls");
        assert_eq!(json["metadata"]["interactive"], true);
    }

    #[test]
    fn test_created_envelope() {
        let op = Operation::new(OperationClass::Task, "web1", "Starting instance");
        let (status, Json(body)) = created(OperationMetadata::new(&op, None, "none"));
        assert_eq!(status, StatusCode::ACCEPTED);
        let json = serde_json::to_value(body).unwrap();
        assert_eq!(json["type"], "async");
        assert_eq!(json["status"], "Operation created");
        assert_eq!(json["status_code"], 100);
        assert_eq!(json["operation"], format!("/1.0/operations/{}", op.id));
        assert_eq!(json["error_code"], 0);
        assert_eq!(json["error"], "");
    }
}
