//! Operation types: the tracked unit of work behind every async API call.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Unique identifier for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new random operation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for OperationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for OperationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::InvalidInput(format!("invalid operation id: {s}")))
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work an operation tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Fire-and-forget instance action
    Task,
    /// Interactive session reached over a WebSocket
    Websocket,
}

impl OperationClass {
    /// Wire name of the class.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Task => "task",
            OperationClass::Websocket => "websocket",
        }
    }
}

/// Lifecycle status of an operation.
///
/// `Running` is the only non-terminal state; once an operation reaches
/// `Success` or `Failure` it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Work in progress
    Running,
    /// Finished normally
    Success,
    /// Finished with an error
    Failure,
}

impl OperationStatus {
    /// LXD status code for this status.
    pub fn code(&self) -> u16 {
        match self {
            OperationStatus::Running => 103,
            OperationStatus::Success => 200,
            OperationStatus::Failure => 400,
        }
    }

    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Running => "Running",
            OperationStatus::Success => "Success",
            OperationStatus::Failure => "Failure",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a tracked operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Operation identifier
    pub id: OperationId,
    /// Task or interactive session
    pub class: OperationClass,
    /// Current status
    pub status: OperationStatus,
    /// Target instance name
    pub instance: String,
    /// Human-readable label
    pub description: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last status change
    pub updated_at: DateTime<Utc>,
    /// Error detail, empty unless the status is `Failure`
    pub err: String,
    /// Console session rather than exec session (websocket class only)
    pub is_console: bool,
}

impl Operation {
    /// Create a new `Running` operation with a fresh id.
    pub fn new(
        class: OperationClass,
        instance: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            class,
            status: OperationStatus::Running,
            instance: instance.into(),
            description: description.into(),
            created_at: now,
            updated_at: now,
            err: String::new(),
            is_console: false,
        }
    }

    /// Mark this operation as a console session.
    pub fn with_console(mut self, is_console: bool) -> Self {
        self.is_console = is_console;
        self
    }

    /// API path of this operation.
    pub fn url(&self) -> String {
        operation_url(&self.id)
    }

    /// API path of the instance this operation targets.
    pub fn instance_url(&self) -> String {
        format!("/1.0/instances/{}", self.instance)
    }
}

/// API path for an operation id.
pub fn operation_url(id: &OperationId) -> String {
    format!("/1.0/operations/{id}")
}
