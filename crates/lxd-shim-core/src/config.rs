//! Configuration types for lxd-shim.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Dimensions, Error};

/// Server configuration loaded from YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener settings
    pub server: ServerSettings,
    /// Interactive session settings
    pub sessions: SessionSettings,
    /// Operation retention settings
    pub operations: OperationSettings,
    /// LXC tool names
    pub tools: ToolSettings,
    /// Notification envelope settings
    pub events: EventSettings,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.sessions.max_sessions == 0 {
            return Err(Error::Config("sessions.max_sessions must be > 0".into()));
        }

        if self.sessions.default_rows == 0 || self.sessions.default_cols == 0 {
            return Err(Error::Config("terminal dimensions must be > 0".into()));
        }

        if self.operations.prune_interval_secs == 0 {
            return Err(Error::Config(
                "operations.prune_interval_secs must be > 0".into(),
            ));
        }

        self.tools.validate()
    }

    /// `ip:port` the listener binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.ip, self.server.port)
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address
    pub ip: String,
    /// Listen port
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 8443,
            log_level: "info".to_string(),
        }
    }
}

/// Interactive session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Maximum number of live sessions
    pub max_sessions: usize,
    /// Idle timeout in seconds (0 = no timeout)
    pub idle_timeout_secs: u64,
    /// Default terminal rows
    pub default_rows: u16,
    /// Default terminal columns
    pub default_cols: u16,
}

impl SessionSettings {
    /// Default terminal size for new sessions.
    pub fn default_dimensions(&self) -> Dimensions {
        Dimensions::new(self.default_rows, self.default_cols)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            idle_timeout_secs: 3600,
            default_rows: 24,
            default_cols: 80,
        }
    }
}

/// Operation retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSettings {
    /// How long finished operations stay queryable, in seconds
    pub retention_secs: u64,
    /// How often the reaper runs, in seconds
    pub prune_interval_secs: u64,
    /// How long an interactive operation waits for its data channel before
    /// it is failed, in seconds; 0 waits forever
    pub attach_timeout_secs: u64,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            prune_interval_secs: 60,
            attach_timeout_secs: 300,
        }
    }
}

/// Executable names of the LXC tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Exec sessions
    pub attach: String,
    /// Console sessions
    pub console: String,
    /// `start` action
    pub start: String,
    /// `stop` action
    pub stop: String,
    /// `freeze` action
    pub freeze: String,
    /// `unfreeze` action
    pub unfreeze: String,
}

impl ToolSettings {
    fn validate(&self) -> crate::Result<()> {
        let tools = [
            ("attach", &self.attach),
            ("console", &self.console),
            ("start", &self.start),
            ("stop", &self.stop),
            ("freeze", &self.freeze),
            ("unfreeze", &self.unfreeze),
        ];
        for (name, value) in tools {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("tools.{name} cannot be empty")));
            }
        }
        Ok(())
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            attach: "lxc-attach".to_string(),
            console: "lxc-console".to_string(),
            start: "lxc-start".to_string(),
            stop: "lxc-stop".to_string(),
            freeze: "lxc-freeze".to_string(),
            unfreeze: "lxc-unfreeze".to_string(),
        }
    }
}

/// Fixed fields stamped on every notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Project name
    pub project: String,
    /// Cluster location
    pub location: String,
    /// Requestor username on lifecycle events
    pub requestor_username: String,
    /// Requestor protocol on lifecycle events
    pub requestor_protocol: String,
    /// Requestor address on lifecycle events
    pub requestor_address: String,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            location: "none".to_string(),
            requestor_username: "root".to_string(),
            requestor_protocol: "tls".to_string(),
            requestor_address: "0.0.0.0".to_string(),
        }
    }
}
