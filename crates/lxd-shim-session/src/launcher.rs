//! Session launching: turn a channel's parameters into an LXC tool
//! invocation running on a pseudo-terminal.

use std::collections::BTreeMap;

use tracing::info;

use lxd_shim_core::{Channel, Dimensions, Error, Result, ToolSettings};

use crate::pty::{self, PtySession};

/// What kind of session to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Run a command inside the instance
    Exec {
        /// Argument vector
        command: Vec<String>,
        /// Full environment for the command
        environment: BTreeMap<String, String>,
        /// Numeric user id
        user: u32,
        /// Numeric group id
        group: u32,
    },
    /// Attach to the instance console
    Console,
}

impl LaunchMode {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            LaunchMode::Exec { .. } => "exec",
            LaunchMode::Console => "console",
        }
    }
}

/// Everything needed to start one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Target instance
    pub instance: String,
    /// Exec or console
    pub mode: LaunchMode,
    /// Initial terminal size
    pub dimensions: Dimensions,
}

impl LaunchRequest {
    /// Build the request a channel's data role should launch.
    pub fn from_channel(instance: impl Into<String>, channel: &Channel) -> Self {
        let session = &channel.session;
        let mode = if session.is_console {
            LaunchMode::Console
        } else {
            LaunchMode::Exec {
                command: session.command.clone(),
                environment: session.environment.clone(),
                user: session.user,
                group: session.group,
            }
        };
        Self {
            instance: instance.into(),
            mode,
            dimensions: session.dimensions,
        }
    }
}

/// Starts sessions.
pub trait Launcher: Send + Sync {
    /// Spawn the process for `request`.
    fn launch(&self, request: &LaunchRequest) -> Result<PtySession>;
}

/// Reject instance names that could be mistaken for options or paths.
pub fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("instance name cannot be empty".into()));
    }
    if name.starts_with('-') {
        return Err(Error::InvalidInput(format!(
            "instance name cannot start with '-': {name}"
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidInput(format!("invalid instance name: {name:?}")));
    }
    Ok(())
}

/// Argument vector (program first) for a launch request.
pub fn build_argv(tools: &ToolSettings, request: &LaunchRequest) -> Result<Vec<String>> {
    validate_instance_name(&request.instance)?;

    match &request.mode {
        LaunchMode::Console => Ok(vec![
            tools.console.clone(),
            "-n".to_string(),
            request.instance.clone(),
        ]),
        LaunchMode::Exec {
            command,
            environment,
            user,
            group,
        } => {
            if command.is_empty() {
                return Err(Error::InvalidInput("exec command cannot be empty".into()));
            }

            let mut argv = vec![
                tools.attach.clone(),
                "-n".to_string(),
                request.instance.clone(),
                "--clear-env".to_string(),
            ];
            for (key, value) in environment {
                argv.push("-v".to_string());
                argv.push(format!("{key}={value}"));
            }
            argv.extend([
                "-u".to_string(),
                user.to_string(),
                "-g".to_string(),
                group.to_string(),
                "--".to_string(),
            ]);
            argv.extend(command.iter().cloned());
            Ok(argv)
        }
    }
}

/// Launches sessions through the LXC tools on a real pseudo-terminal.
#[derive(Debug, Clone, Default)]
pub struct PtyLauncher {
    tools: ToolSettings,
}

impl PtyLauncher {
    /// Create a launcher using the given tool names.
    pub fn new(tools: ToolSettings) -> Self {
        Self { tools }
    }
}

impl Launcher for PtyLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<PtySession> {
        let argv = build_argv(&self.tools, request)?;
        info!(
            "Launching {} session for instance '{}'",
            request.mode.name(),
            request.instance
        );
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty argument vector".into()))?;
        pty::spawn(program, args, request.dimensions)
    }
}
