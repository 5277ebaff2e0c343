//! Instance state actions (`start`, `stop`, ...) as sequences of LXC tool
//! invocations.

use std::process::Command;
use std::str::FromStr;

use tracing::{debug, info, warn};

use lxd_shim_core::{Error, Result, ToolSettings};

/// Runs one tool invocation to completion.
pub trait CommandRunner: Send + Sync {
    /// Run `argv` (program first); non-zero exit is an error.
    fn run(&self, argv: &[String]) -> Result<()>;
}

/// Runs tools as child processes of the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String]) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty argument vector".into()))?;

        debug!("Running {:?}", argv);
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::ActionFailed(format!("failed to run {program}: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::ActionFailed(format!(
            "{program} failed ({}): {}",
            output.status,
            stderr.trim()
        )))
    }
}

/// A supported `PUT /1.0/instances/{name}/state` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    /// Boot the instance
    Start,
    /// Thaw, then shut down
    Stop,
    /// Stop, then start
    Restart,
    /// Suspend all processes
    Freeze,
    /// Resume a frozen instance
    Unfreeze,
}

impl FromStr for InstanceAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "freeze" => Ok(Self::Freeze),
            "unfreeze" => Ok(Self::Unfreeze),
            other => Err(Error::InvalidInput(format!("Unsupported action: {other}"))),
        }
    }
}

impl InstanceAction {
    /// Operation description, e.g. `Starting instance`.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Start => "Starting instance",
            Self::Stop => "Stopping instance",
            Self::Restart => "Restarting instance",
            Self::Freeze => "Freezing instance",
            Self::Unfreeze => "Unfreezing instance",
        }
    }

    /// Argument vectors to run, in order.
    pub fn plan(&self, tools: &ToolSettings, instance: &str) -> Vec<Vec<String>> {
        let step = |tool: &str| vec![tool.to_string(), instance.to_string()];
        match self {
            Self::Start => vec![step(&tools.start)],
            Self::Stop => vec![step(&tools.unfreeze), step(&tools.stop)],
            Self::Restart => vec![step(&tools.stop), step(&tools.start)],
            Self::Freeze => vec![step(&tools.freeze)],
            Self::Unfreeze => vec![step(&tools.unfreeze)],
        }
    }
}

/// Run each step in order, stopping at the first failure.
pub fn run_plan(runner: &dyn CommandRunner, plan: &[Vec<String>]) -> Result<()> {
    for (index, argv) in plan.iter().enumerate() {
        if let Err(e) = runner.run(argv) {
            warn!("Step {} of {} failed: {}", index + 1, plan.len(), e);
            return Err(e);
        }
    }
    info!("Completed {} step(s)", plan.len());
    Ok(())
}
