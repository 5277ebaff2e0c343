//! # lxd-shim-session
//!
//! Operation bookkeeping and session launching for lxd-shim.
//!
//! This crate provides:
//! - The operation registry and the channel registry
//! - Launch requests and LXC tool argument vectors
//! - Pseudo-terminal spawning and process control
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on lxd-shim-core and is
//! used by the HTTP/WebSocket server crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod launcher;
pub mod pty;
pub mod registry;

// Re-export commonly used types
pub use launcher::{
    build_argv, validate_instance_name, LaunchMode, LaunchRequest, Launcher, PtyLauncher,
};
pub use pty::{PtyProcess, PtySession, SessionProcess};
pub use registry::{ChannelRegistry, OperationRegistry};
