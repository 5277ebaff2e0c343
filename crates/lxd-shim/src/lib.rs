//! # lxd-shim
//!
//! LXD-compatible REST/WebSocket API served on top of the LXC command-line
//! tools.
//!
//! ## Overview
//!
//! - Instance actions (`start`, `stop`, `restart`, `freeze`, `unfreeze`) run as
//!   task operations
//! - `exec` and `console` create websocket operations whose secrets gate
//!   attachment to a pseudo-terminal session
//! - `/1.0/events` streams operation and lifecycle notifications
//!
//! ## Architecture
//!
//! This is Layer 2 - the server crate that ties together:
//! - lxd-shim-core: Core types, configuration, errors
//! - lxd-shim-session: Registries, launcher, PTY handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
pub mod bridge;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod response;
pub mod server;
pub mod sessions;

// Re-export commonly used types
pub use actions::{CommandRunner, InstanceAction, SystemRunner};
pub use bridge::{ControlCommand, SessionEnd, StreamBridge};
pub use events::{Event, EventBus, EventFilter, EventType};
pub use response::{ApiError, ApiResult, OperationMetadata};
pub use server::{create_router, serve, spawn_reaper, AppState};
pub use sessions::{SessionSlot, SessionTable};
