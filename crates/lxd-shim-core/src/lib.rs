//! # lxd-shim-core
//!
//! Core types for lxd-shim.
//!
//! This crate contains the fundamental types with **no internal dependencies**
//! on other lxd-shim crates. It provides:
//!
//! - Operation types (OperationId, OperationClass, OperationStatus, Operation)
//! - Channel types (Channel, ChannelRole, SessionParams) and secret generation
//! - Terminal geometry
//! - Configuration
//! - Error types
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - the session and server crates depend
//! on this one, but this crate has no dependencies on them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod error;
pub mod geometry;
pub mod operation;

// Re-export commonly used types
pub use channel::{
    default_environment, generate_secret, merge_environment, Channel, ChannelRole, SessionParams,
};
pub use config::{
    EventSettings, OperationSettings, ServerConfig, ServerSettings, SessionSettings, ToolSettings,
};
pub use error::{Error, Result};
pub use geometry::Dimensions;
pub use operation::{operation_url, Operation, OperationClass, OperationId, OperationStatus};
