//! Marquee host.
//!
//! Ties the pipe transport, the message bus and the worker manager together:
//! peers are attached or launched, registered as bus listeners, answered by
//! the built-in capability handlers and reaped when they go away.

pub mod config;
pub mod control;
pub mod host;

pub use config::{ConfigError, HostConfig, DEFAULT_CONFIG_PATH};
pub use control::WorkerControlHandler;
pub use host::{Host, HostBuilder};
