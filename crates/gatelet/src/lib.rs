//! gatelet: concurrency-admission control for request-driven servers.
//!
//! A small connection pool gates inbound accepts; a larger long-task pool
//! holds requests that are blocked on external I/O. A request that knows a
//! long wait is coming promotes itself: it swaps its connection slot for a
//! long-task slot so CPU-bound peers keep the connection pool to
//! themselves. Demotion swaps back at elevated priority so a terminating
//! long task is never starved by fresh accepts.

mod config;
mod connection;
mod error;
mod gate;
mod long_task;
mod service;
mod slot;
mod version;

pub mod interceptor;
pub mod server;
pub mod stats;

pub use config::{
    ACCEPT_PRIORITY, AdmissionConfig, DEFAULT_START_DELAY, DEMOTE_PRIORITY, PROMOTE_PRIORITY,
};
pub use connection::ServedConnection;
pub use error::ConfigError;
pub use gate::{AcceptGate, BoundSocket};
pub use long_task::{LongTask, StopGuard};
pub use server::ServerConfig;
pub use service::AdmissionControl;
pub use slot::{SlotPool, Token};
pub use stats::{PoolSnapshot, Statistics};
pub use version::{GATELET_VERSION, VersionInfo};
