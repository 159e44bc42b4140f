//! Error types for admission-controller construction.

/// Configuration rejected at service construction.
///
/// Runtime contention is never an error: callers block on pool acquires, and
/// a timed-out `acquire_timeout` surfaces as `None`, not as an error value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("maximum_connections must be at least 1 (got {0})")]
    InvalidMaximumConnections(usize),
}
