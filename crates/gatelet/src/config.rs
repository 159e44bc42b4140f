//! Admission-controller configuration and priority policy constants.

use std::time::Duration;

use crate::error::ConfigError;

/// Priority used by the accept gate when admitting a new connection.
pub const ACCEPT_PRIORITY: u32 = 0;

/// Priority used when a long task acquires its slot. A promoted request
/// waiting for a long-task slot has no urgency advantage over its peers.
pub const PROMOTE_PRIORITY: u32 = 0;

/// Priority used when a demoting long task re-acquires its connection slot.
///
/// The gap over [`ACCEPT_PRIORITY`] is what guarantees a terminating long
/// task cannot be starved by an unbounded stream of fresh accepts.
pub const DEMOTE_PRIORITY: u32 = 1000;

/// Default delay before a promotion takes effect.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(100);

/// Pool sizing and promotion policy, injected at service construction.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Capacity of the connection-admission pool. Must be at least 1.
    pub maximum_connections: usize,
    /// Capacity of the long-task pool. Zero disables long tasks entirely:
    /// the interceptor becomes a pass-through and handlers see no current
    /// long task.
    pub maximum_long_tasks: usize,
    /// Default delay before a promotion takes effect. Zero promotes
    /// immediately.
    pub start_delay: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            maximum_connections: 1,
            maximum_long_tasks: 10,
            start_delay: DEFAULT_START_DELAY,
        }
    }
}

impl AdmissionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maximum_connections == 0 {
            return Err(ConfigError::InvalidMaximumConnections(
                self.maximum_connections,
            ));
        }
        Ok(())
    }

    pub fn long_tasks_enabled(&self) -> bool {
        self.maximum_long_tasks > 0
    }
}
