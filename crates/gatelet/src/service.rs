//! AdmissionControl: the two pools behind one validated configuration.
//!
//! Owns the connection-admission pool and the long-task pool, builds accept
//! gates over listeners, and snapshots occupancy for observability.

use std::io;
use std::sync::Arc;

use crate::config::AdmissionConfig;
use crate::error::ConfigError;
use crate::gate::AcceptGate;
use crate::slot::SlotPool;
use crate::stats::{PoolSnapshot, Statistics};

pub struct AdmissionControl {
    config: AdmissionConfig,
    connection_pool: Arc<SlotPool>,
    long_task_pool: Option<Arc<SlotPool>>,
}

impl AdmissionControl {
    pub fn new(config: AdmissionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let connection_pool = Arc::new(SlotPool::new(config.maximum_connections));
        let long_task_pool = config
            .long_tasks_enabled()
            .then(|| Arc::new(SlotPool::new(config.maximum_long_tasks)));
        Ok(Self {
            config,
            connection_pool,
            long_task_pool,
        })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn connection_pool(&self) -> &Arc<SlotPool> {
        &self.connection_pool
    }

    /// The long-task pool, or `None` when long tasks are disabled.
    pub fn long_task_pool(&self) -> Option<Arc<SlotPool>> {
        self.long_task_pool.as_ref().map(Arc::clone)
    }

    /// Gate a listener on the connection pool.
    pub fn gate(&self, listener: std::net::TcpListener) -> io::Result<AcceptGate> {
        AcceptGate::new(listener, Arc::clone(&self.connection_pool))
    }

    /// Read-only occupancy snapshot. Has no effect on pool state.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            connection_pool: self.connection_pool.snapshot(),
            long_task_pool: self
                .long_task_pool
                .as_ref()
                .map(|pool| pool.snapshot())
                .unwrap_or_else(PoolSnapshot::empty),
        }
    }
}
