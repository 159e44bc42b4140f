//! Read-only occupancy statistics.
//!
//! Snapshots have no effect on pool state and can be taken at any time.

use std::sync::Arc;

use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;

use crate::service::AdmissionControl;
use crate::version::VersionInfo;

/// Point-in-time occupancy of a single slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    /// Total number of slots.
    pub capacity: usize,
    /// Slots not currently held.
    pub available: usize,
    /// Callers suspended waiting for a slot.
    pub waiting: usize,
}

impl PoolSnapshot {
    /// Snapshot of a pool that does not exist (long tasks disabled).
    pub fn empty() -> Self {
        Self {
            capacity: 0,
            available: 0,
            waiting: 0,
        }
    }
}

/// Occupancy of both admission pools.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Statistics {
    pub connection_pool: PoolSnapshot,
    pub long_task_pool: PoolSnapshot,
}

#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub connection_pool: PoolSnapshot,
    pub long_task_pool: PoolSnapshot,
    pub version: VersionInfo,
}

impl From<Statistics> for StatisticsResponse {
    fn from(stats: Statistics) -> Self {
        Self {
            connection_pool: stats.connection_pool,
            long_task_pool: stats.long_task_pool,
            version: VersionInfo::new(),
        }
    }
}

async fn statistics(State(control): State<Arc<AdmissionControl>>) -> Json<StatisticsResponse> {
    Json(control.statistics().into())
}

/// Router exposing the statistics snapshot as JSON.
pub fn routes(control: Arc<AdmissionControl>) -> Router {
    Router::new()
        .route("/statistics", get(statistics))
        .with_state(control)
}
