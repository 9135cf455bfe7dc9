use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{TaskId, WorkerId};
use crate::types::worker::HealthStatus;

/// Snapshot of host resource usage, attached to every heartbeat.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub uptime_seconds: u64,
}

/// One liveness publication, written to `workers/{id}/heartbeat`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub health: HealthStatus,
    /// Task ids this worker currently holds locks on.
    pub held_tasks: Vec<TaskId>,
    pub available_capacity: u32,
    pub resources: ResourceMetrics,
}

impl HeartbeatPayload {
    /// Age of this heartbeat relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}
