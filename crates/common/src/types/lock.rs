use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, TaskId, WorkerId};
use crate::types::task::TaskPriority;

/// Descriptive metadata recorded with a lock at acquisition time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Capacity units the task consumes.
    pub complexity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl TaskMetadata {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            complexity: 1,
            estimated_duration_ms: None,
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
        }
    }
}

/// Companion record for a held lock, stored under `tasks/{id}/lock`.
///
/// The authoritative claim is the assignee field of the ticket itself; this
/// record is a read-through copy valid only while the ticket store still
/// reports the same owner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub node_id: NodeId,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: TaskMetadata,
}

impl LockRecord {
    pub fn new(task_id: TaskId, worker_id: WorkerId, node_id: NodeId, metadata: TaskMetadata) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            worker_id,
            node_id,
            acquired_at: now,
            last_heartbeat: now,
            metadata,
        }
    }

    /// Age of the owner's last heartbeat relative to `now`.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}
