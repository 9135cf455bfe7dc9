//! Shared-memory key namespace.
//!
//! All keys are `/`-separated paths under a process-wide namespace prefix
//! applied by the backend adapter. Builders here produce the un-prefixed
//! form; `validate` enforces the restricted character set before any key
//! reaches a backend.

use crate::error::{Result, SentinelError};
use crate::ids::{TaskId, WorkerId};

/// Default process-wide namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "task-sentinel";

pub fn worker_status(id: WorkerId) -> String {
    format!("workers/{}/status", id)
}

pub fn worker_heartbeat(id: WorkerId) -> String {
    format!("workers/{}/heartbeat", id)
}

pub fn worker_capacity(id: WorkerId) -> String {
    format!("workers/{}/capacity", id)
}

pub fn worker_heartbeat_failures(id: WorkerId) -> String {
    format!("workers/{}/heartbeat-failures", id)
}

pub fn task_lock(id: TaskId) -> String {
    format!("tasks/{}/lock", id)
}

pub fn task_state(id: TaskId) -> String {
    format!("tasks/{}/state", id)
}

pub fn task_progress(id: TaskId) -> String {
    format!("tasks/{}/progress", id)
}

pub fn task_agent(id: TaskId, agent: &str) -> String {
    format!("tasks/{}/agents/{}", id, agent)
}

pub fn advisory_lock(id: TaskId, name: &str) -> String {
    format!("tasks/{}/advisory/{}", id, name)
}

pub fn coordination_queue() -> String {
    "coordination/queue".to_string()
}

pub fn coordination_assignments() -> String {
    "coordination/assignments".to_string()
}

pub fn coordination_metrics() -> String {
    "coordination/metrics".to_string()
}

pub fn event(event_type: &str, timestamp_ms: i64) -> String {
    format!("events/{}/{}", event_type, timestamp_ms)
}

pub fn heartbeat_metric(id: WorkerId, timestamp_ms: i64) -> String {
    format!("metrics/heartbeats/{}/{}", id, timestamp_ms)
}

pub fn lock_recovery_metric(timestamp_ms: i64) -> String {
    format!("metrics/lock-recoveries/{}", timestamp_ms)
}

/// Prefix matching all lock records, for the stale-lock sweep.
pub const TASKS_PREFIX: &str = "tasks/";
/// Prefix matching all worker records, for discovery.
pub const WORKERS_PREFIX: &str = "workers/";

/// Whether a key under `tasks/` is a lock record.
pub fn is_lock_key(key: &str) -> bool {
    key.starts_with(TASKS_PREFIX) && key.ends_with("/lock")
}

/// Whether a key under `workers/` is a status record.
pub fn is_status_key(key: &str) -> bool {
    key.starts_with(WORKERS_PREFIX) && key.ends_with("/status")
}

/// Extract the task id from a `tasks/{id}/lock` key.
pub fn task_id_from_lock_key(key: &str) -> Option<TaskId> {
    let rest = key.strip_prefix(TASKS_PREFIX)?;
    let id = rest.strip_suffix("/lock")?;
    id.parse::<u64>().ok().map(TaskId)
}

/// Validate a key against the restricted character set `[A-Za-z0-9/_.-]`.
///
/// Keys containing shell-interpretable characters (semicolons, pipes,
/// backticks, dollar signs, any bracket form, ...) are rejected outright —
/// they never reach a backend.
pub fn validate(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SentinelError::InvalidInput("empty key".to_string()));
    }

    match key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-')))
    {
        None => Ok(()),
        Some(bad) => Err(SentinelError::InvalidInput(format!(
            "key {:?} contains disallowed character {:?}",
            key, bad
        ))),
    }
}
