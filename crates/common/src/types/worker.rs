use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, WorkerId};

/// Health classification derived from heartbeat age. Never stored
/// authoritatively — recomputed on every read of the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Classify a heartbeat age against the registry thresholds.
    pub fn classify(age: Duration, healthy_threshold: Duration, degraded_threshold: Duration) -> Self {
        if age <= healthy_threshold {
            Self::Healthy
        } else if age <= degraded_threshold {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Coarse availability derived from health and load, used by the load
/// balancer's filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Available,
    Busy,
    Overloaded,
    Offline,
}

/// Accumulated per-worker outcome metrics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Running mean over all completed and failed tasks.
    pub avg_task_duration_ms: f64,
}

impl WorkerMetrics {
    /// Fold one task outcome into the running mean.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let total = self.tasks_completed + self.tasks_failed;
        self.avg_task_duration_ms =
            (self.avg_task_duration_ms * total as f64 + duration_ms as f64) / (total + 1) as f64;

        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
    }

    /// Fraction of recorded tasks that succeeded. A worker with no history
    /// counts as fully successful so that new workers are not starved.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// Registration request — everything a worker declares about itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub node_id: NodeId,
    /// Capability tags advertising what task classes this worker can run.
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_tasks: u32,
}

/// A worker's registry record, stored under `workers/{id}/status`.
///
/// Invariant: `0 <= current_tasks <= max_concurrent_tasks`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub node_id: NodeId,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_tasks: u32,
    pub current_tasks: u32,
    pub health: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub metrics: WorkerMetrics,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, registration: WorkerRegistration) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_id: registration.node_id,
            capabilities: registration.capabilities,
            max_concurrent_tasks: registration.max_concurrent_tasks,
            current_tasks: 0,
            health: HealthStatus::Healthy,
            last_heartbeat: now,
            started_at: now,
            metrics: WorkerMetrics::default(),
        }
    }

    pub fn available_capacity(&self) -> u32 {
        self.max_concurrent_tasks.saturating_sub(self.current_tasks)
    }

    /// Load fraction `current / max`. A worker that can run nothing is
    /// always fully loaded.
    pub fn load_fraction(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            1.0
        } else {
            self.current_tasks as f64 / self.max_concurrent_tasks as f64
        }
    }

    /// Whether this worker's capability set covers the required tags.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Derive coarse availability from health and load.
    pub fn status(&self) -> WorkerStatus {
        if self.health == HealthStatus::Unhealthy {
            WorkerStatus::Offline
        } else if self.available_capacity() == 0 {
            WorkerStatus::Overloaded
        } else if self.load_fraction() >= 0.8 {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Available
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max: u32, current: u32) -> WorkerRecord {
        let mut r = WorkerRecord::new(
            WorkerId::new(),
            WorkerRegistration {
                node_id: NodeId::new("node-1"),
                capabilities: BTreeSet::from(["rust".to_string()]),
                max_concurrent_tasks: max,
            },
        );
        r.current_tasks = current;
        r
    }

    #[test]
    fn test_health_classification_boundaries() {
        let healthy = Duration::from_secs(600);
        let degraded = Duration::from_secs(900);

        assert_eq!(
            HealthStatus::classify(Duration::from_secs(0), healthy, degraded),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthStatus::classify(Duration::from_secs(600), healthy, degraded),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthStatus::classify(Duration::from_secs(601), healthy, degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::classify(Duration::from_secs(900), healthy, degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::classify(Duration::from_secs(901), healthy, degraded),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_running_mean() {
        let mut m = WorkerMetrics::default();
        m.record(true, 100);
        m.record(true, 300);
        m.record(false, 200);
        assert!((m.avg_task_duration_ms - 200.0).abs() < f64::EPSILON);
        assert!((m.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate_no_history() {
        assert!((WorkerMetrics::default().success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_capacity_worker_is_overloaded() {
        let r = record(0, 0);
        assert_eq!(r.available_capacity(), 0);
        assert!((r.load_fraction() - 1.0).abs() < f64::EPSILON);
        assert_eq!(r.status(), WorkerStatus::Overloaded);
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(record(10, 2).status(), WorkerStatus::Available);
        assert_eq!(record(10, 8).status(), WorkerStatus::Busy);
        assert_eq!(record(10, 10).status(), WorkerStatus::Overloaded);

        let mut offline = record(10, 0);
        offline.health = HealthStatus::Unhealthy;
        assert_eq!(offline.status(), WorkerStatus::Offline);
    }
}
