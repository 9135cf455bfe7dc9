//! Worker registry: pool membership, heartbeat tracking, health
//! classification and capacity accounting, persisted through the memory
//! synchronizer under `workers/{id}/...`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sentinel_common::config::RegistryConfig;
use sentinel_common::ids::WorkerId;
use sentinel_common::types::{HealthStatus, WorkerRecord, WorkerRegistration};
use sentinel_common::{keys, Result, SentinelError};

use crate::events::{CoordinationEvent, EventBus};
use crate::memory::{MemorySynchronizer, WriteOptions};

/// Optional constraints for worker discovery.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryFilter {
    /// Required capability tags (subset match).
    pub capabilities: Option<BTreeSet<String>>,
    /// Exact health classification.
    pub health: Option<HealthStatus>,
    pub min_available_capacity: Option<u32>,
}

impl DiscoveryFilter {
    fn matches(&self, record: &WorkerRecord) -> bool {
        if let Some(required) = &self.capabilities {
            if !record.has_capabilities(required) {
                return false;
            }
        }
        if let Some(health) = self.health {
            if record.health != health {
                return false;
            }
        }
        if let Some(min) = self.min_available_capacity {
            if record.available_capacity() < min {
                return false;
            }
        }
        true
    }
}

/// A discovered worker annotated with its load-balancing priority in [0, 1].
#[derive(Clone, Debug)]
pub struct PrioritizedWorker {
    pub record: WorkerRecord,
    pub priority: f64,
}

/// Counter snapshot, exposed through `get_metrics`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RegistryMetrics {
    pub registered: u64,
    pub deregistered: u64,
    pub swept: u64,
}

/// Process-wide membership service. Owns worker-record lifecycle; the
/// heartbeat monitor owns only the heartbeat key of its own worker.
pub struct WorkerRegistry {
    memory: Arc<MemorySynchronizer>,
    config: RegistryConfig,
    events: EventBus,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,

    registered: AtomicU64,
    deregistered: AtomicU64,
    swept: AtomicU64,
}

impl WorkerRegistry {
    pub fn new(
        memory: Arc<MemorySynchronizer>,
        config: RegistryConfig,
        events: EventBus,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            memory,
            config,
            events,
            sweeper: Mutex::new(None),
            shutdown_tx,
            registered: AtomicU64::new(0),
            deregistered: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        })
    }

    /// Create a worker record and make it discoverable. Returns the record
    /// with its freshly generated id.
    pub async fn register(&self, registration: WorkerRegistration) -> Result<WorkerRecord> {
        self.register_at(WorkerId::new(), registration).await
    }

    /// Register under a caller-chosen id. Used when the id must match an
    /// already-running memory synchronizer's local identity.
    pub async fn register_at(
        &self,
        id: WorkerId,
        registration: WorkerRegistration,
    ) -> Result<WorkerRecord> {
        let record = WorkerRecord::new(id, registration);

        self.store(&record).await?;

        tracing::info!(
            worker_id = %id,
            node_id = %record.node_id,
            capabilities = ?record.capabilities,
            max_concurrent_tasks = record.max_concurrent_tasks,
            "Worker registered"
        );
        metrics::counter!("registry.registrations").increment(1);
        self.registered.fetch_add(1, Ordering::Relaxed);
        self.events
            .publish(CoordinationEvent::WorkerRegistered { worker_id: id });

        Ok(record)
    }

    /// Refresh the worker's liveness timestamp. Idempotent.
    pub async fn heartbeat(&self, id: WorkerId) -> Result<()> {
        let mut record = self.load(id).await?;
        record.last_heartbeat = Utc::now();
        record.health = HealthStatus::Healthy;
        self.store(&record).await
    }

    /// Adjust the running-task count. Writes that would leave the count
    /// outside `[0, max_concurrent_tasks]` are rejected.
    pub async fn update_task_count(&self, id: WorkerId, delta: i32) -> Result<WorkerRecord> {
        let mut record = self.load(id).await?;

        let updated = record.current_tasks as i64 + delta as i64;
        if updated < 0 || updated > record.max_concurrent_tasks as i64 {
            return Err(SentinelError::InvalidInput(format!(
                "task count {} + {} outside [0, {}] for worker {}",
                record.current_tasks, delta, record.max_concurrent_tasks, id
            )));
        }

        record.current_tasks = updated as u32;
        self.store(&record).await?;
        Ok(record)
    }

    /// Fold a task outcome into the worker's metrics and free its slot.
    pub async fn record_completion(
        &self,
        id: WorkerId,
        success: bool,
        duration_ms: u64,
    ) -> Result<WorkerRecord> {
        let mut record = self.load(id).await?;
        record.metrics.record(success, duration_ms);
        record.current_tasks = record.current_tasks.saturating_sub(1);
        self.store(&record).await?;

        metrics::counter!(
            "registry.completions",
            "outcome" => if success { "success" } else { "failure" }
        )
        .increment(1);
        Ok(record)
    }

    /// Fetch one worker with health recomputed from heartbeat age.
    pub async fn get_worker(&self, id: WorkerId) -> Result<WorkerRecord> {
        let mut record = self.load(id).await?;
        record.health = self.classify(&record);
        Ok(record)
    }

    /// All workers matching the filter, health recomputed on read.
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<WorkerRecord>> {
        let mut workers = Vec::new();

        for key in self.memory.search(keys::WORKERS_PREFIX).await? {
            if !keys::is_status_key(&key) {
                continue;
            }
            match self.memory.read(&key).await {
                Ok(Some(value)) => match serde_json::from_value::<WorkerRecord>(value) {
                    Ok(mut record) => {
                        record.health = self.classify(&record);
                        if filter.matches(&record) {
                            workers.push(record);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping malformed worker record")
                    }
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to read worker record"),
            }
        }

        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    /// Discovery plus a priority score per worker, sorted descending.
    /// Ties break on worker id, lexicographically, so ordering is stable.
    pub async fn get_for_load_balancing(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<PrioritizedWorker>> {
        let mut workers: Vec<PrioritizedWorker> = self
            .discover(filter)
            .await?
            .into_iter()
            .map(|record| {
                let priority = priority_score(&record);
                PrioritizedWorker { record, priority }
            })
            .collect();

        workers.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        Ok(workers)
    }

    /// Remove the worker's records. Held locks are untouched; the stale-lock
    /// sweep collects those independently.
    pub async fn deregister(&self, id: WorkerId) -> Result<()> {
        self.memory.delete(&keys::worker_status(id)).await?;
        self.memory.delete(&keys::worker_capacity(id)).await?;

        tracing::info!(worker_id = %id, "Worker deregistered");
        metrics::counter!("registry.deregistrations").increment(1);
        self.deregistered.fetch_add(1, Ordering::Relaxed);
        self.events
            .publish(CoordinationEvent::WorkerDeregistered { worker_id: id });
        Ok(())
    }

    /// Spawn the expired-worker sweep. Idempotent per instance.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_some() {
            return;
        }

        let registry = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds);

        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        registry.sweep_expired().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Registry sweep stopped");
        }));
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Deregister every worker whose heartbeat age exceeds the degraded
    /// threshold. Advisory: a worker refreshing concurrently just
    /// re-registers its record on the next heartbeat write.
    pub async fn sweep_expired(&self) {
        let all = match self.discover(&DiscoveryFilter::default()).await {
            Ok(workers) => workers,
            Err(e) => {
                tracing::warn!(error = %e, "Registry sweep discovery failed");
                return;
            }
        };

        let cutoff = chrono::Duration::seconds(self.config.degraded_threshold_seconds as i64);
        let now = Utc::now();

        for record in all {
            if now - record.last_heartbeat > cutoff {
                tracing::warn!(
                    worker_id = %record.id,
                    heartbeat_age_s = (now - record.last_heartbeat).num_seconds(),
                    "Sweeping expired worker"
                );
                if let Err(e) = self.deregister(record.id).await {
                    tracing::warn!(worker_id = %record.id, error = %e, "Failed to sweep worker");
                } else {
                    self.swept.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("registry.sweeps").increment(1);
                }
            }
        }
    }

    pub fn get_metrics(&self) -> RegistryMetrics {
        RegistryMetrics {
            registered: self.registered.load(Ordering::Relaxed),
            deregistered: self.deregistered.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    fn classify(&self, record: &WorkerRecord) -> HealthStatus {
        let age = (Utc::now() - record.last_heartbeat)
            .to_std()
            .unwrap_or(Duration::ZERO);
        HealthStatus::classify(
            age,
            Duration::from_secs(self.config.healthy_threshold_seconds),
            Duration::from_secs(self.config.degraded_threshold_seconds),
        )
    }

    async fn load(&self, id: WorkerId) -> Result<WorkerRecord> {
        let value = self
            .memory
            .read(&keys::worker_status(id))
            .await?
            .ok_or_else(|| SentinelError::NotFound(format!("worker {}", id)))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Persist the record and its capacity view, flushing so discovery
    /// (which scans the backend) sees it promptly.
    async fn store(&self, record: &WorkerRecord) -> Result<()> {
        let ttl = WriteOptions::ttl(self.config.worker_ttl_seconds);

        self.memory.write(
            &keys::worker_status(record.id),
            serde_json::to_value(record)?,
            ttl.clone(),
        )?;
        self.memory.write(
            &keys::worker_capacity(record.id),
            serde_json::json!({
                "available": record.available_capacity(),
                "current": record.current_tasks,
                "max": record.max_concurrent_tasks,
            }),
            ttl,
        )?;
        self.memory.flush().await;
        Ok(())
    }
}

/// Load-balancing priority in [0, 1]: capacity headroom, then success
/// history, then speed.
fn priority_score(record: &WorkerRecord) -> f64 {
    let capacity = if record.max_concurrent_tasks == 0 {
        0.0
    } else {
        record.available_capacity() as f64 / record.max_concurrent_tasks as f64
    };

    let avg_secs = record.metrics.avg_task_duration_ms / 1_000.0;
    let speed = if avg_secs <= 0.0 {
        1.0
    } else {
        (1.0 / avg_secs).min(1.0)
    };

    0.5 * capacity + 0.3 * record.metrics.success_rate() + 0.2 * speed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use sentinel_common::ids::NodeId;

    fn registry() -> Arc<WorkerRegistry> {
        let backend = Arc::new(InMemoryBackend::new());
        let events = EventBus::default();
        let memory = MemorySynchronizer::new(
            backend,
            WorkerId::new(),
            sentinel_common::config::MemoryConfig::default(),
            events.clone(),
        );
        WorkerRegistry::new(memory, RegistryConfig::default(), events)
    }

    fn registration(max: u32, caps: &[&str]) -> WorkerRegistration {
        WorkerRegistration {
            node_id: NodeId::new("node-1"),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            max_concurrent_tasks: max,
        }
    }

    #[tokio::test]
    async fn test_register_then_deregister_leaves_no_record() {
        let registry = registry();
        let record = registry.register(registration(4, &["rust"])).await.unwrap();

        assert!(registry.get_worker(record.id).await.is_ok());
        registry.deregister(record.id).await.unwrap();

        let err = registry.get_worker(record.id).await.unwrap_err();
        assert!(matches!(err, SentinelError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_task_count_clamped_to_capacity() {
        let registry = registry();
        let record = registry.register(registration(2, &[])).await.unwrap();

        registry.update_task_count(record.id, 1).await.unwrap();
        registry.update_task_count(record.id, 1).await.unwrap();

        // Above max.
        let err = registry.update_task_count(record.id, 1).await.unwrap_err();
        assert!(matches!(err, SentinelError::InvalidInput(_)));

        registry.update_task_count(record.id, -2).await.unwrap();
        // Below zero.
        let err = registry.update_task_count(record.id, -1).await.unwrap_err();
        assert!(matches!(err, SentinelError::InvalidInput(_)));

        let current = registry.get_worker(record.id).await.unwrap();
        assert_eq!(current.current_tasks, 0);
    }

    #[tokio::test]
    async fn test_completion_updates_metrics_and_frees_slot() {
        let registry = registry();
        let record = registry.register(registration(2, &[])).await.unwrap();

        registry.update_task_count(record.id, 1).await.unwrap();
        let updated = registry
            .record_completion(record.id, true, 2_000)
            .await
            .unwrap();

        assert_eq!(updated.current_tasks, 0);
        assert_eq!(updated.metrics.tasks_completed, 1);
        assert!((updated.metrics.avg_task_duration_ms - 2_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_discover_filters_by_capability_and_capacity() {
        let registry = registry();
        let fast = registry
            .register(registration(4, &["rust", "gpu"]))
            .await
            .unwrap();
        let _other = registry.register(registration(4, &["python"])).await.unwrap();
        let full = registry.register(registration(1, &["rust"])).await.unwrap();
        registry.update_task_count(full.id, 1).await.unwrap();

        let filter = DiscoveryFilter {
            capabilities: Some(BTreeSet::from(["rust".to_string()])),
            min_available_capacity: Some(1),
            ..Default::default()
        };
        let found = registry.discover(&filter).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, fast.id);
    }

    #[tokio::test]
    async fn test_load_balancing_priority_ordering() {
        let registry = registry();

        let idle = registry.register(registration(4, &[])).await.unwrap();
        let busy = registry.register(registration(4, &[])).await.unwrap();
        for _ in 0..3 {
            registry.update_task_count(busy.id, 1).await.unwrap();
        }

        let ranked = registry
            .get_for_load_balancing(&DiscoveryFilter::default())
            .await
            .unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].record.id, idle.id);
        assert!(ranked[0].priority > ranked[1].priority);
        for ranked_worker in &ranked {
            assert!((0.0..=1.0).contains(&ranked_worker.priority));
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_workers() {
        let registry = registry();
        let record = registry.register(registration(2, &[])).await.unwrap();

        // Age the record past the degraded threshold by rewriting it with an
        // old heartbeat.
        let mut aged = record.clone();
        aged.last_heartbeat =
            Utc::now() - chrono::Duration::seconds(2 * 900);
        registry.store(&aged).await.unwrap();

        registry.sweep_expired().await;

        let err = registry.get_worker(record.id).await.unwrap_err();
        assert!(matches!(err, SentinelError::NotFound(_)));
        assert_eq!(registry.get_metrics().swept, 1);
    }
}
