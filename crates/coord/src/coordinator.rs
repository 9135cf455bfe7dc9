//! Process-wide facade bundling the coordination subsystems behind the
//! programmatic API consumed by planners, executors and observers.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use sentinel_common::config::SystemConfig;
use sentinel_common::ids::{TaskId, WorkerId};
use sentinel_common::types::{TaskMetadata, TaskRequirements, WorkerRecord, WorkerRegistration};
use sentinel_common::{keys, Result};

use crate::balancer::{
    LoadBalancer, MigrationSuggestion, RebalanceRecommendation, WorkerScore,
};
use crate::events::{CoordinationEvent, EventBus};
use crate::heartbeat::HeartbeatMonitor;
use crate::lock::{
    AcquireOptions, AcquireOutcome, AdvisoryLocks, ConflictStrategy, LockManager, LockStatus,
    ReleaseOutcome,
};
use crate::memory::{MemoryBackend, MemoryEntry, MemorySynchronizer, SubscriptionId, WriteOptions};
use crate::registry::{DiscoveryFilter, WorkerRegistry};
use crate::ticket::TicketStore;

/// Combined metrics snapshot across every subsystem.
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorMetrics {
    pub lock: crate::lock::LockMetrics,
    pub sync: crate::memory::SyncMetrics,
    pub registry: crate::registry::RegistryMetrics,
    pub heartbeat: crate::heartbeat::HeartbeatMetrics,
    pub balancer: crate::balancer::BalancerMetrics,
}

/// TTL on ephemeral event records under `events/{type}/{timestamp}`.
const EVENT_TTL_SECONDS: u64 = 60;

pub struct Coordinator {
    config: SystemConfig,
    worker: WorkerRecord,
    memory: Arc<MemorySynchronizer>,
    registry: Arc<WorkerRegistry>,
    lock_manager: Arc<LockManager>,
    monitor: Arc<HeartbeatMonitor>,
    balancer: LoadBalancer,
    advisory: AdvisoryLocks,
    events: EventBus,
    event_pump: tokio::task::JoinHandle<()>,
}

impl Coordinator {
    /// Wire and start every subsystem: memory flusher, registry sweep,
    /// heartbeat timers, stale-lock sweep, and this worker's registration.
    pub async fn start(
        config: SystemConfig,
        backend: Arc<dyn MemoryBackend>,
        tickets: Arc<dyn TicketStore>,
        registration: WorkerRegistration,
    ) -> Result<Self> {
        let events = EventBus::default();
        let worker_id = WorkerId::new();

        let memory = MemorySynchronizer::new(
            backend,
            worker_id,
            config.memory.clone(),
            events.clone(),
        );
        memory.start();

        let registry = WorkerRegistry::new(
            Arc::clone(&memory),
            config.registry.clone(),
            events.clone(),
        );
        registry.start();
        let worker = registry.register_at(worker_id, registration).await?;

        let lock_manager = LockManager::new(
            Arc::clone(&tickets),
            Arc::clone(&memory),
            config.lock.clone(),
            events.clone(),
        );

        let monitor = HeartbeatMonitor::new(
            worker_id,
            worker.node_id.clone(),
            worker.max_concurrent_tasks,
            Arc::clone(&memory),
            tickets,
            config.heartbeat.clone(),
            events.clone(),
        );
        lock_manager.set_observer(Arc::clone(&monitor) as Arc<dyn crate::lock::LockObserver>);
        monitor.start();

        let balancer = LoadBalancer::new(config.balancer.clone());
        let advisory = AdvisoryLocks::new(
            Arc::clone(&memory),
            config.memory.default_ttl_seconds,
        );

        // Mirror bus events into short-lived shared-memory records so other
        // processes can observe them.
        let event_pump = {
            let memory = Arc::clone(&memory);
            let mut rx = events.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let kind = event.kind();
                            let record = serde_json::json!({
                                "kind": kind,
                                "detail": format!("{:?}", event),
                            });
                            let key = keys::event(kind, chrono::Utc::now().timestamp_millis());
                            let _ = memory.write(
                                &key,
                                record,
                                WriteOptions::ttl(EVENT_TTL_SECONDS),
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        tracing::info!(worker_id = %worker_id, "Coordinator started");

        Ok(Self {
            config,
            worker,
            memory,
            registry,
            lock_manager,
            monitor,
            balancer,
            advisory,
            events,
            event_pump,
        })
    }

    /// Stop every background task, send the farewell heartbeat, and remove
    /// this worker from the registry.
    pub async fn shutdown(&self) {
        tracing::info!(worker_id = %self.worker.id, "Coordinator shutting down");

        self.lock_manager.trigger_shutdown();
        self.monitor.stop().await;
        self.registry.stop().await;

        if let Err(e) = self.registry.deregister(self.worker.id).await {
            tracing::warn!(error = %e, "Failed to deregister on shutdown");
        }

        self.event_pump.abort();
        self.memory.stop().await;
    }

    pub fn worker(&self) -> &WorkerRecord {
        &self.worker
    }

    pub fn events(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.events.subscribe()
    }

    // --- Locks ---

    pub async fn acquire_lock(
        &self,
        task_id: TaskId,
        metadata: TaskMetadata,
        strategy: ConflictStrategy,
        max_retries: Option<u32>,
    ) -> AcquireOutcome {
        let mut options =
            AcquireOptions::new(self.worker.id, self.worker.node_id.clone(), metadata)
                .with_strategy(strategy);
        options.max_retries = max_retries;
        self.lock_manager.acquire(task_id, options).await
    }

    pub async fn release_lock(&self, task_id: TaskId) -> ReleaseOutcome {
        self.lock_manager.release(task_id, self.worker.id).await
    }

    pub async fn get_lock_status(&self, task_id: TaskId) -> Result<LockStatus> {
        self.lock_manager.get_lock_status(task_id).await
    }

    /// Opaque advisory lock scoped to a task, independent of the primary
    /// ticket-backed lock.
    pub async fn acquire_task_lock(&self, task_id: TaskId, name: &str) -> Result<bool> {
        self.advisory.acquire(task_id, name, self.worker.id).await
    }

    pub async fn release_task_lock(&self, task_id: TaskId, name: &str) -> Result<()> {
        self.advisory.release(task_id, name, self.worker.id).await
    }

    // --- Load balancing ---

    /// Discover the pool and pick a worker for the task.
    pub async fn select_worker(
        &self,
        requirements: &TaskRequirements,
    ) -> Result<Option<WorkerRecord>> {
        let workers = self.registry.discover(&DiscoveryFilter::default()).await?;
        Ok(self.balancer.select_worker(requirements, &workers))
    }

    pub async fn score_workers(
        &self,
        requirements: &TaskRequirements,
    ) -> Result<Vec<WorkerScore>> {
        let workers = self.registry.discover(&DiscoveryFilter::default()).await?;
        Ok(self.balancer.score_workers(requirements, &workers))
    }

    pub async fn detect_overload(&self) -> Result<Vec<MigrationSuggestion>> {
        let workers = self.registry.discover(&DiscoveryFilter::default()).await?;
        Ok(self.balancer.detect_overload(&workers))
    }

    pub async fn suggest_migration(
        &self,
        pending_queue: &[TaskRequirements],
    ) -> Result<Option<RebalanceRecommendation>> {
        let workers = self.registry.discover(&DiscoveryFilter::default()).await?;
        Ok(self.balancer.suggest_migration(&workers, pending_queue))
    }

    pub async fn reorder_queue(
        &self,
        queue: &[TaskRequirements],
    ) -> Result<Vec<TaskRequirements>> {
        let workers = self.registry.discover(&DiscoveryFilter::default()).await?;
        Ok(self.balancer.reorder_queue(queue, &workers))
    }

    // --- Registry ---

    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<WorkerRecord> {
        self.registry.register(registration).await
    }

    pub async fn heartbeat(&self, worker_id: WorkerId) -> Result<()> {
        self.registry.heartbeat(worker_id).await
    }

    pub async fn discover_workers(&self, filter: &DiscoveryFilter) -> Result<Vec<WorkerRecord>> {
        self.registry.discover(filter).await
    }

    /// Record a finished task: registry metrics, balancer learning, and a
    /// freed capacity slot.
    pub async fn record_task_completion(
        &self,
        worker_id: WorkerId,
        task_type: &str,
        success: bool,
        duration_ms: u64,
    ) -> Result<()> {
        self.registry
            .record_completion(worker_id, success, duration_ms)
            .await?;
        self.balancer
            .update_context(worker_id, task_type, success, duration_ms);
        Ok(())
    }

    pub async fn deregister_worker(&self, worker_id: WorkerId) -> Result<()> {
        self.registry.deregister(worker_id).await
    }

    // --- Shared memory ---

    /// Replicate opaque task state under `tasks/{id}/state`.
    pub async fn sync_task_state(&self, task_id: TaskId, state: serde_json::Value) -> Result<()> {
        self.memory
            .write(&keys::task_state(task_id), state, WriteOptions::default())?;
        self.memory.flush().await;
        Ok(())
    }

    pub async fn get_task_state(&self, task_id: TaskId) -> Result<Option<serde_json::Value>> {
        self.memory.read(&keys::task_state(task_id)).await
    }

    /// Prefix subscription over replicated state; the callback runs after
    /// every matching batch flush.
    pub fn subscribe(
        &self,
        prefix: impl Into<String>,
        callback: impl Fn(&str, &MemoryEntry) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.memory.subscribe(prefix, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.memory.unsubscribe(id);
    }

    pub fn memory(&self) -> &Arc<MemorySynchronizer> {
        &self.memory
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn get_metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            lock: self.lock_manager.get_metrics(),
            sync: self.memory.get_metrics(),
            registry: self.registry.get_metrics(),
            heartbeat: self.monitor.get_metrics(),
            balancer: self.balancer.get_metrics(),
        }
    }
}
