//! Heartbeat monitor: periodic liveness publication and the stale-lock
//! sweep. One instance per worker process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use sentinel_common::config::HeartbeatConfig;
use sentinel_common::ids::{NodeId, TaskId, WorkerId};
use sentinel_common::types::{HealthStatus, HeartbeatPayload, LockRecord, ResourceMetrics};
use sentinel_common::{keys, Result, SentinelError};

use crate::events::{CoordinationEvent, EventBus};
use crate::lock::LockObserver;
use crate::memory::{MemorySynchronizer, WriteOptions};
use crate::ticket::TicketStore;

/// Consecutive failed cycles before a critical alert.
const CRITICAL_FAILURE_THRESHOLD: u32 = 3;

/// Sweep verdict on a lock owner's worker-level heartbeat.
enum Staleness {
    Fresh,
    /// No liveness key published at all.
    Missing,
    /// Heartbeat this many milliseconds old, past the stale threshold.
    Stale(u64),
}

/// Counter snapshot, exposed through `get_metrics`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct HeartbeatMetrics {
    pub heartbeats_sent: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    pub sweeps: u64,
    pub locks_recovered: u64,
}

pub struct HeartbeatMonitor {
    worker_id: WorkerId,
    node_id: NodeId,
    max_concurrent_tasks: u32,
    memory: Arc<MemorySynchronizer>,
    tickets: Arc<dyn TicketStore>,
    config: HeartbeatConfig,
    events: EventBus,

    held: Mutex<HashSet<TaskId>>,
    sys: Mutex<sysinfo::System>,
    started: Instant,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,

    heartbeats_sent: AtomicU64,
    cycles_failed: AtomicU64,
    consecutive_failures: AtomicU32,
    sweeps: AtomicU64,
    locks_recovered: AtomicU64,
}

impl HeartbeatMonitor {
    pub fn new(
        worker_id: WorkerId,
        node_id: NodeId,
        max_concurrent_tasks: u32,
        memory: Arc<MemorySynchronizer>,
        tickets: Arc<dyn TicketStore>,
        config: HeartbeatConfig,
        events: EventBus,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            worker_id,
            node_id,
            max_concurrent_tasks,
            memory,
            tickets,
            config,
            events,
            held: Mutex::new(HashSet::new()),
            sys: Mutex::new(sysinfo::System::new()),
            started: Instant::now(),
            timers: Mutex::new(Vec::new()),
            shutdown_tx,
            heartbeats_sent: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            sweeps: AtomicU64::new(0),
            locks_recovered: AtomicU64::new(0),
        })
    }

    /// Spawn the send and sweep timers and hook the process shutdown
    /// signal. Idempotent per instance; the signal handlers themselves are
    /// registered at most once per process (see `shutdown`).
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock().unwrap();
        if !timers.is_empty() {
            return;
        }

        // Relay the process signal into this monitor's shutdown watch.
        {
            let monitor = Arc::clone(self);
            let mut signal_rx = crate::shutdown::shutdown_receiver();
            timers.push(tokio::spawn(async move {
                if signal_rx.changed().await.is_ok() && *signal_rx.borrow() {
                    let _ = monitor.shutdown_tx.send(true);
                }
            }));
        }

        // Send cycle.
        {
            let monitor = Arc::clone(self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let interval = Duration::from_secs(self.config.heartbeat_interval_seconds);
            timers.push(tokio::spawn(async move {
                monitor.run_send_cycle().await;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            monitor.run_send_cycle().await;
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("Heartbeat send timer stopped");
            }));
        }

        // Stale-lock sweep.
        {
            let monitor = Arc::clone(self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let interval = Duration::from_secs(self.config.detection_interval_seconds);
            timers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            monitor.sweep_stale_locks().await;
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("Stale-lock sweep timer stopped");
            }));
        }

        tracing::info!(
            worker_id = %self.worker_id,
            heartbeat_interval_s = self.config.heartbeat_interval_seconds,
            detection_interval_s = self.config.detection_interval_seconds,
            "Heartbeat monitor started"
        );
    }

    /// Stop both timers and publish one final heartbeat marking this worker
    /// unhealthy with no held tasks.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.timers.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        let farewell = HeartbeatPayload {
            worker_id: self.worker_id,
            timestamp: Utc::now(),
            health: HealthStatus::Unhealthy,
            held_tasks: Vec::new(),
            available_capacity: 0,
            resources: ResourceMetrics::default(),
        };
        if let Err(e) = self.publish(&farewell).await {
            tracing::warn!(error = %e, "Final heartbeat failed");
        }
        tracing::info!(worker_id = %self.worker_id, "Heartbeat monitor stopped");
    }

    /// Track a task as held; its ticket gets annotated on every beat.
    pub fn register_task(&self, task_id: TaskId) {
        self.held.lock().unwrap().insert(task_id);
    }

    pub fn deregister_task(&self, task_id: TaskId) {
        self.held.lock().unwrap().remove(&task_id);
    }

    pub fn held_tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = self.held.lock().unwrap().iter().copied().collect();
        tasks.sort();
        tasks
    }

    /// One full send cycle with retries. Never propagates: exhausted
    /// retries are recorded and the worker carries on degraded.
    pub async fn run_send_cycle(&self) {
        let attempts = self.config.retry_attempts.max(1);

        for attempt in 1..=attempts {
            match self.send_heartbeat().await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        attempt = attempt,
                        error = %e,
                        "Heartbeat attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(self.config.retry_delay_seconds))
                            .await;
                    }
                }
            }
        }

        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("heartbeat.cycle_failures").increment(1);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        // Best effort: the failure record itself may fail too.
        let failure_record = serde_json::json!({
            "worker_id": self.worker_id,
            "consecutive": consecutive,
            "at": Utc::now(),
        });
        if let Err(e) = self
            .memory
            .put_now(
                &keys::worker_heartbeat_failures(self.worker_id),
                failure_record,
                WriteOptions::default(),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to record heartbeat failure");
        }

        self.events.publish(CoordinationEvent::HeartbeatFailure {
            worker_id: self.worker_id,
            consecutive,
        });

        if consecutive >= CRITICAL_FAILURE_THRESHOLD {
            tracing::error!(
                worker_id = %self.worker_id,
                consecutive = consecutive,
                "Heartbeat critically failing"
            );
            self.events.publish(CoordinationEvent::CriticalAlert {
                worker_id: self.worker_id,
                reason: format!("{} consecutive heartbeat cycle failures", consecutive),
                at: Utc::now(),
            });
        }
    }

    /// Build and fan out one heartbeat to all three destinations
    /// concurrently. Any destination failing fails the cycle.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let payload = self.build_payload();
        self.publish(&payload).await?;

        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("heartbeat.sent").increment(1);
        tracing::debug!(
            worker_id = %self.worker_id,
            health = payload.health.as_str(),
            held = payload.held_tasks.len(),
            "Heartbeat published"
        );
        Ok(())
    }

    async fn publish(&self, payload: &HeartbeatPayload) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        let timestamp_ms = payload.timestamp.timestamp_millis();

        let liveness_key = keys::worker_heartbeat(self.worker_id);
        let history_key = keys::heartbeat_metric(self.worker_id, timestamp_ms);
        let liveness = self.memory.put_now(
            &liveness_key,
            value.clone(),
            WriteOptions::ttl(self.config.heartbeat_ttl_seconds),
        );
        let history = self.memory.put_now(
            &history_key,
            value,
            WriteOptions::default(),
        );
        let annotations = self.annotate_held(payload);

        let (liveness, history, annotations) = tokio::join!(liveness, history, annotations);
        liveness?;
        history?;
        annotations
    }

    /// Annotate every held task's ticket concurrently.
    async fn annotate_held(&self, payload: &HeartbeatPayload) -> Result<()> {
        let body = format!(
            "[heartbeat] worker {} on node {} is {} at {}",
            self.worker_id,
            self.node_id,
            payload.health.as_str(),
            payload.timestamp.to_rfc3339()
        );

        let mut set = JoinSet::new();
        for task_id in &payload.held_tasks {
            let tickets = Arc::clone(&self.tickets);
            let task_id = *task_id;
            let body = body.clone();
            set.spawn(async move { tickets.annotate(task_id, &body).await });
        }

        let mut first_error = None;
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(SentinelError::Internal(format!("join: {}", e)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn build_payload(&self) -> HeartbeatPayload {
        let resources = self.sample_resources();
        let held_tasks = self.held_tasks();
        let available = self
            .max_concurrent_tasks
            .saturating_sub(held_tasks.len() as u32);

        HeartbeatPayload {
            worker_id: self.worker_id,
            timestamp: Utc::now(),
            health: classify_local(&resources),
            held_tasks,
            available_capacity: available,
            resources,
        }
    }

    fn sample_resources(&self) -> ResourceMetrics {
        let mut sys = self.sys.lock().unwrap();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let memory_percent = if sys.total_memory() == 0 {
            0.0
        } else {
            sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0
        };

        ResourceMetrics {
            cpu_percent: sys.global_cpu_usage(),
            memory_percent,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    /// Scan all lock records and recover the ones whose owner has gone
    /// silent. Errors are isolated per lock; a failure on one never aborts
    /// the sweep. Returns the number of locks recovered.
    pub async fn sweep_stale_locks(&self) -> usize {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("heartbeat.sweeps").increment(1);

        let lock_keys = match self.memory.search(keys::TASKS_PREFIX).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "Stale-lock sweep search failed");
                return 0;
            }
        };

        let mut recovered = 0;
        for key in lock_keys.into_iter().filter(|k| keys::is_lock_key(k)) {
            match self.sweep_one(&key).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to sweep lock");
                }
            }
        }

        if recovered > 0 {
            tracing::info!(recovered = recovered, "Stale-lock sweep recovered locks");
        }
        recovered
    }

    /// Evaluate one lock record; recover it when its owner is stale past
    /// the threshold on two consecutive reads (anti-race guard).
    async fn sweep_one(&self, key: &str) -> Result<bool> {
        let Some(task_id) = keys::task_id_from_lock_key(key) else {
            return Ok(false);
        };
        let Some(entry) = self.memory.read_entry_uncached(key).await? else {
            return Ok(false);
        };
        let record: LockRecord = serde_json::from_value(entry.value)?;
        let owner = record.worker_id;

        if let Staleness::Fresh = self.owner_staleness(owner).await? {
            return Ok(false);
        }

        // Re-read immediately before acting: the owner may have heartbeated
        // while we were classifying.
        let stale_ms = match self.owner_staleness(owner).await? {
            Staleness::Fresh => {
                tracing::debug!(task_id = %task_id, "Owner heartbeated during sweep, skipping");
                return Ok(false);
            }
            Staleness::Missing => None,
            Staleness::Stale(age_ms) => Some(age_ms),
        };

        tracing::warn!(
            task_id = %task_id,
            owner = %owner,
            stale_ms = ?stale_ms,
            "Recovering stale lock"
        );

        // Unassign is the decisive step; it is idempotent, so concurrent
        // sweeps are safe.
        self.tickets
            .unassign_ticket(task_id, &owner.to_string())
            .await?;

        let marker = match stale_ms {
            Some(age_ms) => format!(
                "[stale-lock-recovered] owner {} silent for {} ms, task returned to queue",
                owner, age_ms
            ),
            None => format!(
                "[stale-lock-recovered] owner {} published no heartbeat, task returned to queue",
                owner
            ),
        };
        if let Err(e) = self.tickets.annotate(task_id, &marker).await {
            tracing::warn!(task_id = %task_id, error = %e, "Stale-lock annotation failed");
        }
        if let Err(e) = self.tickets.mark_queued(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to requeue ticket");
        }
        if let Err(e) = self.memory.delete(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to delete stale lock record");
        }

        // stale_ms is null when the owner never published a heartbeat.
        let recovery = serde_json::json!({
            "task_id": task_id,
            "owner": owner,
            "stale_ms": stale_ms,
            "recovered_by": self.worker_id,
            "at": Utc::now(),
        });
        if let Err(e) = self
            .memory
            .put_now(
                &keys::lock_recovery_metric(Utc::now().timestamp_millis()),
                recovery,
                WriteOptions::default(),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to record lock recovery metric");
        }

        self.locks_recovered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("heartbeat.locks_recovered").increment(1);
        self.events.publish(CoordinationEvent::StaleLockRecovered {
            task_id,
            owner,
            stale_ms,
        });

        Ok(true)
    }

    /// Classify the owner's worker-level liveness signal at
    /// `workers/{ownerId}/heartbeat`, read straight from the backend,
    /// never the cache. That key is the sweep's only staleness input; a
    /// missing key is provisionally stale outright.
    async fn owner_staleness(&self, owner: WorkerId) -> Result<Staleness> {
        let threshold_ms = self.config.stale_threshold_seconds as i64 * 1_000;

        let Some(entry) = self
            .memory
            .read_entry_uncached(&keys::worker_heartbeat(owner))
            .await?
        else {
            return Ok(Staleness::Missing);
        };

        let heartbeat: HeartbeatPayload = serde_json::from_value(entry.value)?;
        let age_ms = (Utc::now() - heartbeat.timestamp).num_milliseconds();
        if age_ms > threshold_ms {
            Ok(Staleness::Stale(age_ms as u64))
        } else {
            Ok(Staleness::Fresh)
        }
    }

    pub fn get_metrics(&self) -> HeartbeatMetrics {
        HeartbeatMetrics {
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            locks_recovered: self.locks_recovered.load(Ordering::Relaxed),
        }
    }
}

impl LockObserver for HeartbeatMonitor {
    fn task_acquired(&self, task_id: TaskId) {
        self.register_task(task_id);
    }

    fn task_released(&self, task_id: TaskId) {
        self.deregister_task(task_id);
    }
}

/// Local health from resource pressure. Same three-way classification the
/// registry derives from heartbeat age, but a worker judging itself goes by
/// capacity headroom instead.
fn classify_local(resources: &ResourceMetrics) -> HealthStatus {
    if resources.cpu_percent > 90.0 || resources.memory_percent > 95.0 {
        HealthStatus::Unhealthy
    } else if resources.cpu_percent > 75.0 || resources.memory_percent > 85.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::ticket::InMemoryTicketStore;
    use sentinel_common::config::MemoryConfig;
    use sentinel_common::types::TaskMetadata;

    fn monitor(
        config: HeartbeatConfig,
    ) -> (
        Arc<HeartbeatMonitor>,
        Arc<MemorySynchronizer>,
        Arc<InMemoryTicketStore>,
    ) {
        let events = EventBus::default();
        let memory = MemorySynchronizer::new(
            Arc::new(InMemoryBackend::new()),
            WorkerId::new(),
            MemoryConfig::default(),
            events.clone(),
        );
        let tickets = Arc::new(InMemoryTicketStore::new());
        let monitor = HeartbeatMonitor::new(
            WorkerId::new(),
            NodeId::new("node-test"),
            4,
            Arc::clone(&memory),
            Arc::clone(&tickets) as Arc<dyn TicketStore>,
            config,
            events,
        );
        (monitor, memory, tickets)
    }

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            heartbeat_interval_seconds: 30,
            heartbeat_ttl_seconds: 60,
            stale_threshold_seconds: 600,
            detection_interval_seconds: 1,
            retry_attempts: 1,
            retry_delay_seconds: 0,
        }
    }

    #[test]
    fn test_local_health_classification() {
        let healthy = ResourceMetrics {
            cpu_percent: 40.0,
            memory_percent: 50.0,
            uptime_seconds: 10,
        };
        let degraded = ResourceMetrics {
            cpu_percent: 80.0,
            ..healthy.clone()
        };
        let unhealthy = ResourceMetrics {
            cpu_percent: 95.0,
            ..healthy.clone()
        };

        assert_eq!(classify_local(&healthy), HealthStatus::Healthy);
        assert_eq!(classify_local(&degraded), HealthStatus::Degraded);
        assert_eq!(classify_local(&unhealthy), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_heartbeat_publishes_liveness_and_history() {
        let (monitor, memory, tickets) = monitor(fast_config());
        tickets.create_ticket(TaskId(9));
        monitor.register_task(TaskId(9));

        monitor.send_heartbeat().await.unwrap();

        let stored = memory
            .read(&keys::worker_heartbeat(monitor.worker_id))
            .await
            .unwrap()
            .unwrap();
        let payload: HeartbeatPayload = serde_json::from_value(stored).unwrap();
        assert_eq!(payload.held_tasks, vec![TaskId(9)]);
        assert_eq!(payload.available_capacity, 3);

        let history = memory.search("metrics/heartbeats/").await.unwrap();
        assert_eq!(history.len(), 1);

        let ticket = tickets.snapshot(TaskId(9)).unwrap();
        assert!(ticket.annotations[0].body.contains("[heartbeat]"));
    }

    #[tokio::test]
    async fn test_failed_cycle_records_failure_and_alerts_after_three() {
        let (monitor, memory, _tickets) = monitor(fast_config());
        let mut rx = monitor.events.subscribe();

        // A held task with no backing ticket makes annotation fail.
        monitor.register_task(TaskId(404));

        for _ in 0..3 {
            monitor.run_send_cycle().await;
        }

        assert_eq!(monitor.get_metrics().cycles_failed, 3);
        assert_eq!(monitor.get_metrics().consecutive_failures, 3);

        let failure = memory
            .read(&keys::worker_heartbeat_failures(monitor.worker_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure["consecutive"], serde_json::json!(3));

        let mut saw_alert = false;
        while let Ok(event) = rx.try_recv() {
            if event.kind() == "critical-alert" {
                saw_alert = true;
            }
        }
        assert!(saw_alert);
    }

    #[tokio::test]
    async fn test_sweep_recovers_stale_lock() {
        let (monitor, memory, tickets) = monitor(fast_config());

        // A dead worker's lock: assigned ticket, lock record, and a
        // heartbeat eleven minutes old.
        let dead = WorkerId::new();
        tickets.create_ticket(TaskId(7));
        tickets
            .assign_ticket(TaskId(7), &dead.to_string())
            .await
            .unwrap();

        let mut record = LockRecord::new(
            TaskId(7),
            dead,
            NodeId::new("node-dead"),
            TaskMetadata::new("build"),
        );
        record.last_heartbeat = Utc::now() - chrono::Duration::minutes(11);
        memory
            .put_now(
                &keys::task_lock(TaskId(7)),
                serde_json::to_value(&record).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let stale_payload = HeartbeatPayload {
            worker_id: dead,
            timestamp: Utc::now() - chrono::Duration::minutes(11),
            health: HealthStatus::Healthy,
            held_tasks: vec![TaskId(7)],
            available_capacity: 0,
            resources: ResourceMetrics::default(),
        };
        memory
            .put_now(
                &keys::worker_heartbeat(dead),
                serde_json::to_value(&stale_payload).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let recovered = monitor.sweep_stale_locks().await;
        assert_eq!(recovered, 1);

        // Unassigned, requeued, annotated, record gone, metric written.
        let ticket = tickets.snapshot(TaskId(7)).unwrap();
        assert!(ticket.assignees.is_empty());
        assert_eq!(ticket.state, crate::ticket::TicketState::Queued);
        assert!(ticket
            .annotations
            .iter()
            .any(|a| a.body.contains("[stale-lock-recovered]")));
        assert!(memory
            .read(&keys::task_lock(TaskId(7)))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            memory.search("metrics/lock-recoveries/").await.unwrap().len(),
            1
        );
        assert_eq!(monitor.get_metrics().locks_recovered, 1);
    }

    #[tokio::test]
    async fn test_sweep_recovers_lock_when_worker_heartbeat_stale_but_record_fresh() {
        let (monitor, memory, tickets) = monitor(fast_config());

        // The owner's lock-record refresher is still ticking (fresh record
        // heartbeat), but its worker-level send cycle died eleven minutes
        // ago. The sweep goes by the worker-level signal alone.
        let dead = WorkerId::new();
        tickets.create_ticket(TaskId(13));
        tickets
            .assign_ticket(TaskId(13), &dead.to_string())
            .await
            .unwrap();

        let record = LockRecord::new(
            TaskId(13),
            dead,
            NodeId::new("node-half-dead"),
            TaskMetadata::new("build"),
        );
        memory
            .put_now(
                &keys::task_lock(TaskId(13)),
                serde_json::to_value(&record).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let stale_payload = HeartbeatPayload {
            worker_id: dead,
            timestamp: Utc::now() - chrono::Duration::minutes(11),
            health: HealthStatus::Healthy,
            held_tasks: vec![TaskId(13)],
            available_capacity: 3,
            resources: ResourceMetrics::default(),
        };
        memory
            .put_now(
                &keys::worker_heartbeat(dead),
                serde_json::to_value(&stale_payload).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let recovered = monitor.sweep_stale_locks().await;
        assert_eq!(recovered, 1);

        let ticket = tickets.snapshot(TaskId(13)).unwrap();
        assert!(ticket.assignees.is_empty());
        assert!(ticket
            .annotations
            .iter()
            .any(|a| a.body.contains("silent for")));
    }

    #[tokio::test]
    async fn test_sweep_recovers_lock_when_owner_has_no_heartbeat() {
        let (monitor, memory, tickets) = monitor(fast_config());

        // A fresh lock record whose owner never published a liveness key:
        // provisionally stale outright, regardless of the record's age.
        let silent = WorkerId::new();
        tickets.create_ticket(TaskId(14));
        tickets
            .assign_ticket(TaskId(14), &silent.to_string())
            .await
            .unwrap();

        let record = LockRecord::new(
            TaskId(14),
            silent,
            NodeId::new("node-silent"),
            TaskMetadata::new("build"),
        );
        memory
            .put_now(
                &keys::task_lock(TaskId(14)),
                serde_json::to_value(&record).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let recovered = monitor.sweep_stale_locks().await;
        assert_eq!(recovered, 1);

        let ticket = tickets.snapshot(TaskId(14)).unwrap();
        assert!(ticket.assignees.is_empty());
        assert!(ticket
            .annotations
            .iter()
            .any(|a| a.body.contains("published no heartbeat")));
    }

    #[tokio::test]
    async fn test_sweep_skips_fresh_owner() {
        let (monitor, memory, tickets) = monitor(fast_config());

        let live = WorkerId::new();
        tickets.create_ticket(TaskId(8));
        tickets
            .assign_ticket(TaskId(8), &live.to_string())
            .await
            .unwrap();

        let record = LockRecord::new(
            TaskId(8),
            live,
            NodeId::new("node-live"),
            TaskMetadata::new("build"),
        );
        memory
            .put_now(
                &keys::task_lock(TaskId(8)),
                serde_json::to_value(&record).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let fresh_payload = HeartbeatPayload {
            worker_id: live,
            timestamp: Utc::now(),
            health: HealthStatus::Healthy,
            held_tasks: vec![TaskId(8)],
            available_capacity: 0,
            resources: ResourceMetrics::default(),
        };
        memory
            .put_now(
                &keys::worker_heartbeat(live),
                serde_json::to_value(&fresh_payload).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let recovered = monitor.sweep_stale_locks().await;
        assert_eq!(recovered, 0);

        let ticket = tickets.snapshot(TaskId(8)).unwrap();
        assert!(ticket.assigned_to(&live.to_string()));
    }

    #[tokio::test]
    async fn test_sweep_isolates_per_lock_failures() {
        let (monitor, memory, tickets) = monitor(fast_config());

        // Lock 1: owner dead, but its ticket is missing — unassign fails.
        let dead1 = WorkerId::new();
        let mut broken = LockRecord::new(
            TaskId(1),
            dead1,
            NodeId::new("n"),
            TaskMetadata::new("build"),
        );
        broken.last_heartbeat = Utc::now() - chrono::Duration::minutes(20);
        memory
            .put_now(
                &keys::task_lock(TaskId(1)),
                serde_json::to_value(&broken).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        // Lock 2: recoverable.
        let dead2 = WorkerId::new();
        tickets.create_ticket(TaskId(2));
        tickets
            .assign_ticket(TaskId(2), &dead2.to_string())
            .await
            .unwrap();
        let mut stale = LockRecord::new(
            TaskId(2),
            dead2,
            NodeId::new("n"),
            TaskMetadata::new("build"),
        );
        stale.last_heartbeat = Utc::now() - chrono::Duration::minutes(20);
        memory
            .put_now(
                &keys::task_lock(TaskId(2)),
                serde_json::to_value(&stale).unwrap(),
                WriteOptions::default(),
            )
            .await
            .unwrap();

        let recovered = monitor.sweep_stale_locks().await;
        assert_eq!(recovered, 1);
        assert!(tickets.snapshot(TaskId(2)).unwrap().assignees.is_empty());
    }

    #[tokio::test]
    async fn test_observer_registration_round_trip() {
        let (monitor, _memory, _tickets) = monitor(fast_config());

        let observer: &dyn LockObserver = monitor.as_ref();
        observer.task_acquired(TaskId(5));
        observer.task_acquired(TaskId(6));
        assert_eq!(monitor.held_tasks(), vec![TaskId(5), TaskId(6)]);

        observer.task_released(TaskId(5));
        assert_eq!(monitor.held_tasks(), vec![TaskId(6)]);
    }
}
