//! Distributed lock manager.
//!
//! The ticket store's atomic assignment is the consensus primitive: a lock
//! exists exactly while the ticket reports the owning worker as assignee.
//! The record kept in shared memory under `tasks/{id}/lock` is a
//! read-through copy for heartbeat bookkeeping and staleness checks.

mod advisory;

pub use advisory::AdvisoryLocks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sentinel_common::config::LockConfig;
use sentinel_common::ids::{NodeId, TaskId, WorkerId};
use sentinel_common::types::{LockRecord, TaskMetadata};
use sentinel_common::{keys, Result, SentinelError};

use crate::events::{CoordinationEvent, EventBus};
use crate::memory::{MemorySynchronizer, WriteOptions};
use crate::ticket::TicketStore;

/// How an acquire call reacts to an existing assignment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Back off and re-poll until the retry budget is exhausted.
    #[default]
    Retry,
    /// Surface the conflict immediately.
    FailFast,
    /// Take over the lock when the current owner's heartbeat has been
    /// silent past the lock timeout; otherwise behave like `Retry`.
    StealStale,
}

/// Inputs to an acquire call.
#[derive(Clone, Debug)]
pub struct AcquireOptions {
    pub worker_id: WorkerId,
    pub node_id: NodeId,
    pub metadata: TaskMetadata,
    pub strategy: ConflictStrategy,
    /// Overrides the configured retry budget.
    pub max_retries: Option<u32>,
}

impl AcquireOptions {
    pub fn new(worker_id: WorkerId, node_id: NodeId, metadata: TaskMetadata) -> Self {
        Self {
            worker_id,
            node_id,
            metadata,
            strategy: ConflictStrategy::Retry,
            max_retries: None,
        }
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Terminal state of an acquire call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired,
    /// The assignment landed but cancellation was observed before return;
    /// the caller owns the lock and must decide what to do with it.
    AcquiredBeforeCancel,
    /// The ticket stayed assigned to another worker through the budget.
    Conflict,
    /// Transport or throttling errors exhausted the budget.
    RetriesExhausted,
    Cancelled,
    Failed,
}

/// Structured result of an acquire call. Never an `Err` for conflicts or
/// exhausted budgets; those are outcomes.
#[derive(Clone, Debug)]
pub struct AcquireOutcome {
    pub task_id: TaskId,
    pub status: AcquireStatus,
    pub record: Option<LockRecord>,
    pub retries: u32,
    pub duration_ms: u64,
    pub reason: Option<String>,
}

impl AcquireOutcome {
    pub fn acquired(&self) -> bool {
        matches!(
            self.status,
            AcquireStatus::Acquired | AcquireStatus::AcquiredBeforeCancel
        )
    }
}

/// Structured result of a release call.
#[derive(Clone, Debug)]
pub struct ReleaseOutcome {
    pub task_id: TaskId,
    pub released: bool,
    pub held_ms: Option<u64>,
    pub reason: Option<String>,
}

/// Point-in-time view of a task's lock.
#[derive(Clone, Debug)]
pub struct LockStatus {
    pub task_id: TaskId,
    pub locked: bool,
    pub owner: Option<String>,
    pub record: Option<LockRecord>,
    /// Owner heartbeat older than the lock timeout.
    pub stale: bool,
}

/// Heartbeat registration surface, implemented by the heartbeat monitor.
/// Keeps the monitor free of any back-pointer into the lock manager.
pub trait LockObserver: Send + Sync {
    fn task_acquired(&self, task_id: TaskId);
    fn task_released(&self, task_id: TaskId);
}

/// Counter snapshot, exposed through `get_metrics`. Thread-safe.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LockMetrics {
    pub acquisitions: u64,
    pub releases: u64,
    pub conflicts: u64,
    pub retries: u64,
    pub failed_acquisitions: u64,
    pub stale_locks_claimed: u64,
    pub avg_acquire_ms: f64,
}

/// A lock held by this process: its record, acquisition instant, and the
/// per-task timer refreshing the record's heartbeat.
struct HeldLock {
    record: LockRecord,
    since: Instant,
    refresher: JoinHandle<()>,
}

pub struct LockManager {
    tickets: Arc<dyn TicketStore>,
    memory: Arc<MemorySynchronizer>,
    config: LockConfig,
    events: EventBus,
    observer: Mutex<Option<Arc<dyn LockObserver>>>,
    /// Locks held by this process, keyed by task id. The single guarded
    /// map of per-task timer handles.
    held: Mutex<HashMap<TaskId, HeldLock>>,
    shutdown_tx: watch::Sender<bool>,

    acquisitions: AtomicU64,
    releases: AtomicU64,
    conflicts: AtomicU64,
    retries: AtomicU64,
    failed_acquisitions: AtomicU64,
    stale_locks_claimed: AtomicU64,
    acquire_ms_total: AtomicU64,
}

impl LockManager {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        memory: Arc<MemorySynchronizer>,
        config: LockConfig,
        events: EventBus,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            tickets,
            memory,
            config,
            events,
            observer: Mutex::new(None),
            held: Mutex::new(HashMap::new()),
            shutdown_tx,
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failed_acquisitions: AtomicU64::new(0),
            stale_locks_claimed: AtomicU64::new(0),
            acquire_ms_total: AtomicU64::new(0),
        })
    }

    /// Install the heartbeat registration hook.
    pub fn set_observer(&self, observer: Arc<dyn LockObserver>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    /// Cancel in-flight acquire loops. Observed at every suspension point.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn cancelled(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Acquire the lock on `task_id` per the configured strategy.
    pub async fn acquire(&self, task_id: TaskId, options: AcquireOptions) -> AcquireOutcome {
        let started = Instant::now();
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let worker = options.worker_id.to_string();
        let mut retries: u32 = 0;

        metrics::counter!("lock.acquire.attempts").increment(1);

        loop {
            if self.cancelled() {
                return self.fail(task_id, AcquireStatus::Cancelled, retries, started, None);
            }

            // Step 1: read authoritative state.
            let ticket = match self.tickets.fetch_ticket(task_id).await {
                Ok(ticket) => ticket,
                Err(SentinelError::NotFound(reason)) => {
                    return self.fail(
                        task_id,
                        AcquireStatus::Failed,
                        retries,
                        started,
                        Some(reason),
                    );
                }
                Err(e) if e.is_retryable() => {
                    match self.retry_pause(&e, &mut retries, max_retries).await {
                        RetryVerdict::Continue => continue,
                        RetryVerdict::Exhausted => {
                            return self.fail(
                                task_id,
                                AcquireStatus::RetriesExhausted,
                                retries,
                                started,
                                Some(e.to_string()),
                            );
                        }
                        RetryVerdict::Cancelled => {
                            return self.fail(
                                task_id,
                                AcquireStatus::Cancelled,
                                retries,
                                started,
                                None,
                            );
                        }
                    }
                }
                Err(e) => {
                    return self.fail(
                        task_id,
                        AcquireStatus::Failed,
                        retries,
                        started,
                        Some(e.to_string()),
                    );
                }
            };

            // Step 2: an existing assignment dispatches on strategy.
            if let Some(current) = ticket.assignee() {
                if current != worker {
                    let stolen = match options.strategy {
                        ConflictStrategy::FailFast => {
                            self.conflicts.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("lock.conflicts").increment(1);
                            return self.fail(
                                task_id,
                                AcquireStatus::Conflict,
                                retries,
                                started,
                                Some(format!("assigned to {}", current)),
                            );
                        }
                        ConflictStrategy::StealStale => {
                            self.try_steal(task_id, current).await
                        }
                        ConflictStrategy::Retry => false,
                    };

                    if !stolen {
                        self.conflicts.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("lock.conflicts").increment(1);
                        match self
                            .retry_pause(
                                &SentinelError::Conflict(format!("assigned to {}", current)),
                                &mut retries,
                                max_retries,
                            )
                            .await
                        {
                            RetryVerdict::Continue => continue,
                            RetryVerdict::Exhausted => {
                                return self.fail(
                                    task_id,
                                    AcquireStatus::Conflict,
                                    retries,
                                    started,
                                    Some(format!("assigned to {}", current)),
                                );
                            }
                            RetryVerdict::Cancelled => {
                                return self.fail(
                                    task_id,
                                    AcquireStatus::Cancelled,
                                    retries,
                                    started,
                                    None,
                                );
                            }
                        }
                    }
                }
            }

            // Step 3: attempt the atomic assignment.
            match self.tickets.assign_ticket(task_id, &worker).await {
                Ok(true) => {}
                Ok(false) => {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("lock.conflicts").increment(1);
                    match self
                        .retry_pause(
                            &SentinelError::Conflict("assignment rejected".into()),
                            &mut retries,
                            max_retries,
                        )
                        .await
                    {
                        RetryVerdict::Continue => continue,
                        RetryVerdict::Exhausted => {
                            return self.fail(
                                task_id,
                                AcquireStatus::Conflict,
                                retries,
                                started,
                                Some("assignment rejected".into()),
                            );
                        }
                        RetryVerdict::Cancelled => {
                            return self.fail(
                                task_id,
                                AcquireStatus::Cancelled,
                                retries,
                                started,
                                None,
                            );
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    match self.retry_pause(&e, &mut retries, max_retries).await {
                        RetryVerdict::Continue => continue,
                        RetryVerdict::Exhausted => {
                            return self.fail(
                                task_id,
                                AcquireStatus::RetriesExhausted,
                                retries,
                                started,
                                Some(e.to_string()),
                            );
                        }
                        RetryVerdict::Cancelled => {
                            return self.fail(
                                task_id,
                                AcquireStatus::Cancelled,
                                retries,
                                started,
                                None,
                            );
                        }
                    }
                }
                Err(e) => {
                    return self.fail(
                        task_id,
                        AcquireStatus::Failed,
                        retries,
                        started,
                        Some(e.to_string()),
                    );
                }
            }

            // Step 4: verify — a non-atomic store may have raced us.
            match self.tickets.fetch_ticket(task_id).await {
                Ok(verification) if verification.assigned_to(&worker) => {}
                Ok(_) => {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("lock.conflicts").increment(1);
                    match self
                        .retry_pause(
                            &SentinelError::Conflict("lost assignment race".into()),
                            &mut retries,
                            max_retries,
                        )
                        .await
                    {
                        RetryVerdict::Continue => continue,
                        RetryVerdict::Exhausted => {
                            return self.fail(
                                task_id,
                                AcquireStatus::Conflict,
                                retries,
                                started,
                                Some("lost assignment race".into()),
                            );
                        }
                        RetryVerdict::Cancelled => {
                            return self.fail(
                                task_id,
                                AcquireStatus::Cancelled,
                                retries,
                                started,
                                None,
                            );
                        }
                    }
                }
                Err(e) => {
                    // The assignment may have landed; don't leave an
                    // unverifiable claim behind.
                    let _ = self.tickets.unassign_ticket(task_id, &worker).await;
                    return self.fail(
                        task_id,
                        AcquireStatus::Failed,
                        retries,
                        started,
                        Some(format!("verification failed: {}", e)),
                    );
                }
            }

            return self
                .complete_acquire(task_id, &options, retries, started)
                .await;
        }
    }

    /// Refresh the held lock record's heartbeat every configured interval,
    /// until release aborts it or shutdown fires. Writes go straight
    /// through to the backend so steal-stale readers always see a fresh
    /// timestamp.
    fn spawn_refresher(&self, record: &LockRecord) -> JoinHandle<()> {
        let memory = Arc::clone(&self.memory);
        let mut record = record.clone();
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let ttl_seconds = 2 * self.config.lock_timeout_ms / 1_000;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        record.last_heartbeat = Utc::now();
                        let value = match serde_json::to_value(&record) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if let Err(e) = memory
                            .put_now(
                                &keys::task_lock(record.task_id),
                                value,
                                WriteOptions::ttl(ttl_seconds),
                            )
                            .await
                        {
                            tracing::warn!(
                                task_id = %record.task_id,
                                error = %e,
                                "Lock heartbeat refresh failed"
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Steal the lock when the owner's heartbeat is past the lock timeout.
    /// Returns true when the owner was unassigned and assignment may proceed.
    async fn try_steal(&self, task_id: TaskId, current_owner: &str) -> bool {
        let record = match self.memory.read(&keys::task_lock(task_id)).await {
            Ok(Some(value)) => serde_json::from_value::<LockRecord>(value).ok(),
            _ => None,
        };

        // No record means no staleness evidence; fall back to retrying.
        let Some(record) = record else {
            return false;
        };

        let age_ms = (Utc::now() - record.last_heartbeat).num_milliseconds();
        if age_ms <= self.config.lock_timeout_ms as i64 {
            return false;
        }

        tracing::warn!(
            task_id = %task_id,
            owner = current_owner,
            heartbeat_age_ms = age_ms,
            "Stealing stale lock"
        );

        if let Err(e) = self.tickets.unassign_ticket(task_id, current_owner).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to unassign stale owner");
            return false;
        }

        let _ = self
            .tickets
            .annotate(
                task_id,
                &format!(
                    "[stale-lock-stolen] previous owner {} silent for {} ms",
                    current_owner, age_ms
                ),
            )
            .await;

        self.stale_locks_claimed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lock.steals").increment(1);
        true
    }

    /// Steps 5–8: persist the record, annotate, register the heartbeat and
    /// return success.
    async fn complete_acquire(
        &self,
        task_id: TaskId,
        options: &AcquireOptions,
        retries: u32,
        started: Instant,
    ) -> AcquireOutcome {
        let record = LockRecord::new(
            task_id,
            options.worker_id,
            options.node_id.clone(),
            options.metadata.clone(),
        );

        let lock_ttl_seconds = 2 * self.config.lock_timeout_ms / 1_000;
        let stored = self
            .memory
            .write(
                &keys::task_lock(task_id),
                serde_json::to_value(&record).unwrap_or_default(),
                WriteOptions::ttl(lock_ttl_seconds),
            )
            .is_ok();
        if stored {
            self.memory.flush().await;
        }

        // The assignment is the authoritative claim; a failed annotation
        // never surrenders the lock.
        let marker = format!(
            "[lock-acquired] worker {} on node {} after {} retries\n{}",
            options.worker_id,
            options.node_id,
            retries,
            serde_json::to_string(&record).unwrap_or_default()
        );
        if let Err(e) = self.tickets.annotate(task_id, &marker).await {
            tracing::warn!(task_id = %task_id, error = %e, "Acquisition annotation failed");
        }

        let refresher = self.spawn_refresher(&record);
        self.held.lock().unwrap().insert(
            task_id,
            HeldLock {
                record: record.clone(),
                since: started,
                refresher,
            },
        );

        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.task_acquired(task_id);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.acquire_ms_total.fetch_add(duration_ms, Ordering::Relaxed);
        metrics::counter!("lock.acquisitions").increment(1);
        metrics::histogram!("lock.acquire_ms").record(duration_ms as f64);

        self.events.publish(CoordinationEvent::LockAcquired {
            task_id,
            worker_id: options.worker_id,
            retries,
        });
        tracing::info!(
            task_id = %task_id,
            worker_id = %options.worker_id,
            retries = retries,
            duration_ms = duration_ms,
            "Lock acquired"
        );

        let status = if self.cancelled() {
            AcquireStatus::AcquiredBeforeCancel
        } else {
            AcquireStatus::Acquired
        };

        AcquireOutcome {
            task_id,
            status,
            record: Some(record),
            retries,
            duration_ms,
            reason: None,
        }
    }

    /// Release the lock on `task_id` held by `worker_id`.
    pub async fn release(&self, task_id: TaskId, worker_id: WorkerId) -> ReleaseOutcome {
        let worker = worker_id.to_string();

        // Step 1: stop heartbeat registration before touching the store.
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer.task_released(task_id);
        }

        let held = self.held.lock().unwrap().remove(&task_id);
        let held_ms = held.as_ref().map(|h| h.since.elapsed().as_millis() as u64);

        // Stop the per-task record refresher before the record is deleted,
        // so it can't resurrect the key afterwards.
        if let Some(held) = held {
            held.refresher.abort();
            let _ = held.refresher.await;
        }

        let ticket = match self.tickets.fetch_ticket(task_id).await {
            Ok(ticket) => ticket,
            Err(e) => {
                return ReleaseOutcome {
                    task_id,
                    released: false,
                    held_ms,
                    reason: Some(e.to_string()),
                };
            }
        };

        // Step 2: already unassigned — clean up the record and succeed.
        let Some(current) = ticket.assignee() else {
            let _ = self.memory.delete(&keys::task_lock(task_id)).await;
            self.releases.fetch_add(1, Ordering::Relaxed);
            return ReleaseOutcome {
                task_id,
                released: true,
                held_ms,
                reason: None,
            };
        };

        // Step 3: held by someone else — fatal, never retried.
        if current != worker {
            return ReleaseOutcome {
                task_id,
                released: false,
                held_ms,
                reason: Some(format!("lock held by {}", current)),
            };
        }

        // Step 4: unassign, annotate, drop the record.
        if let Err(e) = self.tickets.unassign_ticket(task_id, &worker).await {
            return ReleaseOutcome {
                task_id,
                released: false,
                held_ms,
                reason: Some(e.to_string()),
            };
        }

        let marker = match held_ms {
            Some(ms) => format!("[lock-released] worker {} held for {} ms", worker, ms),
            None => format!("[lock-released] worker {}", worker),
        };
        if let Err(e) = self.tickets.annotate(task_id, &marker).await {
            tracing::warn!(task_id = %task_id, error = %e, "Release annotation failed");
        }

        if let Err(e) = self.memory.delete(&keys::task_lock(task_id)).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to delete lock record");
        }

        self.releases.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lock.releases").increment(1);
        self.events.publish(CoordinationEvent::LockReleased {
            task_id,
            worker_id,
            held_ms: held_ms.unwrap_or(0),
        });
        tracing::info!(task_id = %task_id, worker_id = %worker_id, "Lock released");

        ReleaseOutcome {
            task_id,
            released: true,
            held_ms,
            reason: None,
        }
    }

    /// Inspect a task's lock without touching it.
    pub async fn get_lock_status(&self, task_id: TaskId) -> Result<LockStatus> {
        let ticket = self.tickets.fetch_ticket(task_id).await?;

        let record = match self.memory.read(&keys::task_lock(task_id)).await? {
            Some(value) => serde_json::from_value::<LockRecord>(value).ok(),
            None => None,
        };

        let stale = record.as_ref().is_some_and(|r| {
            (Utc::now() - r.last_heartbeat).num_milliseconds() > self.config.lock_timeout_ms as i64
        });

        Ok(LockStatus {
            task_id,
            locked: ticket.assignee().is_some(),
            owner: ticket.assignee().map(str::to_string),
            record,
            stale,
        })
    }

    /// Task ids currently held by this process.
    pub fn held_tasks(&self) -> Vec<TaskId> {
        self.held.lock().unwrap().keys().copied().collect()
    }

    pub fn get_metrics(&self) -> LockMetrics {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        let total_ms = self.acquire_ms_total.load(Ordering::Relaxed);
        LockMetrics {
            acquisitions,
            releases: self.releases.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
            stale_locks_claimed: self.stale_locks_claimed.load(Ordering::Relaxed),
            avg_acquire_ms: if acquisitions == 0 {
                0.0
            } else {
                total_ms as f64 / acquisitions as f64
            },
        }
    }

    /// Consume one retry from the budget and sleep the appropriate backoff.
    async fn retry_pause(
        &self,
        cause: &SentinelError,
        retries: &mut u32,
        max_retries: u32,
    ) -> RetryVerdict {
        if *retries >= max_retries {
            return RetryVerdict::Exhausted;
        }
        *retries += 1;
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lock.retries").increment(1);

        let backoff = if cause.is_rate_limited() {
            Duration::from_millis(self.config.rate_limit_backoff_ms)
        } else {
            self.exponential_backoff(*retries - 1)
        };

        tracing::debug!(
            retry = *retries,
            backoff_ms = backoff.as_millis() as u64,
            cause = %cause,
            "Acquire retrying"
        );

        if self.sleep_cancellable(backoff).await {
            RetryVerdict::Cancelled
        } else {
            RetryVerdict::Continue
        }
    }

    /// Doubling backoff from the configured floor to the ceiling, with up
    /// to 20% jitter.
    fn exponential_backoff(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .initial_backoff_ms
            .saturating_mul(1u64 << attempt.min(31))
            .min(self.config.max_backoff_ms);
        let jitter = (base as f64 * 0.2 * rand::random::<f64>()) as u64;
        Duration::from_millis(base + jitter)
    }

    /// Sleep unless shutdown fires first. Returns true when cancelled.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
        }
    }

    fn fail(
        &self,
        task_id: TaskId,
        status: AcquireStatus,
        retries: u32,
        started: Instant,
        reason: Option<String>,
    ) -> AcquireOutcome {
        self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lock.acquire.failures").increment(1);
        tracing::warn!(
            task_id = %task_id,
            status = ?status,
            retries = retries,
            reason = reason.as_deref().unwrap_or(""),
            "Lock acquisition failed"
        );
        AcquireOutcome {
            task_id,
            status,
            record: None,
            retries,
            duration_ms: started.elapsed().as_millis() as u64,
            reason,
        }
    }
}

enum RetryVerdict {
    Continue,
    Exhausted,
    Cancelled,
}
