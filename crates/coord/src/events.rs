use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use sentinel_common::ids::{TaskId, WorkerId};

/// Typed coordination events, published on a broadcast bus.
///
/// Consumers receive over their own `broadcast::Receiver` and can never
/// block publishers; a receiver that falls behind loses the oldest events
/// (lag is surfaced by the channel, not by the publisher).
#[derive(Clone, Debug)]
pub enum CoordinationEvent {
    WorkerRegistered {
        worker_id: WorkerId,
    },
    WorkerDeregistered {
        worker_id: WorkerId,
    },
    LockAcquired {
        task_id: TaskId,
        worker_id: WorkerId,
        retries: u32,
    },
    LockReleased {
        task_id: TaskId,
        worker_id: WorkerId,
        held_ms: u64,
    },
    StaleLockRecovered {
        task_id: TaskId,
        owner: WorkerId,
        /// None when the owner never published a heartbeat.
        stale_ms: Option<u64>,
    },
    ConflictResolved {
        key: String,
        strategy: &'static str,
        discarded: usize,
    },
    HeartbeatFailure {
        worker_id: WorkerId,
        consecutive: u32,
    },
    /// Emitted after three consecutive failed heartbeat cycles.
    CriticalAlert {
        worker_id: WorkerId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl CoordinationEvent {
    /// Short tag for logging and ephemeral event keys.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerRegistered { .. } => "worker-registered",
            Self::WorkerDeregistered { .. } => "worker-deregistered",
            Self::LockAcquired { .. } => "lock-acquired",
            Self::LockReleased { .. } => "lock-released",
            Self::StaleLockRecovered { .. } => "stale-lock-recovered",
            Self::ConflictResolved { .. } => "conflict-resolved",
            Self::HeartbeatFailure { .. } => "heartbeat-failure",
            Self::CriticalAlert { .. } => "critical-alert",
        }
    }
}

/// Broadcast bus shared by every coordination component.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordinationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: CoordinationEvent) {
        tracing::debug!(event = event.kind(), "Coordination event");
        metrics::counter!("events.published", "kind" => event.kind()).increment(1);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
