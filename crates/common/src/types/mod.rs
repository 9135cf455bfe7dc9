mod heartbeat;
mod lock;
mod task;
mod worker;

pub use heartbeat::{HeartbeatPayload, ResourceMetrics};
pub use lock::{LockRecord, TaskMetadata};
pub use task::{TaskPriority, TaskRequirements};
pub use worker::{
    HealthStatus, WorkerMetrics, WorkerRecord, WorkerRegistration, WorkerStatus,
};
