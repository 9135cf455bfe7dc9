//! Shared memory synchronization.
//!
//! A `MemorySynchronizer` fronts an opaque key/value backend with a local
//! LRU cache, a batched pending-write buffer, vector-clock causality and
//! pluggable conflict resolution. It is the transport for every other
//! subsystem's persisted state.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod conflict;
pub mod sync;

pub use backend::{InMemoryBackend, MemoryBackend, RedisBackend};
pub use clock::{ClockOrdering, VectorClock};
pub use conflict::{ConflictResolver, Resolution, ResolverRegistry};
pub use sync::{MemorySynchronizer, SubscriptionId, SyncMetrics, WriteOptions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sentinel_common::ids::WorkerId;

/// A stored value together with its causal and temporal context. Every
/// write produces a new entry; reads return the latest entry after conflict
/// resolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub value: serde_json::Value,
    pub clock: VectorClock,
    pub timestamp: DateTime<Utc>,
    pub owner: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}
