use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use sentinel_common::ids::{TaskId, WorkerId};
use sentinel_common::{keys, Result};

use crate::memory::{MemorySynchronizer, WriteOptions};

/// Opaque advisory locks scoped to a task, distinct from the primary
/// ticket-backed lock.
///
/// Best-effort: the memory backend has no compare-and-set, so two holders
/// racing within one flush window can both observe success. Callers use
/// these to partition work inside a claim they already own exclusively, not
/// to guard external resources.
pub struct AdvisoryLocks {
    memory: Arc<MemorySynchronizer>,
    ttl_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdvisoryRecord {
    holder: WorkerId,
    acquired_at: chrono::DateTime<Utc>,
    ttl_seconds: u64,
}

impl AdvisoryLocks {
    pub fn new(memory: Arc<MemorySynchronizer>, ttl_seconds: u64) -> Self {
        Self {
            memory,
            ttl_seconds,
        }
    }

    /// Take the named advisory lock. Returns false when another worker
    /// holds an unexpired claim.
    pub async fn acquire(&self, task_id: TaskId, name: &str, holder: WorkerId) -> Result<bool> {
        let key = keys::advisory_lock(task_id, name);

        if let Some(value) = self.memory.read(&key).await? {
            if let Ok(existing) = serde_json::from_value::<AdvisoryRecord>(value) {
                let age = (Utc::now() - existing.acquired_at).num_seconds();
                if existing.holder != holder && age < existing.ttl_seconds as i64 {
                    return Ok(false);
                }
            }
        }

        let record = AdvisoryRecord {
            holder,
            acquired_at: Utc::now(),
            ttl_seconds: self.ttl_seconds,
        };
        self.memory.write(
            &key,
            serde_json::to_value(&record)?,
            WriteOptions::ttl(self.ttl_seconds),
        )?;
        self.memory.flush().await;
        Ok(true)
    }

    /// Drop the named advisory lock if `holder` owns it.
    pub async fn release(&self, task_id: TaskId, name: &str, holder: WorkerId) -> Result<()> {
        let key = keys::advisory_lock(task_id, name);

        if let Some(value) = self.memory.read(&key).await? {
            if let Ok(existing) = serde_json::from_value::<AdvisoryRecord>(value) {
                if existing.holder == holder {
                    self.memory.delete(&key).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::memory::InMemoryBackend;
    use sentinel_common::config::MemoryConfig;

    fn advisory() -> AdvisoryLocks {
        let memory = MemorySynchronizer::new(
            Arc::new(InMemoryBackend::new()),
            WorkerId::new(),
            MemoryConfig::default(),
            EventBus::default(),
        );
        AdvisoryLocks::new(memory, 60)
    }

    #[tokio::test]
    async fn test_second_holder_is_refused_until_release() {
        let locks = advisory();
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        assert!(locks.acquire(TaskId(1), "stage-a", w1).await.unwrap());
        assert!(!locks.acquire(TaskId(1), "stage-a", w2).await.unwrap());
        // Re-entrant for the same holder.
        assert!(locks.acquire(TaskId(1), "stage-a", w1).await.unwrap());

        locks.release(TaskId(1), "stage-a", w1).await.unwrap();
        assert!(locks.acquire(TaskId(1), "stage-a", w2).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_a_no_op() {
        let locks = advisory();
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        locks.acquire(TaskId(1), "stage-a", w1).await.unwrap();
        locks.release(TaskId(1), "stage-a", w2).await.unwrap();

        assert!(!locks.acquire(TaskId(1), "stage-a", w2).await.unwrap());
    }

    #[tokio::test]
    async fn test_independent_names_do_not_contend() {
        let locks = advisory();
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();

        assert!(locks.acquire(TaskId(1), "stage-a", w1).await.unwrap());
        assert!(locks.acquire(TaskId(1), "stage-b", w2).await.unwrap());
    }
}
