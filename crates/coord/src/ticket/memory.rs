use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use sentinel_common::ids::TaskId;
use sentinel_common::{Result, SentinelError};

use super::{Annotation, Ticket, TicketState, TicketStore};

/// In-process ticket store with genuinely atomic assignment.
///
/// Used by the integration tests and as a reference implementation of the
/// single-assignee contract. Assignment is compare-and-set under a mutex,
/// so concurrent acquires observe exactly one winner.
pub struct InMemoryTicketStore {
    tickets: Mutex<HashMap<TaskId, Ticket>>,
    /// When non-zero, the next N assign calls fail with a transport error.
    fail_assigns: AtomicU32,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            fail_assigns: AtomicU32::new(0),
        }
    }

    /// Seed a queued, unassigned ticket.
    pub fn create_ticket(&self, id: TaskId) {
        let mut tickets = self.tickets.lock().unwrap();
        tickets.insert(
            id,
            Ticket {
                id,
                assignees: Vec::new(),
                state: TicketState::Queued,
                annotations: Vec::new(),
                last_updated: Utc::now(),
            },
        );
    }

    /// Make the next `n` assign calls fail with a transport error.
    pub fn fail_next_assigns(&self, n: u32) {
        self.fail_assigns.store(n, Ordering::SeqCst);
    }

    /// Direct snapshot for test assertions.
    pub fn snapshot(&self, id: TaskId) -> Option<Ticket> {
        self.tickets.lock().unwrap().get(&id).cloned()
    }
}

impl Default for InMemoryTicketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn fetch_ticket(&self, id: TaskId) -> Result<Ticket> {
        self.tickets
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| SentinelError::NotFound(format!("ticket {}", id)))
    }

    async fn assign_ticket(&self, id: TaskId, assignee: &str) -> Result<bool> {
        if self.fail_assigns.load(Ordering::SeqCst) > 0 {
            self.fail_assigns.fetch_sub(1, Ordering::SeqCst);
            return Err(SentinelError::Transport(format!(
                "injected failure assigning ticket {}",
                id
            )));
        }

        let mut tickets = self.tickets.lock().unwrap();
        let ticket = tickets
            .get_mut(&id)
            .ok_or_else(|| SentinelError::NotFound(format!("ticket {}", id)))?;

        if ticket.assignees.iter().any(|a| a != assignee) {
            return Ok(false);
        }
        if ticket.assignees.is_empty() {
            ticket.assignees.push(assignee.to_string());
        }
        ticket.state = TicketState::InProgress;
        ticket.last_updated = Utc::now();
        Ok(true)
    }

    async fn unassign_ticket(&self, id: TaskId, assignee: &str) -> Result<()> {
        let mut tickets = self.tickets.lock().unwrap();
        let ticket = tickets
            .get_mut(&id)
            .ok_or_else(|| SentinelError::NotFound(format!("ticket {}", id)))?;

        ticket.assignees.retain(|a| a != assignee);
        ticket.last_updated = Utc::now();
        Ok(())
    }

    async fn annotate(&self, id: TaskId, body: &str) -> Result<()> {
        let mut tickets = self.tickets.lock().unwrap();
        let ticket = tickets
            .get_mut(&id)
            .ok_or_else(|| SentinelError::NotFound(format!("ticket {}", id)))?;

        ticket.annotations.push(Annotation {
            author: None,
            body: body.to_string(),
            created_at: Utc::now(),
        });
        ticket.last_updated = Utc::now();
        Ok(())
    }

    async fn mark_queued(&self, id: TaskId) -> Result<()> {
        let mut tickets = self.tickets.lock().unwrap();
        let ticket = tickets
            .get_mut(&id)
            .ok_or_else(|| SentinelError::NotFound(format!("ticket {}", id)))?;

        ticket.state = TicketState::Queued;
        ticket.last_updated = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_is_first_writer_wins() {
        let store = InMemoryTicketStore::new();
        store.create_ticket(TaskId(1));

        assert!(store.assign_ticket(TaskId(1), "w1").await.unwrap());
        assert!(!store.assign_ticket(TaskId(1), "w2").await.unwrap());
        // Re-assigning to the current owner is a no-op success.
        assert!(store.assign_ticket(TaskId(1), "w1").await.unwrap());

        let ticket = store.fetch_ticket(TaskId(1)).await.unwrap();
        assert_eq!(ticket.assignees, vec!["w1".to_string()]);
        assert_eq!(ticket.state, TicketState::InProgress);
    }

    #[tokio::test]
    async fn test_unassign_is_idempotent() {
        let store = InMemoryTicketStore::new();
        store.create_ticket(TaskId(1));
        store.assign_ticket(TaskId(1), "w1").await.unwrap();

        store.unassign_ticket(TaskId(1), "w1").await.unwrap();
        store.unassign_ticket(TaskId(1), "w1").await.unwrap();

        let ticket = store.fetch_ticket(TaskId(1)).await.unwrap();
        assert!(ticket.assignees.is_empty());
    }

    #[tokio::test]
    async fn test_missing_ticket_is_not_found() {
        let store = InMemoryTicketStore::new();
        let err = store.fetch_ticket(TaskId(9)).await.unwrap_err();
        assert!(matches!(err, SentinelError::NotFound(_)));
    }
}
