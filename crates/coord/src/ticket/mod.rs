//! Ticket store adapter.
//!
//! The external ticket store is the consensus primitive of the whole system:
//! its atomic "assign if unassigned" operation decides lock ownership. The
//! adapter exposes the minimal contract the core needs; everything else about
//! the backing service is implementation-local.

mod http;
mod memory;

pub use http::HttpTicketStore;
pub use memory::InMemoryTicketStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sentinel_common::ids::TaskId;
use sentinel_common::Result;

/// Ticket workflow state. Labels are implementation-defined; the core only
/// distinguishes "waiting in the queue" from everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Queued,
    InProgress,
    Done,
}

/// An append-only annotation on a ticket. Old acquisition markers are never
/// pruned, so readers must tolerate any number of historical markers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Ticket state as read from the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TaskId,
    /// Worker id strings. At most one entry when the store enforces
    /// single-assignee semantics.
    pub assignees: Vec<String>,
    pub state: TicketState,
    pub annotations: Vec<Annotation>,
    pub last_updated: DateTime<Utc>,
}

impl Ticket {
    /// The current assignee, if exactly the single-owner invariant holds.
    pub fn assignee(&self) -> Option<&str> {
        self.assignees.first().map(String::as_str)
    }

    /// Whether `worker` is the sole assignee.
    pub fn assigned_to(&self, worker: &str) -> bool {
        self.assignees.len() == 1 && self.assignees[0] == worker
    }
}

/// Minimal contract over the external ticket system.
///
/// `assign_ticket` is the consensus primitive: the store must refuse to
/// assign an already-assigned ticket, and the adapter reports that as
/// `Ok(false)` — conflict is an outcome, not an error. Transport failures
/// are errors and surface to the caller.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Read current ticket state. `NotFound` when the ticket doesn't exist.
    async fn fetch_ticket(&self, id: TaskId) -> Result<Ticket>;

    /// Atomically assign the ticket to `assignee` if currently unassigned.
    /// Returns `false` when already assigned to another party.
    async fn assign_ticket(&self, id: TaskId, assignee: &str) -> Result<bool>;

    /// Remove `assignee` from the ticket. Idempotent: unassigning a ticket
    /// the worker doesn't hold is a no-op.
    async fn unassign_ticket(&self, id: TaskId, assignee: &str) -> Result<()>;

    /// Append an annotation. Append-only; never overwrites.
    async fn annotate(&self, id: TaskId, body: &str) -> Result<()>;

    /// Transition the ticket back to the queued state, used by stale-lock
    /// recovery to return work to the pool.
    async fn mark_queued(&self, id: TaskId) -> Result<()>;
}
