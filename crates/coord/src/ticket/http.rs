use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use sentinel_common::ids::TaskId;
use sentinel_common::{Result, SentinelError};

use super::{Ticket, TicketState, TicketStore};

/// Typed HTTP client for the ticket service.
///
/// Constructed once per process; `reqwest::Client` pools connections
/// internally. All request parameters travel as JSON bodies or URL path
/// segments built from typed ids — never through a shell.
pub struct HttpTicketStore {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct AssignRequest<'a> {
    assignee: &'a str,
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct StateRequest {
    state: TicketState,
}

#[derive(Deserialize)]
struct TicketDto {
    id: u64,
    #[serde(default)]
    assignees: Vec<String>,
    state: TicketState,
    #[serde(default)]
    annotations: Vec<super::Annotation>,
    last_updated: chrono::DateTime<chrono::Utc>,
}

impl HttpTicketStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Map transport-level failures and throttling responses onto the error
    /// taxonomy. 429 is rate-limiting, everything else non-2xx is transport.
    async fn check(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SentinelError::RateLimited(format!(
                "{}: ticket store throttled",
                context
            )));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(SentinelError::NotFound(context.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SentinelError::Transport(format!(
                "{}: ticket store returned {}: {}",
                context, status, body
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TicketStore for HttpTicketStore {
    async fn fetch_ticket(&self, id: TaskId) -> Result<Ticket> {
        let response = self
            .request(reqwest::Method::GET, &format!("/tickets/{}", id))
            .send()
            .await
            .map_err(|e| SentinelError::Transport(format!("fetch ticket {}: {}", id, e)))?;

        let response = Self::check(response, &format!("ticket {}", id)).await?;

        let dto: TicketDto = response
            .json()
            .await
            .map_err(|e| SentinelError::Transport(format!("parse ticket {}: {}", id, e)))?;

        Ok(Ticket {
            id: TaskId(dto.id),
            assignees: dto.assignees,
            state: dto.state,
            annotations: dto.annotations,
            last_updated: dto.last_updated,
        })
    }

    async fn assign_ticket(&self, id: TaskId, assignee: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::POST, &format!("/tickets/{}/assignees", id))
            .json(&AssignRequest { assignee })
            .send()
            .await
            .map_err(|e| SentinelError::Transport(format!("assign ticket {}: {}", id, e)))?;

        // Conflict is an outcome of the consensus primitive, not an error.
        if response.status() == StatusCode::CONFLICT {
            metrics::counter!("ticket.assign.conflicts").increment(1);
            return Ok(false);
        }

        Self::check(response, &format!("assign ticket {}", id)).await?;
        metrics::counter!("ticket.assign.ok").increment(1);
        Ok(true)
    }

    async fn unassign_ticket(&self, id: TaskId, assignee: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/tickets/{}/assignees/{}", id, assignee),
            )
            .send()
            .await
            .map_err(|e| SentinelError::Transport(format!("unassign ticket {}: {}", id, e)))?;

        // A missing assignment means someone already removed it. Idempotent.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        Self::check(response, &format!("unassign ticket {}", id)).await?;
        Ok(())
    }

    async fn annotate(&self, id: TaskId, body: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/tickets/{}/annotations", id),
            )
            .json(&AnnotateRequest { body })
            .send()
            .await
            .map_err(|e| SentinelError::Transport(format!("annotate ticket {}: {}", id, e)))?;

        Self::check(response, &format!("annotate ticket {}", id)).await?;
        Ok(())
    }

    async fn mark_queued(&self, id: TaskId) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/tickets/{}/state", id))
            .json(&StateRequest {
                state: TicketState::Queued,
            })
            .send()
            .await
            .map_err(|e| SentinelError::Transport(format!("requeue ticket {}: {}", id, e)))?;

        Self::check(response, &format!("requeue ticket {}", id)).await?;
        Ok(())
    }
}
