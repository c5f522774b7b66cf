//! HTTP client for the authoritative record service.
//!
//! Every successful response is ground truth: the reconciler replaces its
//! optimistic copies with whatever comes back here. The service wraps
//! records in envelopes (`{"task": …}`, `{"tasks": […]}`) and authenticates
//! with a session cookie, which the client's cookie store carries.

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::error::SyncError;
use crate::model::{
    CalendarEvent, EventDraft, EventPatch, Stats, Task, TaskDraft, TaskPatch, User,
};

/// The seam between the reconciliation engine and the authoritative service.
/// Production code uses [`ApiClient`]; tests drive the engine with an
/// in-memory double.
#[allow(async_fn_in_trait)]
pub trait RecordService {
    async fn list_tasks(&self) -> Result<Vec<Task>, SyncError>;
    async fn create_task(&self, draft: &TaskDraft) -> Result<Task, SyncError>;
    async fn update_task(&self, id: i64, patch: &TaskPatch) -> Result<Task, SyncError>;
    async fn delete_task(&self, id: i64) -> Result<(), SyncError>;

    async fn list_events(&self) -> Result<Vec<CalendarEvent>, SyncError>;
    async fn create_event(&self, draft: &EventDraft) -> Result<CalendarEvent, SyncError>;
    async fn update_event(&self, id: i64, patch: &EventPatch) -> Result<CalendarEvent, SyncError>;
    async fn delete_event(&self, id: i64) -> Result<(), SyncError>;
}

#[derive(Deserialize)]
struct TaskEnvelope {
    task: Task,
}

#[derive(Deserialize)]
struct TasksEnvelope {
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Deserialize)]
struct EventEnvelope {
    event: CalendarEvent,
}

#[derive(Deserialize)]
struct EventsEnvelope {
    #[serde(default)]
    events: Vec<CalendarEvent>,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: User,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Clones share the underlying connection pool and cookie jar.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: String,
}

impl ApiClient {
    /// `base` is the service root, e.g. `http://localhost:5000/api`.
    pub fn new(base: impl Into<String>) -> Result<Self, SyncError> {
        let http = Client::builder().cookie_store(true).build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn checked(response: Response) -> Result<Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error)
            .unwrap_or_else(|| "request failed".to_string());
        Err(SyncError::Service { status, message })
    }

    // ── Auth ──

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<User, SyncError> {
        let response = self
            .http
            .post(self.url("/auth/register"))
            .json(&serde_json::json!({
                "username": username,
                "password": password,
                "email": email,
            }))
            .send()
            .await?;
        let envelope: UserEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.user)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<User, SyncError> {
        let response = self
            .http
            .post(self.url("/auth/login"))
            .json(&serde_json::json!({
                "username": username,
                "password": password,
            }))
            .send()
            .await?;
        let envelope: UserEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.user)
    }

    pub async fn logout(&self) -> Result<(), SyncError> {
        let response = self.http.post(self.url("/auth/logout")).send().await?;
        Self::checked(response).await?;
        Ok(())
    }

    /// The logged-in user, or `None` when the session has expired.
    pub async fn me(&self) -> Result<Option<User>, SyncError> {
        let response = self.http.get(self.url("/auth/me")).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let envelope: UserEnvelope = Self::checked(response).await?.json().await?;
        Ok(Some(envelope.user))
    }

    // ── Stats ──

    pub async fn stats(&self) -> Result<Stats, SyncError> {
        let response = self.http.get(self.url("/stats")).send().await?;
        Ok(Self::checked(response).await?.json().await?)
    }

    /// Calendar events within an ISO date range (either bound optional).
    pub async fn events_between(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<CalendarEvent>, SyncError> {
        let mut request = self.http.get(self.url("/calendar"));
        if let Some(start) = start {
            request = request.query(&[("start", start)]);
        }
        if let Some(end) = end {
            request = request.query(&[("end", end)]);
        }
        let envelope: EventsEnvelope =
            Self::checked(request.send().await?).await?.json().await?;
        Ok(envelope.events)
    }
}

impl RecordService for ApiClient {
    async fn list_tasks(&self) -> Result<Vec<Task>, SyncError> {
        let response = self.http.get(self.url("/tasks")).send().await?;
        let envelope: TasksEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.tasks)
    }

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task, SyncError> {
        let response = self
            .http
            .post(self.url("/tasks"))
            .json(draft)
            .send()
            .await?;
        let envelope: TaskEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.task)
    }

    async fn update_task(&self, id: i64, patch: &TaskPatch) -> Result<Task, SyncError> {
        let response = self
            .http
            .put(self.url(&format!("/tasks/{id}")))
            .json(patch)
            .send()
            .await?;
        let envelope: TaskEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.task)
    }

    async fn delete_task(&self, id: i64) -> Result<(), SyncError> {
        let response = self
            .http
            .delete(self.url(&format!("/tasks/{id}")))
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn list_events(&self) -> Result<Vec<CalendarEvent>, SyncError> {
        self.events_between(None, None).await
    }

    async fn create_event(&self, draft: &EventDraft) -> Result<CalendarEvent, SyncError> {
        let response = self
            .http
            .post(self.url("/calendar"))
            .json(draft)
            .send()
            .await?;
        let envelope: EventEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.event)
    }

    async fn update_event(&self, id: i64, patch: &EventPatch) -> Result<CalendarEvent, SyncError> {
        let response = self
            .http
            .put(self.url(&format!("/calendar/{id}")))
            .json(patch)
            .send()
            .await?;
        let envelope: EventEnvelope = Self::checked(response).await?.json().await?;
        Ok(envelope.event)
    }

    async fn delete_event(&self, id: i64) -> Result<(), SyncError> {
        let response = self
            .http
            .delete(self.url(&format!("/calendar/{id}")))
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }
}
