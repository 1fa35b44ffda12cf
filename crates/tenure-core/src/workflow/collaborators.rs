//! Narrow traits for the systems the engine talks to but does not own.
//!
//! All traits are dyn-compatible (boxed futures) so the engine can hold them
//! as `Arc<dyn ...>` and the infrastructure layer can swap implementations.
//!
//! - [`StepExecutionContext`] -- tasks, approvals and named actions
//! - [`NotificationDispatcher`] -- fire-and-forget stakeholder notifications
//! - [`ProcessStatusSync`] -- pushes instance status to the owning process
//! - [`HttpTransport`] -- generic request/response for webhook steps

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tenure_types::instance::{InstanceStatus, WorkItemStatus};
use tenure_types::workflow::HttpMethod;
use uuid::Uuid;

/// Boxed, `Send` future used by every collaborator method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors reported by collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Work items (tasks, approvals) and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    Task,
    Approval,
}

/// A task or approval to be created in the host application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemRequest {
    pub kind: WorkItemKind,
    pub instance_id: Uuid,
    pub process_id: String,
    pub step_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Resolved assignee (`user-id`, `role:<name>` or `manager:<id>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Host-side execution surface for task, approval and action steps.
pub trait StepExecutionContext: Send + Sync {
    /// Create a task or approval and return its external ID.
    fn create_work_item(
        &self,
        request: WorkItemRequest,
    ) -> BoxFuture<'_, Result<String, CollaboratorError>>;

    /// Current status of each requested item. Unknown IDs are omitted.
    fn work_item_statuses(
        &self,
        item_ids: &[String],
    ) -> BoxFuture<'_, Result<HashMap<String, WorkItemStatus>, CollaboratorError>>;

    /// Run a named side-effecting action with resolved parameters.
    fn execute_action(
        &self,
        action: &str,
        parameters: &Value,
    ) -> BoxFuture<'_, Result<Value, CollaboratorError>>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    SlaBreach,
    Escalation,
    /// Sent by a `notification` step.
    Step,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub instance_id: Uuid,
    pub process_id: String,
    pub workflow_title: String,
    pub recipient_ids: Vec<String>,
    pub recipient_emails: Vec<String>,
    pub subject: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl Notification {
    pub fn has_recipients(&self) -> bool {
        !self.recipient_ids.is_empty() || !self.recipient_emails.is_empty()
    }
}

pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notification: Notification) -> BoxFuture<'_, Result<(), CollaboratorError>>;
}

/// Recorded result of a best-effort notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Delivered,
    Failed(String),
    /// Nothing to send (no recipients or the event is switched off).
    Skipped(String),
}

impl NotificationOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, NotificationOutcome::Delivered)
    }
}

/// Dispatch a notification, converting every failure into an outcome.
pub async fn notify_best_effort(
    dispatcher: &dyn NotificationDispatcher,
    notification: Notification,
) -> NotificationOutcome {
    if !notification.has_recipients() {
        return NotificationOutcome::Skipped("no recipients".to_string());
    }

    let event = notification.event;
    let instance_id = notification.instance_id;
    match dispatcher.dispatch(notification).await {
        Ok(()) => NotificationOutcome::Delivered,
        Err(e) => {
            tracing::warn!(
                instance_id = %instance_id,
                event = ?event,
                error = %e,
                "notification dispatch failed"
            );
            NotificationOutcome::Failed(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Process status sync
// ---------------------------------------------------------------------------

/// Pushes instance status transitions to the owning business process.
pub trait ProcessStatusSync: Send + Sync {
    fn sync_status(
        &self,
        process_id: &str,
        status: InstanceStatus,
        instance_id: Uuid,
    ) -> BoxFuture<'_, Result<(), CollaboratorError>>;
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpTransport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, CollaboratorError>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingDispatcher;

    impl NotificationDispatcher for FailingDispatcher {
        fn dispatch(&self, _n: Notification) -> BoxFuture<'_, Result<(), CollaboratorError>> {
            Box::pin(async { Err(CollaboratorError::Transport("smtp down".to_string())) })
        }
    }

    fn notification(recipients: Vec<String>) -> Notification {
        Notification {
            event: NotificationEvent::WorkflowCompleted,
            instance_id: Uuid::now_v7(),
            process_id: "p-1".to_string(),
            workflow_title: "Joiner".to_string(),
            recipient_ids: recipients,
            recipient_emails: vec![],
            subject: "done".to_string(),
            message: "done".to_string(),
            template: None,
        }
    }

    #[tokio::test]
    async fn test_best_effort_records_failure() {
        let outcome = notify_best_effort(&FailingDispatcher, notification(vec!["u1".into()])).await;
        assert_eq!(
            outcome,
            NotificationOutcome::Failed("transport error: smtp down".to_string())
        );
        assert!(!outcome.is_delivered());
    }

    #[tokio::test]
    async fn test_best_effort_skips_without_recipients() {
        let outcome = notify_best_effort(&FailingDispatcher, notification(vec![])).await;
        assert!(matches!(outcome, NotificationOutcome::Skipped(_)));
    }

    #[test]
    fn test_http_response_success_range() {
        let mut res = HttpResponse {
            status: 204,
            headers: HashMap::new(),
            body: String::new(),
        };
        assert!(res.is_success());
        res.status = 302;
        assert!(!res.is_success());
    }
}
