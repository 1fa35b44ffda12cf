//! Host execution context wiring task, approval and action steps to real services.
//!
//! [`HostExecutionContext`] implements the `StepExecutionContext` trait from
//! tenure-core:
//! - tasks and approvals are persisted in the SQLite work item store
//! - actions are POSTed to `{action_base_url}/{action}` when a base URL is
//!   configured, and only recorded in the log otherwise

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tenure_core::workflow::collaborators::{
    BoxFuture, CollaboratorError, HttpRequest, HttpTransport, StepExecutionContext,
    WorkItemRequest,
};
use tenure_types::error::RepositoryError;
use tenure_types::instance::WorkItemStatus;
use tenure_types::workflow::HttpMethod;

use crate::sqlite::work_item::SqliteWorkItemStore;

pub struct HostExecutionContext {
    items: SqliteWorkItemStore,
    http: Arc<dyn HttpTransport>,
    action_base_url: Option<String>,
    action_timeout: Duration,
}

impl HostExecutionContext {
    pub fn new(
        items: SqliteWorkItemStore,
        http: Arc<dyn HttpTransport>,
        action_base_url: Option<String>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            items,
            http,
            action_base_url: action_base_url.map(|u| u.trim_end_matches('/').to_string()),
            action_timeout,
        }
    }

    async fn create_item(&self, request: WorkItemRequest) -> Result<String, CollaboratorError> {
        let item = self.items.create(&request).await.map_err(store_error)?;
        tracing::info!(
            instance_id = %item.instance_id,
            step_id = item.step_id.as_str(),
            item_id = item.id.as_str(),
            kind = ?item.kind,
            assignee = item.assignee.as_deref().unwrap_or("unassigned"),
            "work item created"
        );
        Ok(item.id)
    }

    async fn statuses(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, WorkItemStatus>, CollaboratorError> {
        self.items.statuses(&ids).await.map_err(store_error)
    }

    async fn run_action(&self, action: String, parameters: Value) -> Result<Value, CollaboratorError> {
        let Some(base) = &self.action_base_url else {
            tracing::info!(
                action = action.as_str(),
                parameters = %parameters,
                "no action endpoint configured, action recorded only"
            );
            return Ok(json!({ "action": action, "status": "recorded" }));
        };

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let response = self
            .http
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: format!("{base}/{action}"),
                headers,
                body: Some(parameters.to_string()),
                timeout: self.action_timeout,
            })
            .await?;

        if !response.is_success() {
            return Err(CollaboratorError::Rejected(format!(
                "action '{action}' returned HTTP {}",
                response.status
            )));
        }

        tracing::info!(action = action.as_str(), status = response.status, "action executed");

        if response.body.trim().is_empty() {
            return Ok(json!({ "action": action, "status": "executed" }));
        }
        Ok(serde_json::from_str(&response.body).unwrap_or(Value::String(response.body)))
    }
}

fn store_error(err: RepositoryError) -> CollaboratorError {
    match err {
        RepositoryError::NotFound => CollaboratorError::NotFound("work item".to_string()),
        other => CollaboratorError::Transport(other.to_string()),
    }
}

impl StepExecutionContext for HostExecutionContext {
    fn create_work_item(
        &self,
        request: WorkItemRequest,
    ) -> BoxFuture<'_, Result<String, CollaboratorError>> {
        Box::pin(self.create_item(request))
    }

    fn work_item_statuses(
        &self,
        item_ids: &[String],
    ) -> BoxFuture<'_, Result<HashMap<String, WorkItemStatus>, CollaboratorError>> {
        Box::pin(self.statuses(item_ids.to_vec()))
    }

    fn execute_action(
        &self,
        action: &str,
        parameters: &Value,
    ) -> BoxFuture<'_, Result<Value, CollaboratorError>> {
        Box::pin(self.run_action(action.to_string(), parameters.clone()))
    }
}
