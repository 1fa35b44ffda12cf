//! Process status sync adapters.
//!
//! [`HttpStatusSync`] POSTs every status transition to the configured
//! callback URL; the engine wraps each call in its retry policy and
//! dead-letters exhausted attempts. [`NoopStatusSync`] is used when no
//! callback is configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tenure_core::workflow::collaborators::{
    BoxFuture, CollaboratorError, HttpRequest, HttpTransport, ProcessStatusSync,
};
use tenure_types::instance::InstanceStatus;
use tenure_types::workflow::HttpMethod;
use uuid::Uuid;

pub struct HttpStatusSync {
    transport: Arc<dyn HttpTransport>,
    url: String,
    timeout: Duration,
}

impl HttpStatusSync {
    pub fn new(transport: Arc<dyn HttpTransport>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            url: url.into(),
            timeout,
        }
    }

    async fn push(
        &self,
        process_id: String,
        status: InstanceStatus,
        instance_id: Uuid,
    ) -> Result<(), CollaboratorError> {
        let body = json!({
            "process_id": process_id,
            "status": status,
            "instance_id": instance_id,
        });
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let response = self
            .transport
            .send(HttpRequest {
                method: HttpMethod::Post,
                url: self.url.clone(),
                headers,
                body: Some(body.to_string()),
                timeout: self.timeout,
            })
            .await?;

        if !response.is_success() {
            return Err(CollaboratorError::Rejected(format!(
                "status callback returned HTTP {}",
                response.status
            )));
        }

        tracing::debug!(
            process_id = process_id.as_str(),
            instance_id = %instance_id,
            status = %status,
            "process status synced"
        );
        Ok(())
    }
}

impl ProcessStatusSync for HttpStatusSync {
    fn sync_status(
        &self,
        process_id: &str,
        status: InstanceStatus,
        instance_id: Uuid,
    ) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        Box::pin(self.push(process_id.to_string(), status, instance_id))
    }
}

/// Accepts every transition without calling anything.
pub struct NoopStatusSync;

impl ProcessStatusSync for NoopStatusSync {
    fn sync_status(
        &self,
        process_id: &str,
        status: InstanceStatus,
        instance_id: Uuid,
    ) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        tracing::debug!(
            process_id,
            instance_id = %instance_id,
            status = %status,
            "no sync callback configured, skipping status sync"
        );
        Box::pin(async { Ok(()) })
    }
}
