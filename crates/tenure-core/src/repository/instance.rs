//! Workflow instance repository trait.
//!
//! Covers three entity families:
//! - **Instances:** create/update/query workflow executions.
//! - **Step records:** one row per (instance, step) tracking status, retries,
//!   output and the external items created while executing.
//! - **Logs:** append-only audit trail of lifecycle events.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tenure_types::error::RepositoryError;
use tenure_types::instance::{InstanceLogEntry, InstanceStatus, StepRecord, WorkflowInstance};
use uuid::Uuid;

/// Progress counters written whenever the engine moves to a new step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current_step_id: Option<String>,
    pub current_step_name: Option<String>,
    pub completed_steps: u32,
    pub progress_percentage: u8,
}

/// Repository trait for workflow instance persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    fn create(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_by_id(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Replace the full instance row.
    fn update(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update the status (and error message). Terminal statuses also stamp
    /// `completed_at`. Without a new message the old one is kept only while
    /// the status still carries an error (see [`InstanceStatus::carries_error`]).
    fn update_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        error_message: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_progress(
        &self,
        id: &Uuid,
        progress: &ProgressUpdate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_variables(
        &self,
        id: &Uuid,
        variables: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// The non-terminal, top-level (no parent) instance for a process, if any.
    fn get_active_for_process(
        &self,
        process_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Every instance of a definition (used to recompute statistics).
    fn list_by_definition(
        &self,
        definition_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step records
    // -----------------------------------------------------------------------

    fn create_step_record(
        &self,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step_record(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// All step records of an instance, in creation order.
    fn get_step_records(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    /// Mark a step `InProgress`. An existing `started_at` is preserved so
    /// timeouts measured from the first entry survive re-entry.
    fn start_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        started_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn complete_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        output: Option<&Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn skip_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        reason: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn fail_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        error_message: &str,
        output: Option<&Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace a step record wholesale (retry counters, created item IDs, resets).
    fn update_step_record(
        &self,
        record: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------------

    fn add_log(
        &self,
        entry: &InstanceLogEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Log entries of an instance, oldest first.
    fn get_logs(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceLogEntry>, RepositoryError>> + Send;
}
