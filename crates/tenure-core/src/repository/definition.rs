//! Workflow definition repository trait.
//!
//! The infrastructure layer (tenure-infra) implements this trait with SQLite
//! persistence; the engine and the definition service only see the trait.

use tenure_types::error::RepositoryError;
use tenure_types::workflow::{ProcessType, WorkflowDefinition};
use uuid::Uuid;

/// Repository trait for workflow definition persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    /// Get a definition by its UUID.
    fn get_by_id(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get a definition by its lookup code.
    fn get_by_code(
        &self,
        code: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get the definition flagged as default for a process type.
    fn get_default_for_type(
        &self,
        process_type: ProcessType,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Insert a new definition. Fails with `Conflict` on a duplicate code.
    fn create(
        &self,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, RepositoryError>> + Send;

    /// Replace an existing definition by ID.
    fn update(
        &self,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, RepositoryError>> + Send;

    /// List definitions, optionally restricted to one process type.
    fn list_by_type(
        &self,
        process_type: Option<ProcessType>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    fn increment_usage_count(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Store the percentage (0-100) of finished instances that completed.
    fn update_success_rate(
        &self,
        id: &Uuid,
        success_rate: f64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_average_completion_time(
        &self,
        id: &Uuid,
        average_minutes: f64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
