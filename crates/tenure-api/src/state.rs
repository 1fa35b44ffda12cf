//! Application state wiring the engine to its infrastructure.
//!
//! The engine and definition service are generic over repository traits;
//! `AppState` pins them to the SQLite implementations and builds the
//! collaborator set from `config.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tenure_core::service::definition::DefinitionService;
use tenure_core::workflow::collaborators::{HttpTransport, ProcessStatusSync};
use tenure_core::workflow::dead_letter::DeadLetterQueue;
use tenure_core::workflow::engine::{Collaborators, WorkflowEngine};
use tenure_infra::config::load_engine_config;
use tenure_infra::sqlite::definition::SqliteDefinitionRepository;
use tenure_infra::sqlite::instance::SqliteInstanceRepository;
use tenure_infra::sqlite::pool::DatabasePool;
use tenure_infra::sqlite::work_item::SqliteWorkItemStore;
use tenure_infra::workflow::execution_context::HostExecutionContext;
use tenure_infra::workflow::http::ReqwestTransport;
use tenure_infra::workflow::notifier::TracingNotifier;
use tenure_infra::workflow::status_sync::{HttpStatusSync, NoopStatusSync};
use tenure_types::config::EngineConfig;

pub type ConcreteEngine = WorkflowEngine<SqliteDefinitionRepository, SqliteInstanceRepository>;

pub type ConcreteDefinitionService = DefinitionService<SqliteDefinitionRepository>;

/// Shared application state used by every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub definitions: Arc<ConcreteDefinitionService>,
    pub work_items: SqliteWorkItemStore,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database in `data_dir`, load `config.toml` and wire services.
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let config = load_engine_config(data_dir).await;
        let db_pool = DatabasePool::open_in(data_dir).await?;
        let work_items = SqliteWorkItemStore::new(db_pool.clone());

        let call_timeout = Duration::from_millis(config.default_webhook_timeout_ms);
        let http: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
        let status_sync: Arc<dyn ProcessStatusSync> = match &config.sync_callback_url {
            Some(url) => Arc::new(HttpStatusSync::new(Arc::clone(&http), url.clone(), call_timeout)),
            None => Arc::new(NoopStatusSync),
        };
        let execution = HostExecutionContext::new(
            work_items.clone(),
            Arc::clone(&http),
            config.action_base_url.clone(),
            call_timeout,
        );

        let collaborators = Collaborators {
            execution: Arc::new(execution),
            notifier: Arc::new(TracingNotifier),
            status_sync,
            http,
        };

        let engine = WorkflowEngine::new(
            SqliteDefinitionRepository::new(db_pool.clone()),
            SqliteInstanceRepository::new(db_pool.clone()),
            collaborators,
            Arc::new(DeadLetterQueue::new()),
            config.clone(),
        );
        let definitions = DefinitionService::new(SqliteDefinitionRepository::new(db_pool));

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            engine: Arc::new(engine),
            definitions: Arc::new(definitions),
            work_items,
            config,
            data_dir: data_dir.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenure_core::service::definition::ImportOptions;
    use tenure_core::workflow::engine::{DefinitionSelector, StartOptions};
    use tenure_types::instance::{InstanceStatus, WorkItemStatus};
    use tenure_types::workflow::ProcessType;

    const JOINER: &str = r#"
title: Joiner with approval
code: joiner-approval
process_type: joiner
steps:
  - { id: start, name: Start, order: 1, config: { type: start } }
  - id: approve
    name: Manager approval
    order: 2
    config:
      type: approval
      approver: { type: manager }
      due_in_days: 3
      message: Please approve the new starter
  - { id: end, name: End, order: 3, config: { type: end } }
"#;

    #[tokio::test]
    async fn test_open_creates_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("tenure");
        let state = AppState::open(&dir).await.unwrap();
        assert!(dir.join("tenure.db").exists());
        assert_eq!(state.data_dir, dir);
        assert!(state.engine.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_approval_closed_in_store_completes_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::open(tmp.path()).await.unwrap();

        state
            .definitions
            .import_source(JOINER, ImportOptions { activate: true, make_default: true })
            .await
            .unwrap();

        let mut options = StartOptions::new(DefinitionSelector::DefaultFor(ProcessType::Joiner), "P-7");
        options.process_data = serde_json::json!({"manager_id": "mgr-1"});
        let started = state.engine.start_workflow(options).await.unwrap();
        assert_eq!(started.status, InstanceStatus::WaitingForApproval);

        let items = state.work_items.list_for_instance(&started.instance_id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].step_id, "approve");
        assert_eq!(items[0].assignee.as_deref(), Some("mgr-1"));

        state
            .work_items
            .set_status(&items[0].id, WorkItemStatus::Completed)
            .await
            .unwrap();
        let done = state.engine.poll_waiting_steps(&started.instance_id).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.progress_percentage, 100);
    }
}
