//! In-memory repositories and recording collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tenure_types::config::EngineConfig;
use tenure_types::error::RepositoryError;
use tenure_types::instance::{
    InstanceLogEntry, InstanceStatus, StepRecord, StepStatus, WorkItemStatus, WorkflowInstance,
};
use tenure_types::workflow::{
    DefinitionStats, NotificationSettings, ProcessType, RetryPolicy, StepConfig, StepDefinition,
    WorkflowDefinition,
};
use uuid::Uuid;

use crate::repository::definition::DefinitionRepository;
use crate::repository::instance::{InstanceRepository, ProgressUpdate};
use crate::workflow::collaborators::{
    BoxFuture, CollaboratorError, HttpRequest, HttpResponse, HttpTransport, Notification,
    NotificationDispatcher, ProcessStatusSync, StepExecutionContext, WorkItemKind,
    WorkItemRequest,
};
use crate::workflow::context::EvaluationContext;
use crate::workflow::dead_letter::DeadLetterQueue;
use crate::workflow::engine::{Collaborators, WorkflowEngine};
use crate::workflow::step_runner::StepContext;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn step(id: &str, order: u32, config: StepConfig) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: id.replace('-', " "),
        order,
        conditions: Vec::new(),
        on_complete: None,
        retry: None,
        config,
    }
}

/// An active joiner definition with the given steps.
pub fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
    let now = Utc::now();
    WorkflowDefinition {
        id: Uuid::now_v7(),
        title: "Standard joiner".to_string(),
        code: "standard-joiner".to_string(),
        description: None,
        version: 1,
        process_type: ProcessType::Joiner,
        is_active: true,
        is_default: false,
        steps,
        variables: Vec::new(),
        triggers: Vec::new(),
        notifications: NotificationSettings {
            recipient_ids: vec!["hr-admin".to_string()],
            ..NotificationSettings::default()
        },
        stats: DefinitionStats::default(),
        created_at: now,
        updated_at: now,
    }
}

pub fn step_context(process: Value) -> StepContext {
    StepContext::new(
        Uuid::now_v7(),
        "proc-1",
        EvaluationContext {
            process,
            ..Default::default()
        },
    )
}

// ---------------------------------------------------------------------------
// In-memory definition repository
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryDefinitions {
    inner: Arc<Mutex<HashMap<Uuid, WorkflowDefinition>>>,
}

impl MemoryDefinitions {
    fn with<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, WorkflowDefinition>) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn stats(&self, id: &Uuid) -> DefinitionStats {
        self.with(|m| m[id].stats.clone())
    }
}

impl DefinitionRepository for MemoryDefinitions {
    async fn get_by_id(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|m| m.get(id).cloned()))
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|m| m.values().find(|d| d.code == code).cloned()))
    }

    async fn get_default_for_type(
        &self,
        process_type: ProcessType,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.with(|m| {
            m.values()
                .find(|d| d.process_type == process_type && d.is_default && d.is_active)
                .cloned()
        }))
    }

    async fn create(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        self.with(|m| {
            if m.values().any(|d| d.code == definition.code) {
                return Err(RepositoryError::Conflict(format!(
                    "definition code '{}' already exists",
                    definition.code
                )));
            }
            m.insert(definition.id, definition.clone());
            Ok(definition.clone())
        })
    }

    async fn update(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        self.with(|m| match m.get_mut(&definition.id) {
            Some(existing) => {
                *existing = definition.clone();
                Ok(definition.clone())
            }
            None => Err(RepositoryError::NotFound),
        })
    }

    async fn list_by_type(
        &self,
        process_type: Option<ProcessType>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> = self.with(|m| {
            m.values()
                .filter(|d| process_type.is_none_or(|t| d.process_type == t))
                .cloned()
                .collect()
        });
        defs.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(defs)
    }

    async fn increment_usage_count(&self, id: &Uuid) -> Result<(), RepositoryError> {
        self.with(|m| {
            let def = m.get_mut(id).ok_or(RepositoryError::NotFound)?;
            def.stats.usage_count += 1;
            Ok(())
        })
    }

    async fn update_success_rate(&self, id: &Uuid, success_rate: f64) -> Result<(), RepositoryError> {
        self.with(|m| {
            let def = m.get_mut(id).ok_or(RepositoryError::NotFound)?;
            def.stats.success_rate = Some(success_rate);
            Ok(())
        })
    }

    async fn update_average_completion_time(
        &self,
        id: &Uuid,
        average_minutes: f64,
    ) -> Result<(), RepositoryError> {
        self.with(|m| {
            let def = m.get_mut(id).ok_or(RepositoryError::NotFound)?;
            def.stats.average_completion_minutes = Some(average_minutes);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory instance repository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InstanceStore {
    instances: HashMap<Uuid, WorkflowInstance>,
    steps: HashMap<(Uuid, String), StepRecord>,
    /// Step insertion order per instance.
    step_order: HashMap<Uuid, Vec<String>>,
    logs: Vec<InstanceLogEntry>,
}

#[derive(Clone, Default)]
pub struct MemoryInstances {
    inner: Arc<Mutex<InstanceStore>>,
}

impl MemoryInstances {
    fn with<R>(&self, f: impl FnOnce(&mut InstanceStore) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    fn with_step<R>(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        f: impl FnOnce(&mut StepRecord) -> R,
    ) -> Result<R, RepositoryError> {
        self.with(|s| {
            s.steps
                .get_mut(&(*instance_id, step_id.to_string()))
                .map(f)
                .ok_or(RepositoryError::NotFound)
        })
    }

    fn with_instance<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut WorkflowInstance) -> R,
    ) -> Result<R, RepositoryError> {
        self.with(|s| {
            s.instances
                .get_mut(id)
                .map(|i| {
                    i.updated_at = Utc::now();
                    f(i)
                })
                .ok_or(RepositoryError::NotFound)
        })
    }

    pub fn all(&self) -> Vec<WorkflowInstance> {
        self.with(|s| s.instances.values().cloned().collect())
    }

    pub fn events(&self, instance_id: &Uuid) -> Vec<String> {
        self.with(|s| {
            s.logs
                .iter()
                .filter(|l| l.instance_id == *instance_id)
                .map(|l| l.event.clone())
                .collect()
        })
    }
}

impl InstanceRepository for MemoryInstances {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.with(|s| {
            s.instances.insert(instance.id, instance.clone());
        });
        Ok(())
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.with(|s| s.instances.get(id).cloned()))
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.with_instance(&instance.id, |i| *i = instance.clone())
    }

    async fn update_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        error_message: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.with_instance(id, |i| {
            i.status = status;
            if let Some(error) = error_message {
                i.error_message = Some(error.to_string());
            } else if !status.carries_error() {
                i.error_message = None;
            }
            if status.is_terminal() {
                i.completed_at = Some(Utc::now());
            }
        })
    }

    async fn update_progress(
        &self,
        id: &Uuid,
        progress: &ProgressUpdate,
    ) -> Result<(), RepositoryError> {
        self.with_instance(id, |i| {
            i.current_step_id = progress.current_step_id.clone();
            i.current_step_name = progress.current_step_name.clone();
            i.completed_steps = progress.completed_steps;
            i.progress_percentage = progress.progress_percentage;
        })
    }

    async fn update_variables(
        &self,
        id: &Uuid,
        variables: &Map<String, Value>,
    ) -> Result<(), RepositoryError> {
        self.with_instance(id, |i| i.variables = variables.clone())
    }

    async fn get_active_for_process(
        &self,
        process_id: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.with(|s| {
            s.instances
                .values()
                .find(|i| i.process_id == process_id && i.parent.is_none() && !i.status.is_terminal())
                .cloned()
        }))
    }

    async fn list_by_definition(
        &self,
        definition_id: &Uuid,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.with(|s| {
            s.instances
                .values()
                .filter(|i| i.definition_id == *definition_id)
                .cloned()
                .collect()
        }))
    }

    async fn create_step_record(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        self.with(|s| {
            let key = (record.instance_id, record.step_id.clone());
            if !s.steps.contains_key(&key) {
                s.step_order
                    .entry(record.instance_id)
                    .or_default()
                    .push(record.step_id.clone());
            }
            s.steps.insert(key, record.clone());
        });
        Ok(())
    }

    async fn get_step_record(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        Ok(self.with(|s| s.steps.get(&(*instance_id, step_id.to_string())).cloned()))
    }

    async fn get_step_records(&self, instance_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        Ok(self.with(|s| {
            s.step_order
                .get(instance_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| s.steps.get(&(*instance_id, id.clone())).cloned())
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn start_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.with_step(instance_id, step_id, |r| {
            r.status = StepStatus::InProgress;
            r.started_at.get_or_insert(started_at);
        })
    }

    async fn complete_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        output: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        self.with_step(instance_id, step_id, |r| {
            r.status = StepStatus::Completed;
            r.output = output.cloned();
            r.error_message = None;
            r.completed_at = Some(Utc::now());
        })
    }

    async fn skip_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.with_step(instance_id, step_id, |r| {
            r.status = StepStatus::Skipped;
            r.error_message = reason.map(str::to_string);
            r.completed_at = Some(Utc::now());
        })
    }

    async fn fail_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        error_message: &str,
        output: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        self.with_step(instance_id, step_id, |r| {
            r.status = StepStatus::Failed;
            r.error_message = Some(error_message.to_string());
            r.output = output.cloned();
            r.completed_at = Some(Utc::now());
        })
    }

    async fn update_step_record(&self, record: &StepRecord) -> Result<(), RepositoryError> {
        self.with_step(&record.instance_id, &record.step_id, |r| *r = record.clone())
    }

    async fn add_log(&self, entry: &InstanceLogEntry) -> Result<(), RepositoryError> {
        self.with(|s| s.logs.push(entry.clone()));
        Ok(())
    }

    async fn get_logs(&self, instance_id: &Uuid) -> Result<Vec<InstanceLogEntry>, RepositoryError> {
        Ok(self.with(|s| {
            s.logs
                .iter()
                .filter(|l| l.instance_id == *instance_id)
                .cloned()
                .collect()
        }))
    }
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

/// Work items live in memory; tests flip their status directly.
#[derive(Default)]
pub struct MockExecution {
    next_id: AtomicUsize,
    created: Mutex<Vec<(String, WorkItemRequest)>>,
    statuses: Mutex<HashMap<String, WorkItemStatus>>,
    failing_actions: Mutex<HashSet<String>>,
    actions: Mutex<Vec<(String, Value)>>,
}

impl MockExecution {
    pub fn created(&self) -> Vec<WorkItemRequest> {
        self.created.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    /// IDs of items created by `step_id`, in creation order.
    pub fn items_for_step(&self, step_id: &str) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.step_id == step_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn set_status(&self, item_id: &str, status: WorkItemStatus) {
        self.statuses.lock().unwrap().insert(item_id.to_string(), status);
    }

    pub fn fail_action(&self, action: &str) {
        self.failing_actions.lock().unwrap().insert(action.to_string());
    }

    pub fn actions(&self) -> Vec<(String, Value)> {
        self.actions.lock().unwrap().clone()
    }
}

impl StepExecutionContext for MockExecution {
    fn create_work_item(
        &self,
        request: WorkItemRequest,
    ) -> BoxFuture<'_, Result<String, CollaboratorError>> {
        Box::pin(async move {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let prefix = match request.kind {
                WorkItemKind::Task => "task",
                WorkItemKind::Approval => "approval",
            };
            let id = format!("{prefix}-{n}");
            self.set_status(&id, WorkItemStatus::Open);
            self.created.lock().unwrap().push((id.clone(), request));
            Ok(id)
        })
    }

    fn work_item_statuses(
        &self,
        item_ids: &[String],
    ) -> BoxFuture<'_, Result<HashMap<String, WorkItemStatus>, CollaboratorError>> {
        let statuses = self.statuses.lock().unwrap();
        let found: HashMap<String, WorkItemStatus> = item_ids
            .iter()
            .filter_map(|id| statuses.get(id).map(|s| (id.clone(), *s)))
            .collect();
        Box::pin(async move { Ok(found) })
    }

    fn execute_action(
        &self,
        action: &str,
        parameters: &Value,
    ) -> BoxFuture<'_, Result<Value, CollaboratorError>> {
        self.actions
            .lock()
            .unwrap()
            .push((action.to_string(), parameters.clone()));
        let failing = self.failing_actions.lock().unwrap().contains(action);
        let action = action.to_string();
        Box::pin(async move {
            if failing {
                Err(CollaboratorError::Rejected(format!("{action} refused")))
            } else {
                Ok(serde_json::json!({ "action": action, "ok": true }))
            }
        })
    }
}

#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl MockNotifier {
    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationDispatcher for MockNotifier {
    fn dispatch(&self, notification: Notification) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Transport("smtp down".to_string()));
            }
            self.sent.lock().unwrap().push(notification);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MockStatusSync {
    calls: Mutex<Vec<(String, InstanceStatus)>>,
    fail: AtomicBool,
}

impl MockStatusSync {
    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, InstanceStatus)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessStatusSync for MockStatusSync {
    fn sync_status(
        &self,
        process_id: &str,
        status: InstanceStatus,
        _instance_id: Uuid,
    ) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        let process_id = process_id.to_string();
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Transport("hr system unreachable".to_string()));
            }
            self.calls.lock().unwrap().push((process_id, status));
            Ok(())
        })
    }
}

pub struct MockHttp {
    status: u16,
    body: String,
    delay: Option<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl Default for MockHttp {
    fn default() -> Self {
        Self::responding(200, "{}")
    }
}

impl MockHttp {
    pub fn responding(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpTransport for MockHttp {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, CollaboratorError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(HttpResponse {
                status: self.status,
                headers: HashMap::new(),
                body: self.body.clone(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

pub type TestEngine = WorkflowEngine<MemoryDefinitions, MemoryInstances>;

pub struct Harness {
    pub engine: TestEngine,
    pub definitions: MemoryDefinitions,
    pub instances: MemoryInstances,
    pub execution: Arc<MockExecution>,
    pub notifier: Arc<MockNotifier>,
    pub sync: Arc<MockStatusSync>,
    pub dead_letters: Arc<DeadLetterQueue>,
}

/// Status-sync retries use millisecond delays so exhaustion stays fast.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        status_sync: RetryPolicy {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        },
        ..EngineConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let definitions = MemoryDefinitions::default();
    let instances = MemoryInstances::default();
    let execution = Arc::new(MockExecution::default());
    let notifier = Arc::new(MockNotifier::default());
    let sync = Arc::new(MockStatusSync::default());
    let dead_letters = Arc::new(DeadLetterQueue::new());

    let engine = WorkflowEngine::new(
        definitions.clone(),
        instances.clone(),
        Collaborators {
            execution: execution.clone(),
            notifier: notifier.clone(),
            status_sync: sync.clone(),
            http: Arc::new(MockHttp::default()),
        },
        Arc::clone(&dead_letters),
        config,
    );

    Harness {
        engine,
        definitions,
        instances,
        execution,
        notifier,
        sync,
        dead_letters,
    }
}

impl Harness {
    /// Store a definition directly, bypassing validation.
    pub async fn install(&self, definition: WorkflowDefinition) -> WorkflowDefinition {
        self.definitions.create(&definition).await.unwrap()
    }

    pub async fn records(&self, instance_id: &Uuid) -> HashMap<String, StepRecord> {
        self.instances
            .get_step_records(instance_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.step_id.clone(), r))
            .collect()
    }

    pub async fn instance(&self, instance_id: &Uuid) -> WorkflowInstance {
        self.instances.get_by_id(instance_id).await.unwrap().unwrap()
    }
}
