//! The workflow execution engine: instance lifecycle and step state machine.
//!
//! [`WorkflowEngine`] starts instances, drives them step by step, suspends
//! them on waiting steps and resumes them when an external signal arrives.
//! The drive loop is a trampoline over [`WorkflowEngine::step_once`]: each
//! call executes exactly one step and reports where to go next, so long
//! sequential chains never grow the call stack.
//!
//! Status transitions are pushed to the owning process through
//! [`ProcessStatusSync`], wrapped in [`retry_with_dead_letter`] so failed
//! syncs are queued instead of dropped.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tenure_types::config::{EngineConfig, UnmatchedBranchPolicy};
use tenure_types::error::RepositoryError;
use tenure_types::instance::{
    InstanceLogEntry, InstanceStatus, LogLevel, ParentLink, StepRecord, StepStatus,
    WorkflowInstance,
};
use tenure_types::workflow::{ProcessType, StepConfig, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use super::collaborators::{
    BoxFuture, HttpTransport, Notification, NotificationDispatcher, NotificationEvent,
    ProcessStatusSync, StepExecutionContext, notify_best_effort,
};
use super::context::EvaluationContext;
use super::dead_letter::DeadLetterQueue;
use super::expression::ExpressionError;
use super::retry::{DeadLetterRequest, RetryHandler, retry_with_dead_letter};
use super::step_runner::{StepAction, StepContext, StepOutput, StepRunner};
use super::transition::{NextStep, TransitionError, resolve_next};
use crate::repository::definition::DefinitionRepository;
use crate::repository::instance::{InstanceRepository, ProgressUpdate};

/// Operation tag for queued status-sync calls.
pub const STATUS_SYNC_OPERATION: &str = "process_status_sync";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("workflow definition '{0}' is not active")]
    DefinitionInactive(String),

    #[error("process '{process_id}' already has an active workflow instance ({instance_id})")]
    ActiveInstanceExists { process_id: String, instance_id: Uuid },

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("step '{0}' not found")]
    StepNotFound(String),

    #[error("cannot {operation} instance in status '{status}'")]
    InvalidState {
        operation: &'static str,
        status: InstanceStatus,
    },

    #[error("step '{0}' is not waiting for completion")]
    StepNotWaiting(String),

    #[error("workflow definition '{0}' has no start step")]
    NoStartStep(String),

    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("no branch of step '{0}' matched and no default branch exists")]
    UnmatchedBranch(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Public request/response types
// ---------------------------------------------------------------------------

/// How `start_workflow` picks a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionSelector {
    Id(Uuid),
    Code(String),
    /// The active default definition for a process type.
    DefaultFor(ProcessType),
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub selector: DefinitionSelector,
    pub process_id: String,
    /// Business fields of the owning process, exposed as `process.*`.
    pub process_data: Value,
    /// Overrides for the definition's variable defaults.
    pub variables: Map<String, Value>,
    pub started_by: Option<String>,
}

impl StartOptions {
    pub fn new(selector: DefinitionSelector, process_id: &str) -> Self {
        Self {
            selector,
            process_id: process_id.to_string(),
            process_data: json!({}),
            variables: Map::new(),
            started_by: None,
        }
    }
}

/// Snapshot returned by every engine operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub current_step_id: Option<String>,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub progress_percentage: u8,
    pub error: Option<String>,
    /// Set while the instance is suspended on a step.
    pub waiting_on: Option<String>,
}

impl ExecutionResult {
    fn from_instance(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            status: instance.status,
            current_step_id: instance.current_step_id.clone(),
            completed_steps: instance.completed_steps,
            total_steps: instance.total_steps,
            progress_percentage: instance.progress_percentage,
            error: instance.error_message.clone(),
            waiting_on: instance
                .status
                .is_waiting()
                .then(|| instance.current_step_id.clone())
                .flatten(),
        }
    }
}

/// Full read model of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    pub steps: Vec<StepRecord>,
}

/// Where the drive loop goes after one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepTransition {
    Next(String),
    End,
    /// The step suspended the instance.
    Waiting,
    /// The instance was paused or finished by someone else.
    Halted,
}

/// The external systems the engine calls.
#[derive(Clone)]
pub struct Collaborators {
    pub execution: Arc<dyn StepExecutionContext>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub status_sync: Arc<dyn ProcessStatusSync>,
    pub http: Arc<dyn HttpTransport>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine<D, I> {
    pub(crate) definitions: D,
    pub(crate) instances: I,
    pub(crate) runner: StepRunner,
    notifier: Arc<dyn NotificationDispatcher>,
    status_sync: Arc<dyn ProcessStatusSync>,
    dead_letters: Arc<DeadLetterQueue>,
    pub(crate) config: EngineConfig,
}

impl<D: DefinitionRepository, I: InstanceRepository> WorkflowEngine<D, I> {
    pub fn new(
        definitions: D,
        instances: I,
        collaborators: Collaborators,
        dead_letters: Arc<DeadLetterQueue>,
        config: EngineConfig,
    ) -> Self {
        let runner = StepRunner::new(
            collaborators.execution,
            Arc::clone(&collaborators.notifier),
            collaborators.http,
            &config,
        );
        Self {
            definitions,
            instances,
            runner,
            notifier: collaborators.notifier,
            status_sync: collaborators.status_sync,
            dead_letters,
            config,
        }
    }

    pub fn definitions(&self) -> &D {
        &self.definitions
    }

    pub fn instances(&self) -> &I {
        &self.instances
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    // -- Public operations --

    /// Create an instance for a process and run it until it waits or finishes.
    pub async fn start_workflow(&self, options: StartOptions) -> Result<ExecutionResult, EngineError> {
        let definition = self.resolve_definition(&options.selector).await?;
        if !definition.is_active {
            return Err(EngineError::DefinitionInactive(definition.code.clone()));
        }
        if let Some(existing) = self
            .instances
            .get_active_for_process(&options.process_id)
            .await?
        {
            return Err(EngineError::ActiveInstanceExists {
                process_id: options.process_id,
                instance_id: existing.id,
            });
        }

        let instance = self
            .create_instance(
                &definition,
                &options.process_id,
                options.process_data,
                options.variables,
                options.started_by,
                None,
            )
            .await?;

        tracing::info!(
            instance_id = %instance.id,
            definition = definition.code.as_str(),
            process_id = instance.process_id.as_str(),
            "workflow started"
        );
        self.sync_status(&instance, InstanceStatus::Running).await;
        self.notify_lifecycle(&definition, &instance, NotificationEvent::WorkflowStarted, None)
            .await;

        let start = instance.current_step_id.clone().unwrap_or_default();
        self.drive(&definition, instance.id, start, None).await?;
        self.execution_result(&instance.id).await
    }

    /// Execute a specific step of a live instance and continue from there.
    pub async fn execute_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<ExecutionResult, EngineError> {
        let (instance, definition) = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidState {
                operation: "execute a step of",
                status: instance.status,
            });
        }
        if definition.step(step_id).is_none() {
            return Err(EngineError::StepNotFound(step_id.to_string()));
        }
        if instance.status != InstanceStatus::Running {
            self.set_status(&instance, InstanceStatus::Running, None).await?;
        }
        self.drive(&definition, instance.id, step_id.to_string(), None)
            .await?;
        self.execution_result(instance_id).await
    }

    /// Record the result of a waiting step and resume the instance.
    ///
    /// Completing a step that is already `Completed` or `Skipped` returns the
    /// current state without touching anything. Two truly concurrent calls can
    /// both pass this check.
    pub async fn complete_waiting_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        result: Value,
        completed_by: Option<&str>,
    ) -> Result<ExecutionResult, EngineError> {
        let (instance, definition) = self.load(instance_id).await?;
        let record = self
            .instances
            .get_step_record(instance_id, step_id)
            .await?
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

        if record.status.is_settled() {
            tracing::debug!(
                instance_id = %instance_id,
                step_id,
                "step already settled, ignoring duplicate completion"
            );
            return Ok(ExecutionResult::from_instance(&instance));
        }
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidState {
                operation: "complete a step of",
                status: instance.status,
            });
        }
        if record.status != StepStatus::InProgress {
            return Err(EngineError::StepNotWaiting(step_id.to_string()));
        }
        let step = definition
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

        let mut variables = instance.variables.clone();
        if let Some(Value::Object(vars)) = result.get("variables") {
            variables.extend(vars.clone());
            self.instances.update_variables(instance_id, &variables).await?;
        }
        self.instances
            .complete_step(instance_id, step_id, Some(&result))
            .await?;

        let mut entry = InstanceLogEntry::new(
            *instance_id,
            "step_completed",
            LogLevel::Info,
            format!("Step '{}' completed externally", step.name),
        )
        .with_step(&step.id, &step.name)
        .with_data(result.clone());
        entry.user_id = completed_by.map(str::to_string);
        self.log(entry).await;

        // A branch of a waiting parallel step only settles itself.
        if let Some(parallel) = self.waiting_parallel_for(&definition, instance_id, step_id).await? {
            if self.parallel_branches_pending(&definition, instance_id, parallel).await? {
                return self.execution_result(instance_id).await;
            }
            self.set_status(&instance, InstanceStatus::Running, None).await?;
            self.drive(&definition, instance.id, parallel.id.clone(), None)
                .await?;
            return self.execution_result(instance_id).await;
        }

        self.set_status(&instance, InstanceStatus::Running, None).await?;

        let mut refreshed = instance.clone();
        refreshed.variables = variables;
        let eval = EvaluationContext::for_instance(&refreshed)
            .with_step(step)
            .with_result(result);
        match self.next_transition(&definition, step, &eval) {
            Ok(StepTransition::Next(next)) => {
                self.drive(&definition, instance.id, next, None).await?;
            }
            Ok(_) => self.complete_instance(&definition, instance_id).await?,
            Err(e) => {
                self.fail_instance(&definition, instance_id, Some(step_id), &e.to_string())
                    .await?;
            }
        }
        self.execution_result(instance_id).await
    }

    /// Continue a paused or waiting instance at its current step.
    ///
    /// Object trigger data is merged into the variables and handed to the
    /// step (a `wait` step without duration completes with it).
    pub async fn resume_workflow(
        &self,
        instance_id: &Uuid,
        trigger_data: Option<Value>,
    ) -> Result<ExecutionResult, EngineError> {
        let (instance, definition) = self.load(instance_id).await?;
        if !instance.status.is_resumable() {
            return Err(EngineError::InvalidState {
                operation: "resume",
                status: instance.status,
            });
        }
        let current = instance
            .current_step_id
            .clone()
            .ok_or_else(|| EngineError::StepNotFound("<current>".to_string()))?;

        if let Some(Value::Object(data)) = &trigger_data {
            let mut variables = instance.variables.clone();
            variables.extend(data.clone());
            self.instances.update_variables(instance_id, &variables).await?;
        }

        self.log(
            InstanceLogEntry::new(*instance_id, "workflow_resumed", LogLevel::Info, "Workflow resumed")
                .with_data(trigger_data.clone().unwrap_or(Value::Null)),
        )
        .await;
        self.set_status(&instance, InstanceStatus::Running, None).await?;
        self.drive(&definition, instance.id, current, trigger_data)
            .await?;
        self.execution_result(instance_id).await
    }

    /// Re-check the step a waiting instance is suspended on.
    ///
    /// Task completion and `wait_for_tasks` timeouts are detected here; the
    /// instance status only changes when the step stops waiting.
    pub async fn poll_waiting_steps(&self, instance_id: &Uuid) -> Result<ExecutionResult, EngineError> {
        let (instance, definition) = self.load(instance_id).await?;
        if !instance.status.is_waiting() {
            return Ok(ExecutionResult::from_instance(&instance));
        }
        let Some(current) = instance.current_step_id.clone() else {
            return Ok(ExecutionResult::from_instance(&instance));
        };
        tracing::debug!(instance_id = %instance_id, step_id = current.as_str(), "polling waiting step");
        self.drive(&definition, instance.id, current, None).await?;
        self.execution_result(instance_id).await
    }

    /// Mark an instance cancelled. In-flight calls are not interrupted.
    pub async fn cancel_workflow(
        &self,
        instance_id: &Uuid,
        reason: Option<&str>,
    ) -> Result<ExecutionResult, EngineError> {
        let (instance, _) = self.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidState {
                operation: "cancel",
                status: instance.status,
            });
        }
        self.set_status(&instance, InstanceStatus::Cancelled, reason).await?;
        self.log(InstanceLogEntry::new(
            *instance_id,
            "workflow_cancelled",
            LogLevel::Warning,
            reason.unwrap_or("Workflow cancelled"),
        ))
        .await;
        tracing::info!(instance_id = %instance_id, "workflow cancelled");
        self.execution_result(instance_id).await
    }

    pub async fn pause_workflow(&self, instance_id: &Uuid) -> Result<ExecutionResult, EngineError> {
        let (instance, _) = self.load(instance_id).await?;
        if instance.status.is_terminal() || instance.status == InstanceStatus::Paused {
            return Err(EngineError::InvalidState {
                operation: "pause",
                status: instance.status,
            });
        }
        self.set_status(&instance, InstanceStatus::Paused, None).await?;
        self.log(InstanceLogEntry::new(
            *instance_id,
            "workflow_paused",
            LogLevel::Info,
            "Workflow paused",
        ))
        .await;
        self.execution_result(instance_id).await
    }

    pub async fn get_instance_snapshot(&self, instance_id: &Uuid) -> Result<InstanceSnapshot, EngineError> {
        let instance = self
            .instances
            .get_by_id(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*instance_id))?;
        let steps = self.instances.get_step_records(instance_id).await?;
        Ok(InstanceSnapshot { instance, steps })
    }

    // -- Drive loop --

    /// Run steps from `step_id` until the instance waits, halts or ends.
    ///
    /// Step failures fail the instance and are reported through its status;
    /// only repository errors escape.
    pub(crate) async fn drive(
        &self,
        definition: &WorkflowDefinition,
        instance_id: Uuid,
        step_id: String,
        trigger: Option<Value>,
    ) -> Result<(), EngineError> {
        let mut current = step_id;
        let mut trigger = trigger;
        let mut steps_run: u32 = 0;
        loop {
            if steps_run >= self.config.max_steps_per_run {
                let error = format!(
                    "exceeded {} steps in a single run (stopped at step '{current}')",
                    self.config.max_steps_per_run
                );
                return self
                    .fail_instance(definition, &instance_id, Some(&current), &error)
                    .await;
            }
            steps_run += 1;
            // Long chains stay cancellable by an outer timeout.
            tokio::task::yield_now().await;

            match self
                .step_once(definition, instance_id, &current, trigger.take())
                .await
            {
                Ok(StepTransition::Next(next)) => current = next,
                Ok(StepTransition::End) => {
                    return self.complete_instance(definition, &instance_id).await;
                }
                Ok(StepTransition::Waiting | StepTransition::Halted) => return Ok(()),
                Err(EngineError::Repository(e)) => return Err(EngineError::Repository(e)),
                Err(e) => {
                    return self
                        .fail_instance(definition, &instance_id, Some(&current), &e.to_string())
                        .await;
                }
            }
        }
    }

    /// Execute exactly one step and report the transition.
    ///
    /// Boxed because sub-workflow steps drive child instances through it.
    pub(crate) fn step_once<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        instance_id: Uuid,
        step_id: &'a str,
        trigger: Option<Value>,
    ) -> BoxFuture<'a, Result<StepTransition, EngineError>> {
        Box::pin(async move {
            let instance = self
                .instances
                .get_by_id(&instance_id)
                .await?
                .ok_or(EngineError::InstanceNotFound(instance_id))?;
            if instance.status.is_terminal() {
                return Ok(StepTransition::Halted);
            }
            let step = definition
                .step(step_id)
                .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

            let record = self.prepare_record(&instance, step).await?;
            // A step that suspended before keeps its record and items.
            let resuming = record.status == StepStatus::InProgress && record.output.is_some();
            self.update_progress(definition, &instance, Some(step)).await?;

            if instance.status == InstanceStatus::Paused {
                tracing::debug!(instance_id = %instance_id, step_id, "instance paused, halting");
                return Ok(StepTransition::Halted);
            }

            let eval = EvaluationContext::for_instance(&instance).with_step(step);

            if !resuming
                && !self
                    .runner
                    .evaluator()
                    .evaluate_condition_groups(&step.conditions, &eval)?
            {
                self.instances
                    .skip_step(&instance_id, step_id, Some("entry conditions not met"))
                    .await?;
                self.log(
                    InstanceLogEntry::new(
                        instance_id,
                        "step_skipped",
                        LogLevel::Info,
                        format!("Step '{}' skipped: entry conditions not met", step.name),
                    )
                    .with_step(&step.id, &step.name),
                )
                .await;
                return self.next_transition(definition, step, &eval);
            }

            let now = Utc::now();
            self.instances.start_step(&instance_id, step_id, now).await?;
            if !resuming {
                tracing::debug!(instance_id = %instance_id, step_id, step_type = step.step_type().as_str(), "step started");
                self.log(
                    InstanceLogEntry::new(
                        instance_id,
                        "step_started",
                        LogLevel::Info,
                        format!("Step '{}' started", step.name),
                    )
                    .with_step(&step.id, &step.name),
                )
                .await;
            }

            let output = match &step.config {
                StepConfig::Parallel { .. } => {
                    self.run_parallel(definition, &instance, step, &eval, resuming)
                        .await?
                }
                StepConfig::CallWorkflow { .. } => {
                    self.run_call_workflow(&instance, step, &eval).await?
                }
                _ => {
                    let ctx = self
                        .step_context(definition, &instance, step, &record, eval.clone(), trigger)
                        .await?;
                    self.run_with_retry(step, &ctx, &record).await?
                }
            };

            self.apply_output(definition, &instance, step, eval, output)
                .await
        })
    }

    /// Persist a step's output and decide where to go next.
    async fn apply_output(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        step: &StepDefinition,
        eval: EvaluationContext,
        output: StepOutput,
    ) -> Result<StepTransition, EngineError> {
        let instance_id = instance.id;
        if !output.created_item_ids.is_empty() {
            self.record_items(&instance_id, &step.id, &output.created_item_ids)
                .await?;
        }

        match output.action {
            StepAction::Continue | StepAction::Skip => {
                let mut eval = eval.with_result(output.output.clone());
                if !output.variables.is_empty() {
                    eval.merge_variables(&output.variables);
                    self.instances
                        .update_variables(&instance_id, &eval.variables)
                        .await?;
                }

                let (event, message) = if output.action == StepAction::Skip {
                    self.instances
                        .skip_step(&instance_id, &step.id, output.error.as_deref())
                        .await?;
                    ("step_skipped", format!("Step '{}' skipped", step.name))
                } else {
                    self.instances
                        .complete_step(&instance_id, &step.id, Some(&output.output))
                        .await?;
                    ("step_completed", format!("Step '{}' completed", step.name))
                };
                self.log(
                    InstanceLogEntry::new(instance_id, event, LogLevel::Info, message)
                        .with_step(&step.id, &step.name)
                        .with_data(output.output),
                )
                .await;

                if instance.status.is_waiting() {
                    self.set_status(instance, InstanceStatus::Running, None).await?;
                }
                self.next_transition(definition, step, &eval)
            }
            StepAction::Wait(reason) => {
                if let Some(mut record) = self
                    .instances
                    .get_step_record(&instance_id, &step.id)
                    .await?
                {
                    record.output = Some(output.output.clone());
                    self.instances.update_step_record(&record).await?;
                }
                let status = reason.instance_status();
                if instance.status != status {
                    self.log(
                        InstanceLogEntry::new(
                            instance_id,
                            "step_waiting",
                            LogLevel::Info,
                            format!("Step '{}' is waiting ({})", step.name, status),
                        )
                        .with_step(&step.id, &step.name)
                        .with_data(output.output),
                    )
                    .await;
                    self.set_status(instance, status, None).await?;
                }
                Ok(StepTransition::Waiting)
            }
            StepAction::Fail => {
                let message = output
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("step '{}' failed", step.id));
                self.instances
                    .fail_step(&instance_id, &step.id, &message, Some(&output.output))
                    .await?;
                Err(EngineError::StepFailed {
                    step_id: step.id.clone(),
                    message,
                })
            }
        }
    }

    /// Run a step, retrying failures per its retry policy.
    async fn run_with_retry(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
        record: &StepRecord,
    ) -> Result<StepOutput, EngineError> {
        let mut attempt: u32 = 1;
        let mut retry_count = record.retry_count;
        loop {
            let output = match self.runner.run(step, ctx).await {
                Ok(output) => output,
                Err(e) => StepOutput::fail(e.to_string(), json!({ "error": e.to_string() })),
            };
            if !output.is_failure() {
                return Ok(output);
            }

            let Some(policy) = step.retry.as_ref() else {
                return Ok(output);
            };
            if !RetryHandler::should_retry(policy, attempt) {
                return Ok(output);
            }

            let delay = RetryHandler::delay_after(policy, attempt);
            retry_count += 1;
            if let Some(mut current) = self
                .instances
                .get_step_record(&ctx.instance_id, &step.id)
                .await?
            {
                current.retry_count = retry_count;
                current.error_message = output.error.clone();
                self.instances.update_step_record(&current).await?;
            }
            tracing::warn!(
                instance_id = %ctx.instance_id,
                step_id = step.id.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = output.error.as_deref().unwrap_or(""),
                "step failed, retrying"
            );
            self.log(
                InstanceLogEntry::new(
                    ctx.instance_id,
                    "step_retry",
                    LogLevel::Warning,
                    format!("Retrying step '{}' (attempt {})", step.name, attempt + 1),
                )
                .with_step(&step.id, &step.name)
                .with_data(json!({ "error": output.error, "delay_ms": delay.as_millis() as u64 })),
            )
            .await;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    // -- Step helpers --

    /// Load the step's record, resetting it when a settled step is re-entered.
    async fn prepare_record(
        &self,
        instance: &WorkflowInstance,
        step: &StepDefinition,
    ) -> Result<StepRecord, EngineError> {
        match self.instances.get_step_record(&instance.id, &step.id).await? {
            Some(record) if record.status.is_settled() || record.status == StepStatus::Failed => {
                let fresh = StepRecord::pending(instance.id, &step.id, &step.name, step.step_type());
                self.instances.update_step_record(&fresh).await?;
                Ok(fresh)
            }
            Some(record) => Ok(record),
            None => {
                let fresh = StepRecord::pending(instance.id, &step.id, &step.name, step.step_type());
                self.instances.create_step_record(&fresh).await?;
                Ok(fresh)
            }
        }
    }

    /// Build the handler context for a step.
    pub(crate) async fn step_context(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        step: &StepDefinition,
        record: &StepRecord,
        eval: EvaluationContext,
        trigger: Option<Value>,
    ) -> Result<StepContext, EngineError> {
        let mut tracked_item_ids = Vec::new();
        if let StepConfig::WaitForTasks { step_ids, .. } = &step.config {
            for id in step_ids {
                if let Some(watched) = self.instances.get_step_record(&instance.id, id).await? {
                    tracked_item_ids.extend(watched.created_item_ids);
                }
            }
        }

        let mut ctx = StepContext::new(instance.id, &instance.process_id, eval);
        ctx.workflow_title = definition.title.clone();
        ctx.step_started_at = record.started_at;
        ctx.existing_item_ids = record.created_item_ids.clone();
        ctx.tracked_item_ids = tracked_item_ids;
        ctx.previous_output = record.output.clone();
        ctx.trigger = trigger;
        ctx.notifications = definition.notifications.clone();
        Ok(ctx)
    }

    pub(crate) async fn record_items(
        &self,
        instance_id: &Uuid,
        step_id: &str,
        item_ids: &[String],
    ) -> Result<(), EngineError> {
        if let Some(mut record) = self.instances.get_step_record(instance_id, step_id).await? {
            for id in item_ids {
                if !record.created_item_ids.contains(id) {
                    record.created_item_ids.push(id.clone());
                }
            }
            self.instances.update_step_record(&record).await?;
        }
        Ok(())
    }

    fn next_transition(
        &self,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        eval: &EvaluationContext,
    ) -> Result<StepTransition, EngineError> {
        match resolve_next(definition, step, eval, self.runner.evaluator())? {
            NextStep::Step(id) => Ok(StepTransition::Next(id)),
            NextStep::End => Ok(StepTransition::End),
            NextStep::Unmatched => match self.config.unmatched_branch {
                UnmatchedBranchPolicy::End => {
                    tracing::warn!(
                        step_id = step.id.as_str(),
                        "no branch matched and no default branch, ending workflow"
                    );
                    Ok(StepTransition::End)
                }
                UnmatchedBranchPolicy::Fail => Err(EngineError::UnmatchedBranch(step.id.clone())),
            },
        }
    }

    // -- Instance lifecycle --

    /// Create an instance with every step record pre-created.
    pub(crate) async fn create_instance(
        &self,
        definition: &WorkflowDefinition,
        process_id: &str,
        process_data: Value,
        overrides: Map<String, Value>,
        started_by: Option<String>,
        parent: Option<ParentLink>,
    ) -> Result<WorkflowInstance, EngineError> {
        let start = definition
            .start_step()
            .ok_or_else(|| EngineError::NoStartStep(definition.code.clone()))?;

        let now = Utc::now();
        let mut variables = definition.default_variables();
        variables.extend(overrides);

        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: definition.id,
            definition_version: definition.version,
            process_id: process_id.to_string(),
            status: InstanceStatus::Running,
            current_step_id: Some(start.id.clone()),
            current_step_name: Some(start.name.clone()),
            total_steps: saturating_count(definition.steps.len()),
            completed_steps: 0,
            progress_percentage: 0,
            context: if process_data.is_object() { process_data } else { json!({}) },
            variables,
            parent,
            started_by,
            started_at: now,
            estimated_completion_at: definition
                .stats
                .average_completion_minutes
                .map(|minutes| now + chrono::Duration::seconds((minutes * 60.0) as i64)),
            completed_at: None,
            error_message: None,
            updated_at: now,
        };
        self.instances.create(&instance).await?;

        for step in &definition.steps {
            let mut record = StepRecord::pending(instance.id, &step.id, &step.name, step.step_type());
            if step.id == start.id {
                record.status = StepStatus::InProgress;
                record.started_at = Some(now);
            }
            self.instances.create_step_record(&record).await?;
        }

        self.definitions.increment_usage_count(&definition.id).await?;
        self.log(
            InstanceLogEntry::new(
                instance.id,
                "workflow_started",
                LogLevel::Info,
                format!("Workflow '{}' started", definition.title),
            )
            .with_data(json!({
                "definition_id": definition.id,
                "definition_version": definition.version,
                "parent": instance.parent,
            })),
        )
        .await;
        Ok(instance)
    }

    /// Settle untaken steps and mark the instance completed.
    pub(crate) async fn complete_instance(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &Uuid,
    ) -> Result<(), EngineError> {
        let instance = self
            .instances
            .get_by_id(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*instance_id))?;

        for record in self.instances.get_step_records(instance_id).await? {
            if record.status == StepStatus::Pending {
                self.instances
                    .skip_step(instance_id, &record.step_id, Some("not on the executed path"))
                    .await?;
            }
        }

        let total = saturating_count(definition.steps.len());
        self.instances
            .update_progress(
                instance_id,
                &ProgressUpdate {
                    current_step_id: instance.current_step_id.clone(),
                    current_step_name: instance.current_step_name.clone(),
                    completed_steps: total,
                    progress_percentage: 100,
                },
            )
            .await?;
        self.set_status(&instance, InstanceStatus::Completed, None).await?;

        tracing::info!(instance_id = %instance_id, definition = definition.code.as_str(), "workflow completed");
        self.log(InstanceLogEntry::new(
            *instance_id,
            "workflow_completed",
            LogLevel::Info,
            format!("Workflow '{}' completed", definition.title),
        ))
        .await;
        self.notify_lifecycle(definition, &instance, NotificationEvent::WorkflowCompleted, None)
            .await;
        self.update_definition_stats(definition).await;
        Ok(())
    }

    /// Mark the instance failed, then notify and sync on a best-effort basis.
    pub(crate) async fn fail_instance(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &Uuid,
        step_id: Option<&str>,
        error: &str,
    ) -> Result<(), EngineError> {
        let instance = self
            .instances
            .get_by_id(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*instance_id))?;

        tracing::error!(instance_id = %instance_id, step_id = step_id.unwrap_or(""), error, "workflow failed");
        self.set_status(&instance, InstanceStatus::Failed, Some(error)).await?;

        let mut entry = InstanceLogEntry::new(
            *instance_id,
            "workflow_failed",
            LogLevel::Error,
            error.to_string(),
        );
        if let Some(step) = step_id.and_then(|id| definition.step(id)) {
            entry = entry.with_step(&step.id, &step.name);
        }
        self.log(entry).await;
        self.notify_lifecycle(definition, &instance, NotificationEvent::WorkflowFailed, Some(error))
            .await;
        self.update_definition_stats(definition).await;
        Ok(())
    }

    async fn update_progress(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        current: Option<&StepDefinition>,
    ) -> Result<(), EngineError> {
        let records = self.instances.get_step_records(&instance.id).await?;
        let completed = saturating_count(records.iter().filter(|r| r.status.is_settled()).count());
        let total = saturating_count(definition.steps.len());
        self.instances
            .update_progress(
                &instance.id,
                &ProgressUpdate {
                    current_step_id: current.map(|s| s.id.clone()),
                    current_step_name: current.map(|s| s.name.clone()),
                    completed_steps: completed,
                    progress_percentage: WorkflowInstance::compute_progress(completed, total),
                },
            )
            .await?;
        Ok(())
    }

    /// Recompute success rate and average duration from finished instances.
    async fn update_definition_stats(&self, definition: &WorkflowDefinition) {
        let instances = match self.instances.list_by_definition(&definition.id).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(definition = definition.code.as_str(), error = %e, "failed to load instances for stats");
                return;
            }
        };

        let finished: Vec<&WorkflowInstance> = instances
            .iter()
            .filter(|i| matches!(i.status, InstanceStatus::Completed | InstanceStatus::Failed))
            .collect();
        if finished.is_empty() {
            return;
        }
        let completed: Vec<&&WorkflowInstance> = finished
            .iter()
            .filter(|i| i.status == InstanceStatus::Completed)
            .collect();
        let success_rate = completed.len() as f64 / finished.len() as f64 * 100.0;

        if let Err(e) = self
            .definitions
            .update_success_rate(&definition.id, success_rate)
            .await
        {
            tracing::warn!(definition = definition.code.as_str(), error = %e, "failed to update success rate");
        }

        let durations: Vec<f64> = completed
            .iter()
            .filter_map(|i| i.completed_at.map(|done| (done - i.started_at).num_seconds() as f64 / 60.0))
            .collect();
        if !durations.is_empty() {
            let average = durations.iter().sum::<f64>() / durations.len() as f64;
            if let Err(e) = self
                .definitions
                .update_average_completion_time(&definition.id, average)
                .await
            {
                tracing::warn!(definition = definition.code.as_str(), error = %e, "failed to update average completion time");
            }
        }
    }

    // -- Status, sync, notifications, logs --

    /// Persist a status change and push it to the owning process.
    pub(crate) async fn set_status(
        &self,
        instance: &WorkflowInstance,
        status: InstanceStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        self.instances.update_status(&instance.id, status, error).await?;
        if instance.status != status {
            self.sync_status(instance, status).await;
        }
        Ok(())
    }

    /// Sync a top-level instance's status; failures end up in the dead-letter queue.
    async fn sync_status(&self, instance: &WorkflowInstance, status: InstanceStatus) {
        if instance.parent.is_some() {
            return;
        }
        let request = DeadLetterRequest::new(
            STATUS_SYNC_OPERATION,
            json!({
                "process_id": instance.process_id,
                "status": status,
                "instance_id": instance.id,
            }),
        )
        .with_metadata("definition_id", json!(instance.definition_id));

        let outcome = retry_with_dead_letter(
            &self.dead_letters,
            &self.config.status_sync,
            request,
            |_ctx| self.status_sync.sync_status(&instance.process_id, status, instance.id),
        )
        .await;

        if let Some(dead_letter_id) = outcome.dead_letter_id() {
            self.log(
                InstanceLogEntry::new(
                    instance.id,
                    "status_sync_failed",
                    LogLevel::Warning,
                    format!("Status sync for '{status}' queued for retry"),
                )
                .with_data(json!({ "dead_letter_id": dead_letter_id, "attempts": outcome.attempts() })),
            )
            .await;
        }
    }

    async fn notify_lifecycle(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        event: NotificationEvent,
        error: Option<&str>,
    ) {
        if instance.parent.is_some() {
            return;
        }
        let settings = &definition.notifications;
        let (enabled, subject, message) = match event {
            NotificationEvent::WorkflowStarted => (
                settings.on_started,
                format!("Workflow started: {}", definition.title),
                format!("'{}' started for process {}", definition.title, instance.process_id),
            ),
            NotificationEvent::WorkflowCompleted => (
                settings.on_completed,
                format!("Workflow completed: {}", definition.title),
                format!("'{}' completed for process {}", definition.title, instance.process_id),
            ),
            NotificationEvent::WorkflowFailed => (
                settings.on_failed,
                format!("Workflow failed: {}", definition.title),
                format!(
                    "'{}' failed for process {}: {}",
                    definition.title,
                    instance.process_id,
                    error.unwrap_or("unknown error")
                ),
            ),
            _ => return,
        };
        if !enabled {
            return;
        }

        let outcome = notify_best_effort(
            self.notifier.as_ref(),
            Notification {
                event,
                instance_id: instance.id,
                process_id: instance.process_id.clone(),
                workflow_title: definition.title.clone(),
                recipient_ids: settings.recipient_ids.clone(),
                recipient_emails: settings.recipient_emails.clone(),
                subject,
                message,
                template: None,
            },
        )
        .await;
        if !outcome.is_delivered() {
            tracing::debug!(instance_id = %instance.id, event = ?event, outcome = ?outcome, "lifecycle notification not delivered");
        }
    }

    /// Append to the instance log. Log write failures never fail the workflow.
    pub(crate) async fn log(&self, entry: InstanceLogEntry) {
        if let Err(e) = self.instances.add_log(&entry).await {
            tracing::warn!(instance_id = %entry.instance_id, event = entry.event.as_str(), error = %e, "failed to write instance log");
        }
    }

    // -- Loading --

    async fn resolve_definition(
        &self,
        selector: &DefinitionSelector,
    ) -> Result<WorkflowDefinition, EngineError> {
        let found = match selector {
            DefinitionSelector::Id(id) => self.definitions.get_by_id(id).await?,
            DefinitionSelector::Code(code) => self.definitions.get_by_code(code).await?,
            DefinitionSelector::DefaultFor(process_type) => {
                self.definitions.get_default_for_type(*process_type).await?
            }
        };
        found.ok_or_else(|| {
            EngineError::DefinitionNotFound(match selector {
                DefinitionSelector::Id(id) => id.to_string(),
                DefinitionSelector::Code(code) => code.clone(),
                DefinitionSelector::DefaultFor(t) => format!("default for {t}"),
            })
        })
    }

    async fn load(
        &self,
        instance_id: &Uuid,
    ) -> Result<(WorkflowInstance, WorkflowDefinition), EngineError> {
        let instance = self
            .instances
            .get_by_id(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*instance_id))?;
        let definition = self
            .definitions
            .get_by_id(&instance.definition_id)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition_id.to_string()))?;
        Ok((instance, definition))
    }

    async fn execution_result(&self, instance_id: &Uuid) -> Result<ExecutionResult, EngineError> {
        let instance = self
            .instances
            .get_by_id(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*instance_id))?;
        Ok(ExecutionResult::from_instance(&instance))
    }
}

/// Step counts are stored as `u32`; clamp instead of truncating.
pub(crate) fn saturating_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{definition, fast_config, harness, harness_with, step};
    use tenure_types::instance::WorkItemStatus;
    use tenure_types::workflow::{
        Assignee, BranchRule, Condition, ConditionGroup, ConditionLogic, ConditionOperator,
        RetryPolicy, TaskTemplate, Transition, VariableAssignment,
    };

    fn approval_definition() -> WorkflowDefinition {
        definition(vec![
            step("start", 1, StepConfig::Start {}),
            step("approve", 2, StepConfig::Approval {
                approver: Some(Assignee::User { user_id: "manager-1".into() }),
                title: Some("Approve {{process.employee_name}}".into()),
                message: None,
                due_in_days: Some(2),
            }),
            step("end", 3, StepConfig::End {}),
        ])
    }

    fn options(def: &WorkflowDefinition, process_id: &str) -> StartOptions {
        let mut options = StartOptions::new(DefinitionSelector::Id(def.id), process_id);
        options.process_data = json!({ "employee_name": "Grace" });
        options.started_by = Some("hr-admin".into());
        options
    }

    fn set_n(n: i64) -> StepConfig {
        StepConfig::SetVariable {
            assignments: vec![VariableAssignment { name: "n".into(), value: json!(n) }],
        }
    }

    #[tokio::test]
    async fn test_approval_workflow_waits_then_completes() {
        let h = harness();
        let def = h.install(approval_definition()).await;

        let started = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();
        assert_eq!(started.status, InstanceStatus::WaitingForApproval);
        assert_eq!(started.waiting_on.as_deref(), Some("approve"));
        assert_eq!(started.total_steps, 3);
        assert_eq!(h.execution.created()[0].title, "Approve Grace");

        let done = h
            .engine
            .complete_waiting_step(
                &started.instance_id,
                "approve",
                json!({ "decision": "approved", "variables": { "laptop": "mbp" } }),
                Some("manager-1"),
            )
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.completed_steps, done.total_steps);
        assert_eq!(done.progress_percentage, 100);
        assert!(done.waiting_on.is_none());

        let instance = h.instance(&started.instance_id).await;
        assert_eq!(instance.variables["laptop"], json!("mbp"));
        assert!(instance.completed_at.is_some());
        let records = h.records(&started.instance_id).await;
        assert!(records.values().all(|r| r.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_ignored() {
        let h = harness();
        let def = h.install(approval_definition()).await;
        let started = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();
        let id = started.instance_id;

        let first = h
            .engine
            .complete_waiting_step(&id, "approve", json!({ "decision": "approved" }), None)
            .await
            .unwrap();
        let events = h.instances.events(&id);
        let syncs = h.sync.calls().len();

        let second = h
            .engine
            .complete_waiting_step(&id, "approve", json!({ "decision": "rejected" }), None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.instances.events(&id), events);
        assert_eq!(h.sync.calls().len(), syncs);
    }

    #[tokio::test]
    async fn test_complete_rejects_step_that_is_not_waiting() {
        let h = harness();
        let def = h.install(approval_definition()).await;
        let started = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();

        let err = h
            .engine
            .complete_waiting_step(&started.instance_id, "end", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepNotWaiting(ref s) if s == "end"));

        let err = h
            .engine
            .complete_waiting_step(&started.instance_id, "nope", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepNotFound(_)));
    }

    #[tokio::test]
    async fn test_one_active_instance_per_process() {
        let h = harness();
        let def = h.install(approval_definition()).await;
        let first = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();

        let err = h.engine.start_workflow(options(&def, "P-1")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ActiveInstanceExists { ref process_id, instance_id }
                if process_id == "P-1" && instance_id == first.instance_id
        ));

        h.engine
            .cancel_workflow(&first.instance_id, Some("duplicate"))
            .await
            .unwrap();
        let again = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();
        assert_ne!(again.instance_id, first.instance_id);
    }

    #[tokio::test]
    async fn test_definition_selection_errors() {
        let h = harness();
        let mut def = approval_definition();
        def.is_active = false;
        let def = h.install(def).await;

        let err = h.engine.start_workflow(options(&def, "P-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::DefinitionInactive(_)));

        let err = h
            .engine
            .start_workflow(StartOptions::new(
                DefinitionSelector::DefaultFor(ProcessType::Leaver),
                "P-2",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn test_default_definition_by_process_type() {
        let h = harness();
        let mut def = approval_definition();
        def.is_default = true;
        h.install(def).await;

        let result = h
            .engine
            .start_workflow(StartOptions::new(
                DefinitionSelector::DefaultFor(ProcessType::Joiner),
                "P-3",
            ))
            .await
            .unwrap();
        assert_eq!(result.status, InstanceStatus::WaitingForApproval);
    }

    #[tokio::test]
    async fn test_unmatched_branch_policy() {
        let mut route = step("route", 2, set_n(1));
        route.on_complete = Some(Transition::Branch {
            branches: vec![BranchRule {
                conditions: vec![Condition::compare("variables.n", ConditionOperator::Equals, json!(2))],
                logic: ConditionLogic::All,
                target: "end".into(),
                is_default: false,
            }],
        });
        let def = definition(vec![
            step("start", 1, StepConfig::Start {}),
            route,
            step("end", 3, StepConfig::End {}),
        ]);

        let h = harness();
        let installed = h.install(def.clone()).await;
        let result = h.engine.start_workflow(options(&installed, "P-1")).await.unwrap();
        assert_eq!(result.status, InstanceStatus::Completed);
        assert_eq!(h.records(&result.instance_id).await["end"].status, StepStatus::Skipped);

        let mut config = fast_config();
        config.unmatched_branch = UnmatchedBranchPolicy::Fail;
        let h = harness_with(config);
        let installed = h.install(def).await;
        let result = h.engine.start_workflow(options(&installed, "P-1")).await.unwrap();
        assert_eq!(result.status, InstanceStatus::Failed);
        assert!(result.error.unwrap().contains("no branch of step 'route' matched"));
    }

    #[tokio::test]
    async fn test_entry_conditions_skip_step() {
        let mut eu_only = step("eu-only", 2, set_n(7));
        eu_only.conditions = vec![ConditionGroup {
            logic: ConditionLogic::All,
            conditions: vec![Condition::compare("variables.region", ConditionOperator::Equals, json!("EU"))],
        }];
        let h = harness();
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                eu_only,
                step("end", 3, StepConfig::End {}),
            ]))
            .await;

        let mut opts = options(&def, "P-1");
        opts.variables.insert("region".into(), json!("US"));
        let result = h.engine.start_workflow(opts).await.unwrap();

        assert_eq!(result.status, InstanceStatus::Completed);
        assert_eq!(h.records(&result.instance_id).await["eu-only"].status, StepStatus::Skipped);
        assert!(h.instance(&result.instance_id).await.variables.get("n").is_none());
    }

    #[tokio::test]
    async fn test_empty_for_each_completes() {
        let h = harness();
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                step("each", 2, StepConfig::ForEach {
                    collection: "variables.systems".into(),
                    item_variable: "item".into(),
                    index_variable: "index".into(),
                    steps: vec![step("grant", 1, StepConfig::Action {
                        action: "grant".into(),
                        parameters: json!({ "system": "{{item}}" }),
                    })],
                    mode: Default::default(),
                    max_concurrency: None,
                    on_error: Default::default(),
                    output_variable: None,
                }),
                step("end", 3, StepConfig::End {}),
            ]))
            .await;

        let mut opts = options(&def, "P-1");
        opts.variables.insert("systems".into(), json!([]));
        let result = h.engine.start_workflow(opts).await.unwrap();

        assert_eq!(result.status, InstanceStatus::Completed);
        let output = h.records(&result.instance_id).await["each"].output.clone().unwrap();
        assert_eq!(output["iterations"], json!(0));
        assert!(h.execution.actions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_status_sync_lands_in_dead_letter_queue() {
        let h = harness();
        h.sync.fail_all();
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                step("end", 2, StepConfig::End {}),
            ]))
            .await;

        let result = h.engine.start_workflow(options(&def, "P-9")).await.unwrap();
        assert_eq!(result.status, InstanceStatus::Completed);

        let queued = h.dead_letters.get_by_type(STATUS_SYNC_OPERATION);
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|item| item.attempts == 3));
        assert!(queued.iter().all(|item| item.payload["process_id"] == "P-9"));
        assert!(
            h.instances
                .events(&result.instance_id)
                .contains(&"status_sync_failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_step_retry_then_fail() {
        let h = harness();
        let mut provision = step("provision", 2, StepConfig::Action {
            action: "create_account".into(),
            parameters: json!({ "user": "{{process.employee_name}}" }),
        });
        provision.retry = Some(RetryPolicy {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        });
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                provision,
                step("end", 3, StepConfig::End {}),
            ]))
            .await;
        h.execution.fail_action("create_account");

        let result = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();
        assert_eq!(result.status, InstanceStatus::Failed);
        assert_eq!(h.execution.actions().len(), 3);
        assert_eq!(h.execution.actions()[0].1, json!({ "user": "Grace" }));

        let record = &h.records(&result.instance_id).await["provision"];
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.retry_count, 2);

        let failures: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.event == NotificationEvent::WorkflowFailed)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].recipient_ids, vec!["hr-admin".to_string()]);
    }

    #[tokio::test]
    async fn test_definition_stats_follow_outcomes() {
        let h = harness();
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                step("end", 2, StepConfig::End {}),
            ]))
            .await;

        h.engine.start_workflow(options(&def, "P-1")).await.unwrap();
        h.engine.start_workflow(options(&def, "P-2")).await.unwrap();

        let stats = h.definitions.stats(&def.id);
        assert_eq!(stats.usage_count, 2);
        assert_eq!(stats.success_rate, Some(100.0));
        assert!(stats.average_completion_minutes.is_some());
    }

    #[tokio::test]
    async fn test_pause_and_resume_with_input() {
        let h = harness();
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                step("badge", 2, StepConfig::Wait { duration_minutes: None }),
                step("end", 3, StepConfig::End {}),
            ]))
            .await;

        let started = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();
        assert_eq!(started.status, InstanceStatus::WaitingForInput);

        let id = started.instance_id;
        let paused = h.engine.pause_workflow(&id).await.unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);
        assert!(h.engine.pause_workflow(&id).await.is_err());

        let done = h
            .engine
            .resume_workflow(&id, Some(json!({ "badge_id": "B-7" })))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(h.instance(&id).await.variables["badge_id"], json!("B-7"));
        assert_eq!(
            h.records(&id).await["badge"].output,
            Some(json!({ "badge_id": "B-7" }))
        );

        let err = h.engine.resume_workflow(&id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { operation: "resume", .. }));
    }

    #[tokio::test]
    async fn test_poll_releases_task_wait() {
        let h = harness();
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                step("onboard", 2, StepConfig::AssignTasks {
                    tasks: vec![TaskTemplate {
                        title: "Prepare desk".into(),
                        description: None,
                        assignee: Some(Assignee::Role { role: "facilities".into() }),
                        due_in_days: Some(1),
                    }],
                    wait_for_completion: true,
                }),
                step("end", 3, StepConfig::End {}),
            ]))
            .await;

        let started = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();
        assert_eq!(started.status, InstanceStatus::WaitingForTask);
        let id = started.instance_id;

        let still = h.engine.poll_waiting_steps(&id).await.unwrap();
        assert_eq!(still.status, InstanceStatus::WaitingForTask);
        assert_eq!(h.execution.created().len(), 1);

        let task = h.execution.items_for_step("onboard").remove(0);
        h.execution.set_status(&task, WorkItemStatus::Completed);
        let done = h.engine.poll_waiting_steps(&id).await.unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let h = harness();
        let def = h.install(approval_definition()).await;
        let started = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();

        let cancelled = h
            .engine
            .cancel_workflow(&started.instance_id, Some("offer withdrawn"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some("offer withdrawn"));
        assert!(h.engine.cancel_workflow(&started.instance_id, None).await.is_err());

        let err = h
            .engine
            .complete_waiting_step(&started.instance_id, "approve", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert_eq!(
            h.sync.calls().last(),
            Some(&("P-1".to_string(), InstanceStatus::Cancelled))
        );
    }

    #[tokio::test]
    async fn test_execute_step_jumps_to_step() {
        let h = harness();
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                step("hold", 2, StepConfig::Wait { duration_minutes: None }),
                step("tag", 3, set_n(5)),
                step("end", 4, StepConfig::End {}),
            ]))
            .await;
        let started = h.engine.start_workflow(options(&def, "P-1")).await.unwrap();

        let result = h.engine.execute_step(&started.instance_id, "tag").await.unwrap();
        assert_eq!(result.status, InstanceStatus::Completed);
        assert_eq!(h.instance(&started.instance_id).await.variables["n"], json!(5));

        let snapshot = h.engine.get_instance_snapshot(&started.instance_id).await.unwrap();
        assert_eq!(snapshot.steps.len(), 4);
    }

    #[tokio::test]
    async fn test_transition_loop_fails_at_step_ceiling() {
        let mut config = fast_config();
        config.max_steps_per_run = 10;
        let h = harness_with(config);

        let mut spin = step("spin", 2, set_n(1));
        spin.on_complete = Some(Transition::Goto { target: "spin".into() });
        let def = h
            .install(definition(vec![
                step("start", 1, StepConfig::Start {}),
                spin,
                step("end", 3, StepConfig::End {}),
            ]))
            .await;

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            h.engine.start_workflow(options(&def, "P-1")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.status, InstanceStatus::Failed);
        let error = result.error.unwrap();
        assert!(error.contains("exceeded 10 steps"));
        assert!(error.contains("'spin'"));
    }

    #[test]
    fn test_saturating_count_clamps() {
        assert_eq!(saturating_count(3), 3);
        assert_eq!(saturating_count(usize::MAX), u32::MAX);
    }
}
