//! Step runner: per-type dispatch for workflow steps.
//!
//! `StepRunner` executes one step against a [`StepContext`] and reports what
//! the engine should do next through [`StepOutput::action`]. Steps that need
//! the engine itself (Parallel fan-out and CallWorkflow) are dispatched by
//! the engine; every other type runs here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tenure_types::config::EngineConfig;
use tenure_types::instance::{WaitReason, WorkItemStatus};
use tenure_types::workflow::{
    Assignee, NotificationSettings, Recipient, StepConfig, StepDefinition, TaskTemplate,
    TimeoutAction,
};
use uuid::Uuid;

use super::collaborators::{
    BoxFuture, CollaboratorError, HttpTransport, Notification, NotificationDispatcher,
    NotificationEvent, NotificationOutcome, StepExecutionContext, WorkItemKind, WorkItemRequest,
    notify_best_effort,
};
use super::context::{EvaluationContext, value_to_string};
use super::expression::{ConditionEvaluator, ExpressionError};
use super::handlers::{for_each, webhook};

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// What the engine does after a step handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Mark the step complete and follow its transition.
    Continue,
    /// Suspend the instance until an external signal arrives.
    Wait(WaitReason),
    /// Mark the step skipped and follow its transition.
    Skip,
    /// The step failed; retried per policy, then fails the instance.
    Fail,
}

/// Result of running a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub action: StepAction,
    /// Stored on the step record and exposed as `result` to branch rules.
    pub output: Value,
    /// Merged into the instance variables on success.
    pub variables: Map<String, Value>,
    /// External items (tasks, approvals) created by this step.
    pub created_item_ids: Vec<String>,
    pub error: Option<String>,
}

impl StepOutput {
    pub fn continue_with(output: Value) -> Self {
        Self {
            action: StepAction::Continue,
            output,
            variables: Map::new(),
            created_item_ids: Vec::new(),
            error: None,
        }
    }

    pub fn wait(reason: WaitReason, output: Value) -> Self {
        Self {
            action: StepAction::Wait(reason),
            ..Self::continue_with(output)
        }
    }

    pub fn skip(output: Value) -> Self {
        Self {
            action: StepAction::Skip,
            ..Self::continue_with(output)
        }
    }

    pub fn fail(error: impl Into<String>, output: Value) -> Self {
        Self {
            action: StepAction::Fail,
            error: Some(error.into()),
            ..Self::continue_with(output)
        }
    }

    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.variables.insert(name.to_string(), value);
        self
    }

    pub fn with_items(mut self, ids: Vec<String>) -> Self {
        self.created_item_ids = ids;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.action == StepAction::Fail
    }

    pub fn wait_reason(&self) -> Option<WaitReason> {
        match self.action {
            StepAction::Wait(reason) => Some(reason),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors raised while running a step. Treated like a `Fail` action.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step '{step_id}' is missing required config '{field}'")]
    MissingConfig { step_id: String, field: String },

    #[error("collaborator call failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("condition evaluation failed: {0}")]
    Expression(#[from] ExpressionError),

    #[error("step '{step_id}' of type '{step_type}' cannot run here")]
    Unsupported { step_id: String, step_type: String },

    #[error("step execution failed: {0}")]
    ExecutionFailed(String),
}

impl StepError {
    pub fn missing(step: &StepDefinition, field: &str) -> Self {
        StepError::MissingConfig {
            step_id: step.id.clone(),
            field: field.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Everything a step handler may read.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: Uuid,
    pub process_id: String,
    pub workflow_title: String,
    pub eval: EvaluationContext,
    /// When this step first entered `InProgress`.
    pub step_started_at: Option<DateTime<Utc>>,
    /// Items this step created on a previous entry.
    pub existing_item_ids: Vec<String>,
    /// Items created by the steps a `wait_for_tasks` step watches.
    pub tracked_item_ids: Vec<String>,
    /// Output stored by a previous entry of this step.
    pub previous_output: Option<Value>,
    /// Data supplied by the resume call that re-entered this step.
    pub trigger: Option<Value>,
    pub notifications: NotificationSettings,
    pub now: DateTime<Utc>,
}

impl StepContext {
    pub fn new(instance_id: Uuid, process_id: &str, eval: EvaluationContext) -> Self {
        Self {
            instance_id,
            process_id: process_id.to_string(),
            workflow_title: String::new(),
            eval,
            step_started_at: None,
            existing_item_ids: Vec::new(),
            tracked_item_ids: Vec::new(),
            previous_output: None,
            trigger: None,
            notifications: NotificationSettings::default(),
            now: Utc::now(),
        }
    }

    /// Context for another step sharing this one's variables (loop bodies, branches).
    pub fn for_sibling(&self, step: &StepDefinition) -> Self {
        Self {
            eval: self.eval.clone().with_step(step),
            step_started_at: None,
            existing_item_ids: Vec::new(),
            tracked_item_ids: Vec::new(),
            previous_output: None,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual workflow steps by dispatching to type-specific handlers.
pub struct StepRunner {
    execution: Arc<dyn StepExecutionContext>,
    notifier: Arc<dyn NotificationDispatcher>,
    http: Arc<dyn HttpTransport>,
    evaluator: ConditionEvaluator,
    webhook_timeout: Duration,
    for_each_concurrency: usize,
}

impl StepRunner {
    pub fn new(
        execution: Arc<dyn StepExecutionContext>,
        notifier: Arc<dyn NotificationDispatcher>,
        http: Arc<dyn HttpTransport>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            execution,
            notifier,
            http,
            evaluator: ConditionEvaluator::new(),
            webhook_timeout: Duration::from_millis(config.default_webhook_timeout_ms),
            for_each_concurrency: config.default_for_each_concurrency.max(1),
        }
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    pub fn notifier(&self) -> &dyn NotificationDispatcher {
        self.notifier.as_ref()
    }

    pub fn for_each_concurrency(&self) -> usize {
        self.for_each_concurrency
    }

    /// Run a step and return its output.
    ///
    /// Boxed so loop bodies can recurse back into the runner.
    pub fn run<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a StepContext,
    ) -> BoxFuture<'a, Result<StepOutput, StepError>> {
        Box::pin(async move {
            tracing::debug!(
                instance_id = %ctx.instance_id,
                step_id = step.id.as_str(),
                step_type = step.step_type().as_str(),
                "running step"
            );

            match &step.config {
                StepConfig::Start {} | StepConfig::End {} => {
                    Ok(StepOutput::continue_with(json!({})))
                }
                StepConfig::CreateTask {
                    title,
                    description,
                    assignee,
                    due_in_days,
                    priority,
                    wait_for_completion,
                } => {
                    let template = TaskTemplate {
                        title: title.clone(),
                        description: description.clone(),
                        assignee: assignee.clone(),
                        due_in_days: *due_in_days,
                    };
                    self.run_tasks(
                        step,
                        std::slice::from_ref(&template),
                        priority.as_deref(),
                        *wait_for_completion,
                        ctx,
                    )
                    .await
                }
                StepConfig::AssignTasks {
                    tasks,
                    wait_for_completion,
                } => {
                    self.run_tasks(step, tasks, None, *wait_for_completion, ctx)
                        .await
                }
                StepConfig::Approval {
                    approver,
                    title,
                    message,
                    due_in_days,
                } => {
                    self.run_approval(step, approver.as_ref(), title.as_deref(), message.as_deref(), *due_in_days, ctx)
                        .await
                }
                StepConfig::Notification {
                    recipients,
                    subject,
                    template,
                    message,
                } => {
                    self.run_notification(step, recipients, subject.as_deref(), template.as_deref(), message.as_deref(), ctx)
                        .await
                }
                StepConfig::Condition {
                    conditions,
                    output_variable,
                } => {
                    if conditions.is_empty() {
                        return Err(StepError::missing(step, "conditions"));
                    }
                    let result = self
                        .evaluator
                        .evaluate_condition_groups(conditions, &ctx.eval)?;
                    let mut output = StepOutput::continue_with(json!({ "result": result }));
                    if let Some(name) = output_variable {
                        output = output.with_variable(name, json!(result));
                    }
                    Ok(output)
                }
                StepConfig::SetVariable { assignments } => {
                    if assignments.is_empty() {
                        return Err(StepError::missing(step, "assignments"));
                    }
                    let mut scoped = ctx.eval.clone();
                    let mut assigned = Map::new();
                    for assignment in assignments {
                        let value = scoped.resolve_value(&assignment.value);
                        scoped.set_variable(&assignment.name, value.clone());
                        assigned.insert(assignment.name.clone(), value);
                    }
                    Ok(StepOutput {
                        variables: assigned.clone(),
                        ..StepOutput::continue_with(Value::Object(assigned))
                    })
                }
                StepConfig::Wait { duration_minutes } => Ok(run_wait(*duration_minutes, ctx)),
                StepConfig::WaitForTasks {
                    timeout_hours,
                    on_timeout,
                    escalation_recipients,
                    ..
                } => {
                    self.run_wait_for_tasks(*timeout_hours, *on_timeout, escalation_recipients, ctx)
                        .await
                }
                StepConfig::ForEach { .. } => for_each::run_for_each(self, step, ctx).await,
                StepConfig::Webhook { .. } => {
                    webhook::run_webhook(self.http.as_ref(), step, ctx, self.webhook_timeout).await
                }
                StepConfig::Action { action, parameters } => {
                    if action.trim().is_empty() {
                        return Err(StepError::missing(step, "action"));
                    }
                    let action = ctx.eval.resolve_template(action);
                    let parameters = ctx.eval.resolve_value(parameters);
                    match self.execution.execute_action(&action, &parameters).await {
                        Ok(result) => Ok(StepOutput::continue_with(result)),
                        Err(e) => Ok(StepOutput::fail(
                            format!("action '{action}' failed: {e}"),
                            json!({ "action": action, "error": e.to_string() }),
                        )),
                    }
                }
                StepConfig::Parallel { .. } | StepConfig::CallWorkflow { .. } => {
                    Err(StepError::Unsupported {
                        step_id: step.id.clone(),
                        step_type: step.step_type().to_string(),
                    })
                }
            }
        })
    }

    // -- Tasks: create once, then wait on their status if asked to --

    async fn run_tasks(
        &self,
        step: &StepDefinition,
        tasks: &[TaskTemplate],
        priority: Option<&str>,
        wait_for_completion: bool,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        if !ctx.existing_item_ids.is_empty() {
            return self
                .check_existing_tasks(&ctx.existing_item_ids, wait_for_completion)
                .await;
        }

        if tasks.is_empty() {
            return Err(StepError::missing(step, "tasks"));
        }

        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            if task.title.trim().is_empty() {
                return Err(StepError::missing(step, "title"));
            }
            let request = WorkItemRequest {
                kind: WorkItemKind::Task,
                instance_id: ctx.instance_id,
                process_id: ctx.process_id.clone(),
                step_id: step.id.clone(),
                title: ctx.eval.resolve_template(&task.title),
                description: task.description.as_deref().map(|d| ctx.eval.resolve_template(d)),
                assignee: task.assignee.as_ref().and_then(|a| resolve_assignee(a, &ctx.eval)),
                due_at: task
                    .due_in_days
                    .map(|days| ctx.now + chrono::Duration::days(i64::from(days))),
                priority: priority.map(str::to_string),
            };
            ids.push(self.execution.create_work_item(request).await?);
        }

        tracing::info!(
            instance_id = %ctx.instance_id,
            step_id = step.id.as_str(),
            count = ids.len(),
            "tasks created"
        );

        let output = json!({ "task_ids": ids });
        let result = if wait_for_completion {
            StepOutput::wait(WaitReason::Tasks, output)
        } else {
            StepOutput::continue_with(output)
        };
        Ok(result.with_items(ids))
    }

    async fn check_existing_tasks(
        &self,
        ids: &[String],
        wait_for_completion: bool,
    ) -> Result<StepOutput, StepError> {
        let output = json!({ "task_ids": ids });
        if !wait_for_completion {
            return Ok(StepOutput::continue_with(output).with_items(ids.to_vec()));
        }
        let statuses = self.execution.work_item_statuses(ids).await?;
        let result = if all_closed(ids, &statuses) {
            StepOutput::continue_with(json!({ "task_ids": ids, "statuses": statuses }))
        } else {
            StepOutput::wait(WaitReason::Tasks, output)
        };
        Ok(result.with_items(ids.to_vec()))
    }

    // -- Approval: create the approval item and wait for a decision --

    async fn run_approval(
        &self,
        step: &StepDefinition,
        approver: Option<&Assignee>,
        title: Option<&str>,
        message: Option<&str>,
        due_in_days: Option<u32>,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        if let Some(approval_id) = ctx.existing_item_ids.first() {
            let statuses = self
                .execution
                .work_item_statuses(std::slice::from_ref(approval_id))
                .await?;
            let decision = match statuses.get(approval_id) {
                Some(WorkItemStatus::Completed) => Some("approved"),
                Some(WorkItemStatus::Rejected) => Some("rejected"),
                Some(WorkItemStatus::Cancelled) => Some("cancelled"),
                Some(WorkItemStatus::Open) | None => None,
            };
            let result = match decision {
                Some(decision) => StepOutput::continue_with(json!({
                    "approval_id": approval_id,
                    "decision": decision,
                })),
                None => StepOutput::wait(
                    WaitReason::Approval,
                    json!({ "approval_id": approval_id }),
                ),
            };
            return Ok(result.with_items(ctx.existing_item_ids.clone()));
        }

        let approver = approver.ok_or_else(|| StepError::missing(step, "approver"))?;
        let assignee = resolve_assignee(approver, &ctx.eval).ok_or_else(|| {
            StepError::ExecutionFailed(format!(
                "approver for step '{}' could not be resolved",
                step.id
            ))
        })?;

        let request = WorkItemRequest {
            kind: WorkItemKind::Approval,
            instance_id: ctx.instance_id,
            process_id: ctx.process_id.clone(),
            step_id: step.id.clone(),
            title: title
                .map(|t| ctx.eval.resolve_template(t))
                .unwrap_or_else(|| step.name.clone()),
            description: message.map(|m| ctx.eval.resolve_template(m)),
            assignee: Some(assignee.clone()),
            due_at: due_in_days.map(|days| ctx.now + chrono::Duration::days(i64::from(days))),
            priority: None,
        };
        let approval_id = self.execution.create_work_item(request).await?;

        tracing::info!(
            instance_id = %ctx.instance_id,
            step_id = step.id.as_str(),
            approval_id = approval_id.as_str(),
            approver = assignee.as_str(),
            "approval requested"
        );

        Ok(StepOutput::wait(
            WaitReason::Approval,
            json!({ "approval_id": approval_id, "approver": assignee }),
        )
        .with_items(vec![approval_id]))
    }

    // -- Notification: best effort, never fails the step --

    async fn run_notification(
        &self,
        step: &StepDefinition,
        recipients: &[Recipient],
        subject: Option<&str>,
        template: Option<&str>,
        message: Option<&str>,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        if recipients.is_empty() {
            return Err(StepError::missing(step, "recipients"));
        }
        let (recipient_ids, recipient_emails) = resolve_recipients(recipients, &ctx.eval);

        let notification = Notification {
            event: NotificationEvent::Step,
            instance_id: ctx.instance_id,
            process_id: ctx.process_id.clone(),
            workflow_title: ctx.workflow_title.clone(),
            recipient_ids,
            recipient_emails,
            subject: subject
                .map(|s| ctx.eval.resolve_template(s))
                .unwrap_or_else(|| step.name.clone()),
            message: message.map(|m| ctx.eval.resolve_template(m)).unwrap_or_default(),
            template: template.map(str::to_string),
        };

        let outcome = notify_best_effort(self.notifier.as_ref(), notification).await;
        Ok(StepOutput::continue_with(json!({
            "delivered": outcome.is_delivered(),
            "outcome": outcome,
        })))
    }

    // -- WaitForTasks: poll item statuses, apply the timeout policy --

    async fn run_wait_for_tasks(
        &self,
        timeout_hours: Option<u64>,
        on_timeout: TimeoutAction,
        escalation_recipients: &[Recipient],
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        let ids = &ctx.tracked_item_ids;
        if ids.is_empty() {
            return Ok(StepOutput::continue_with(json!({ "tracked": 0, "completed": 0 })));
        }

        let statuses = self.execution.work_item_statuses(ids).await?;
        let completed = ids
            .iter()
            .filter(|id| statuses.get(*id).is_some_and(WorkItemStatus::is_closed))
            .count();
        if completed == ids.len() {
            return Ok(StepOutput::continue_with(json!({
                "tracked": ids.len(),
                "completed": completed,
            })));
        }

        let pending: Vec<&String> = ids
            .iter()
            .filter(|id| !statuses.get(*id).is_some_and(WorkItemStatus::is_closed))
            .collect();
        let already_escalated = ctx
            .previous_output
            .as_ref()
            .and_then(|o| o.get("escalated"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let timed_out = match (timeout_hours, ctx.step_started_at) {
            (Some(hours), Some(started)) => {
                ctx.now - started >= chrono::Duration::hours(hours as i64)
            }
            _ => false,
        };

        if !timed_out {
            return Ok(StepOutput::wait(
                WaitReason::Tasks,
                json!({
                    "tracked": ids.len(),
                    "completed": completed,
                    "pending": pending,
                    "escalated": already_escalated,
                }),
            ));
        }

        let summary = json!({
            "tracked": ids.len(),
            "completed": completed,
            "pending": pending,
            "timed_out": true,
        });

        match on_timeout {
            TimeoutAction::Skip => {
                tracing::warn!(instance_id = %ctx.instance_id, "wait_for_tasks timed out, skipping");
                Ok(StepOutput::skip(summary))
            }
            TimeoutAction::Fail => Ok(StepOutput::fail(
                format!("timed out waiting for {} of {} tasks", pending.len(), ids.len()),
                summary,
            )),
            TimeoutAction::Escalate => {
                if already_escalated {
                    let mut output = summary;
                    output["escalated"] = json!(true);
                    return Ok(StepOutput::wait(WaitReason::Tasks, output));
                }
                let outcomes = self.escalate(escalation_recipients, pending.len(), ctx).await;
                tracing::warn!(
                    instance_id = %ctx.instance_id,
                    pending = pending.len(),
                    "wait_for_tasks timed out, escalated"
                );
                let mut output = summary;
                output["escalated"] = json!(true);
                output["escalated_at"] = json!(ctx.now.to_rfc3339());
                output["notifications"] = json!(outcomes);
                Ok(StepOutput::wait(WaitReason::Tasks, output))
            }
        }
    }

    async fn escalate(
        &self,
        recipients: &[Recipient],
        pending: usize,
        ctx: &StepContext,
    ) -> Vec<NotificationOutcome> {
        let step_name = ctx
            .eval
            .step
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("wait for tasks")
            .to_string();
        let message = format!(
            "{pending} task(s) in step '{step_name}' of '{}' are overdue",
            ctx.workflow_title
        );
        let mut outcomes = Vec::new();

        let (ids, emails) = resolve_recipients(recipients, &ctx.eval);
        outcomes.push(
            notify_best_effort(
                self.notifier.as_ref(),
                Notification {
                    event: NotificationEvent::Escalation,
                    instance_id: ctx.instance_id,
                    process_id: ctx.process_id.clone(),
                    workflow_title: ctx.workflow_title.clone(),
                    recipient_ids: ids,
                    recipient_emails: emails,
                    subject: format!("Escalation: {step_name}"),
                    message: message.clone(),
                    template: None,
                },
            )
            .await,
        );

        if ctx.notifications.on_sla_breach {
            outcomes.push(
                notify_best_effort(
                    self.notifier.as_ref(),
                    Notification {
                        event: NotificationEvent::SlaBreach,
                        instance_id: ctx.instance_id,
                        process_id: ctx.process_id.clone(),
                        workflow_title: ctx.workflow_title.clone(),
                        recipient_ids: ctx.notifications.recipient_ids.clone(),
                        recipient_emails: ctx.notifications.recipient_emails.clone(),
                        subject: format!("SLA breach: {}", ctx.workflow_title),
                        message,
                        template: None,
                    },
                )
                .await,
            );
        }

        outcomes
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_wait(duration_minutes: Option<u64>, ctx: &StepContext) -> StepOutput {
    match duration_minutes {
        Some(minutes) => {
            let started = ctx.step_started_at.unwrap_or(ctx.now);
            let resume_at = started + chrono::Duration::minutes(minutes as i64);
            if ctx.now >= resume_at {
                StepOutput::continue_with(json!({ "waited_minutes": minutes }))
            } else {
                StepOutput::wait(
                    WaitReason::Input,
                    json!({ "resume_at": resume_at.to_rfc3339() }),
                )
            }
        }
        None => match &ctx.trigger {
            Some(data) => StepOutput::continue_with(data.clone()),
            None => StepOutput::wait(WaitReason::Input, json!({ "awaiting": "input" })),
        },
    }
}

fn all_closed(ids: &[String], statuses: &HashMap<String, WorkItemStatus>) -> bool {
    ids.iter()
        .all(|id| statuses.get(id).is_some_and(WorkItemStatus::is_closed))
}

/// Resolve an assignee to the identifier handed to the task system.
pub fn resolve_assignee(assignee: &Assignee, ctx: &EvaluationContext) -> Option<String> {
    let resolved = match assignee {
        Assignee::User { user_id } => ctx.resolve_template(user_id),
        Assignee::Role { role } => format!("role:{role}"),
        Assignee::Manager => match ctx.lookup("process.manager_id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return None,
        },
        Assignee::Variable { path } => match ctx.lookup(path) {
            Some(Value::Null) | None => return None,
            Some(value) => value_to_string(&value),
        },
    };
    (!resolved.trim().is_empty()).then_some(resolved)
}

/// Split recipients into (user IDs, email addresses).
pub fn resolve_recipients(recipients: &[Recipient], ctx: &EvaluationContext) -> (Vec<String>, Vec<String>) {
    let mut ids = Vec::new();
    let mut emails = Vec::new();

    let mut push = |value: String| {
        if value.contains('@') {
            emails.push(value);
        } else if !value.is_empty() {
            ids.push(value);
        }
    };

    for recipient in recipients {
        match recipient {
            Recipient::User { user_id } => push(ctx.resolve_template(user_id)),
            Recipient::Email { address } => push(ctx.resolve_template(address)),
            Recipient::Role { role } => push(format!("role:{role}")),
            Recipient::Manager => {
                if let Some(Value::String(id)) = ctx.lookup("process.manager_id") {
                    push(id);
                }
            }
            Recipient::Variable { path } => match ctx.lookup(path) {
                Some(Value::Array(items)) => {
                    for item in items.iter().filter(|v| !v.is_null()) {
                        push(value_to_string(item));
                    }
                }
                Some(Value::Null) | None => {}
                Some(value) => push(value_to_string(&value)),
            },
        }
    }

    (ids, emails)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
