//! Workflow definition types for tenure.
//!
//! A `WorkflowDefinition` is the canonical shape of a joiner/mover/leaver
//! process: an ordered list of steps, each carrying a type-specific
//! configuration (`StepConfig`), optional entry conditions and an optional
//! `on_complete` transition. Definitions load from YAML or JSON and are
//! checked by the definition validator before they can be activated.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Stable lookup code (e.g. "standard-joiner").
    #[serde(default)]
    pub code: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic version, bumped whenever the step set changes.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Which HR process this workflow drives.
    pub process_type: ProcessType,
    /// Only active definitions can be started.
    #[serde(default)]
    pub is_active: bool,
    /// The default definition for its process type.
    #[serde(default)]
    pub is_default: bool,
    /// Steps, in authoring order. Execution order follows `order` and transitions.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Variables seeded into every new instance.
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    /// Conditions under which this workflow is auto-selected for a process.
    #[serde(default)]
    pub triggers: Vec<TriggerCondition>,
    /// Who hears about lifecycle events.
    #[serde(default)]
    pub notifications: NotificationSettings,
    /// Aggregate execution statistics, maintained by the engine.
    #[serde(default)]
    pub stats: DefinitionStats,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Look up a top-level step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The unique Start step, if present.
    pub fn start_step(&self) -> Option<&StepDefinition> {
        self.steps
            .iter()
            .find(|s| s.step_type() == StepType::Start)
    }

    /// Steps sorted by ascending `order` (stable for equal orders).
    pub fn ordered_steps(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<&StepDefinition> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }

    /// Default values for instance variables, keyed by variable name.
    pub fn default_variables(&self) -> serde_json::Map<String, Value> {
        self.variables
            .iter()
            .map(|v| (v.name.clone(), v.default_value.clone().unwrap_or(Value::Null)))
            .collect()
    }
}

/// The HR process a workflow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    Joiner,
    Mover,
    Leaver,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Joiner => "joiner",
            ProcessType::Mover => "mover",
            ProcessType::Leaver => "leaver",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joiner" => Ok(ProcessType::Joiner),
            "mover" => Ok(ProcessType::Mover),
            "leaver" => Ok(ProcessType::Leaver),
            other => Err(format!("unknown process type '{other}'")),
        }
    }
}

/// A workflow variable with an optional default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default, rename = "default", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Selects a workflow for a process when its conditions hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    #[serde(default)]
    pub conditions: Vec<ConditionGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Recipients and toggles for workflow lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub recipient_ids: Vec<String>,
    #[serde(default)]
    pub recipient_emails: Vec<String>,
    #[serde(default = "default_true")]
    pub on_started: bool,
    #[serde(default = "default_true")]
    pub on_completed: bool,
    #[serde(default = "default_true")]
    pub on_failed: bool,
    #[serde(default = "default_true")]
    pub on_sla_breach: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            recipient_ids: Vec::new(),
            recipient_emails: Vec::new(),
            on_started: true,
            on_completed: true,
            on_failed: true,
            on_sla_breach: true,
        }
    }
}

impl NotificationSettings {
    pub fn has_recipients(&self) -> bool {
        !self.recipient_ids.is_empty() || !self.recipient_emails.is_empty()
    }
}

fn default_true() -> bool {
    true
}

/// Aggregate statistics for a definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionStats {
    #[serde(default)]
    pub usage_count: u64,
    /// Percentage of finished instances that completed (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_completion_minutes: Option<f64>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step (node) in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the definition (or within a ForEach body).
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Position used for default (`next`) sequencing.
    #[serde(default)]
    pub order: u32,
    /// Entry conditions; every group must hold or the step is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionGroup>,
    /// What happens after the step completes. `None` means next-by-order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<Transition>,
    /// Retry policy applied when the step handler reports a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Step-specific configuration payload.
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    End,
    CreateTask,
    AssignTasks,
    Approval,
    Notification,
    Condition,
    SetVariable,
    Wait,
    WaitForTasks,
    Parallel,
    ForEach,
    CallWorkflow,
    Webhook,
    Action,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Start => "start",
            StepType::End => "end",
            StepType::CreateTask => "create_task",
            StepType::AssignTasks => "assign_tasks",
            StepType::Approval => "approval",
            StepType::Notification => "notification",
            StepType::Condition => "condition",
            StepType::SetVariable => "set_variable",
            StepType::Wait => "wait",
            StepType::WaitForTasks => "wait_for_tasks",
            StepType::Parallel => "parallel",
            StepType::ForEach => "for_each",
            StepType::CallWorkflow => "call_workflow",
            StepType::Webhook => "webhook",
            StepType::Action => "action",
        }
    }

    /// Step types that may suspend the instance waiting for an external signal.
    pub fn can_wait(&self) -> bool {
        matches!(
            self,
            StepType::Approval
                | StepType::Wait
                | StepType::WaitForTasks
                | StepType::CreateTask
                | StepType::AssignTasks
                | StepType::Parallel
        )
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: approval
///   approver:
///     type: manager
///   due_in_days: 3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Start {},
    End {},
    /// Create one task in the external task system.
    CreateTask {
        #[serde(default)]
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<Assignee>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_in_days: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<String>,
        #[serde(default)]
        wait_for_completion: bool,
    },
    /// Create a batch of tasks.
    AssignTasks {
        #[serde(default)]
        tasks: Vec<TaskTemplate>,
        #[serde(default)]
        wait_for_completion: bool,
    },
    /// Human approval gate; always waits.
    Approval {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approver: Option<Assignee>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_in_days: Option<u32>,
    },
    /// Fire-and-forget notification.
    Notification {
        #[serde(default)]
        recipients: Vec<Recipient>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Evaluate condition groups; the boolean lands in the step result.
    Condition {
        #[serde(default)]
        conditions: Vec<ConditionGroup>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    SetVariable {
        #[serde(default)]
        assignments: Vec<VariableAssignment>,
    },
    /// Pause for a fixed duration, or until input arrives when no duration is set.
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<u64>,
    },
    /// Wait until every item created by the referenced steps is complete.
    WaitForTasks {
        #[serde(default)]
        step_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_hours: Option<u64>,
        #[serde(default)]
        on_timeout: TimeoutAction,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        escalation_recipients: Vec<Recipient>,
    },
    /// Run the referenced steps concurrently and join on all of them.
    Parallel {
        #[serde(default)]
        step_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fail_on_any_error: Option<bool>,
    },
    /// Run an inline step list once per collection item.
    ForEach {
        #[serde(default)]
        collection: String,
        #[serde(default = "default_item_variable")]
        item_variable: String,
        #[serde(default = "default_index_variable")]
        index_variable: String,
        #[serde(default)]
        steps: Vec<StepDefinition>,
        #[serde(default)]
        mode: ForEachMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
        #[serde(default)]
        on_error: ForEachErrorPolicy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Start another workflow as a child instance.
    CallWorkflow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_code: Option<String>,
        /// Child variable name -> parent path (`variables.x`, `process.y`).
        #[serde(default)]
        input_mapping: HashMap<String, String>,
        /// Parent output name -> child variable path.
        #[serde(default)]
        output_mapping: HashMap<String, String>,
        #[serde(default = "default_true")]
        wait_for_completion: bool,
    },
    /// Call an external HTTP endpoint.
    Webhook {
        #[serde(default)]
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },
    /// Named side-effecting action executed by the host application.
    Action {
        #[serde(default)]
        action: String,
        #[serde(default)]
        parameters: Value,
    },
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Start {} => StepType::Start,
            StepConfig::End {} => StepType::End,
            StepConfig::CreateTask { .. } => StepType::CreateTask,
            StepConfig::AssignTasks { .. } => StepType::AssignTasks,
            StepConfig::Approval { .. } => StepType::Approval,
            StepConfig::Notification { .. } => StepType::Notification,
            StepConfig::Condition { .. } => StepType::Condition,
            StepConfig::SetVariable { .. } => StepType::SetVariable,
            StepConfig::Wait { .. } => StepType::Wait,
            StepConfig::WaitForTasks { .. } => StepType::WaitForTasks,
            StepConfig::Parallel { .. } => StepType::Parallel,
            StepConfig::ForEach { .. } => StepType::ForEach,
            StepConfig::CallWorkflow { .. } => StepType::CallWorkflow,
            StepConfig::Webhook { .. } => StepType::Webhook,
            StepConfig::Action { .. } => StepType::Action,
        }
    }
}

/// Who a task or approval is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assignee {
    User { user_id: String },
    Role { role: String },
    /// The line manager recorded on the process.
    Manager,
    /// Dot-path resolved at run time (e.g. `process.hiring_manager_id`).
    Variable { path: String },
}

/// Notification recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    User { user_id: String },
    Email { address: String },
    Role { role: String },
    Manager,
    Variable { path: String },
}

/// One task in an `assign_tasks` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Assignee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_in_days: Option<u32>,
}

/// `name = value` assignment; string values are `{{path}}` templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableAssignment {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// What a `wait_for_tasks` step does once its timeout elapses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Skip,
    Fail,
    #[default]
    Escalate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForEachMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForEachErrorPolicy {
    #[default]
    Fail,
    Continue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// The rule selecting the next step after a step completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// Smallest `order` strictly greater than the current step's.
    Next,
    Goto { target: String },
    /// First matching branch wins; `is_default` is the fallback.
    Branch { branches: Vec<BranchRule> },
    /// Nominal next is the first target; fan-out happens in Parallel steps.
    Parallel { targets: Vec<String> },
    End,
}

impl Transition {
    /// Every step ID this transition can lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Transition::Next | Transition::End => vec![],
            Transition::Goto { target } => vec![target.as_str()],
            Transition::Branch { branches } => branches.iter().map(|b| b.target.as_str()).collect(),
            Transition::Parallel { targets } => targets.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: ConditionLogic,
    pub target: String,
    #[serde(default)]
    pub is_default: bool,
}

impl BranchRule {
    /// A branch with at least one condition is an exit condition for loops.
    pub fn is_conditioned(&self) -> bool {
        !self.conditions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A single predicate over the evaluation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// JEXL expression, e.g. `variables.department == 'IT'`.
    Expression { expression: String },
    /// Structured comparison of a dot-path field against a value.
    Compare {
        field: String,
        operator: ConditionOperator,
        #[serde(default)]
        value: Value,
    },
}

impl Condition {
    pub fn compare(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Condition::Compare {
            field: field.to_string(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    #[default]
    All,
    Any,
}

/// Conditions combined with `all`/`any` logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: ConditionLogic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff policy.
///
/// Attempts run `max_retries + 1` times; the delay before attempt `n + 1`
/// is `min(initial_delay_ms * backoff_multiplier^(n - 1), max_delay_ms)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_yaml_parses_step_configs() {
        let yaml = r#"
title: Standard joiner
code: standard-joiner
process_type: joiner
is_active: true
variables:
  - name: laptop_ordered
    default: false
steps:
  - id: start
    name: Start
    order: 1
    config: { type: start }
  - id: approve
    name: Manager approval
    order: 2
    config:
      type: approval
      approver: { type: manager }
      due_in_days: 3
    on_complete:
      type: branch
      branches:
        - conditions:
            - field: result.decision
              operator: equals
              value: approved
          target: end
        - target: start
          is_default: true
  - id: end
    name: End
    order: 3
    config: { type: end }
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.code, "standard-joiner");
        assert_eq!(def.process_type, ProcessType::Joiner);
        assert_eq!(def.version, 1);
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.start_step().unwrap().id, "start");
        assert_eq!(def.steps[1].step_type(), StepType::Approval);
        assert_eq!(def.default_variables()["laptop_ordered"], json!(false));

        match def.steps[1].on_complete.as_ref().unwrap() {
            Transition::Branch { branches } => {
                assert_eq!(branches.len(), 2);
                assert!(branches[0].is_conditioned());
                assert!(branches[1].is_default);
                assert_eq!(
                    branches[0].conditions[0],
                    Condition::compare("result.decision", ConditionOperator::Equals, json!("approved"))
                );
            }
            other => panic!("expected branch transition, got {other:?}"),
        }
    }

    #[test]
    fn test_condition_untagged_expression() {
        let c: Condition =
            serde_json::from_value(json!({"expression": "variables.level > 3"})).unwrap();
        assert!(matches!(c, Condition::Expression { .. }));
    }

    #[test]
    fn test_for_each_defaults() {
        let cfg: StepConfig = serde_json::from_value(json!({
            "type": "for_each",
            "collection": "variables.systems",
            "steps": [{"id": "grant", "name": "Grant", "config": {"type": "action", "action": "grant"}}]
        }))
        .unwrap();
        match cfg {
            StepConfig::ForEach {
                item_variable,
                index_variable,
                mode,
                on_error,
                steps,
                ..
            } => {
                assert_eq!(item_variable, "item");
                assert_eq!(index_variable, "index");
                assert_eq!(mode, ForEachMode::Sequential);
                assert_eq!(on_error, ForEachErrorPolicy::Fail);
                assert_eq!(steps.len(), 1);
            }
            other => panic!("expected for_each, got {other:?}"),
        }
    }

    #[test]
    fn test_transition_targets() {
        let t = Transition::Parallel {
            targets: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(t.targets(), vec!["a", "b"]);
        assert!(Transition::Next.targets().is_empty());
        let t: Transition = serde_json::from_value(json!({"type": "goto", "target": "x"})).unwrap();
        assert_eq!(t, Transition::Goto { target: "x".to_string() });
    }

    #[test]
    fn test_retry_policy_defaults() {
        let p: RetryPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(p, RetryPolicy::default());
        assert_eq!(p.max_attempts(), 4);
    }

    #[test]
    fn test_webhook_method_serializes_uppercase() {
        let cfg = StepConfig::Webhook {
            url: "https://hr.example.com/hook".to_string(),
            method: HttpMethod::Put,
            headers: HashMap::new(),
            body: None,
            timeout_ms: None,
            output_variable: None,
        };
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["type"], "webhook");
        assert_eq!(v["method"], "PUT");
    }
}
