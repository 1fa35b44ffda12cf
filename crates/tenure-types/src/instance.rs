//! Execution tracking types: workflow instances, per-step records and logs.
//!
//! A `WorkflowInstance` is one execution of a definition for one business
//! process. Each step of the definition has a `StepRecord` created up front
//! when the instance starts; the engine moves records through
//! `Pending -> InProgress -> Completed | Failed | Skipped`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::StepType;

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    WaitingForApproval,
    WaitingForTask,
    WaitingForInput,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Statuses whose error message survives a status update without one.
    pub fn carries_error(&self) -> bool {
        matches!(self, InstanceStatus::Failed | InstanceStatus::Cancelled)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            InstanceStatus::WaitingForApproval
                | InstanceStatus::WaitingForTask
                | InstanceStatus::WaitingForInput
        )
    }

    /// Instances in these states can be resumed.
    pub fn is_resumable(&self) -> bool {
        self.is_waiting() || *self == InstanceStatus::Paused
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::WaitingForApproval => "waiting_for_approval",
            InstanceStatus::WaitingForTask => "waiting_for_task",
            InstanceStatus::WaitingForInput => "waiting_for_input",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown instance status '{s}'"))
    }
}

/// What a suspended step is waiting on. Determines the instance's Waiting* status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    Approval,
    Tasks,
    Input,
}

impl WaitReason {
    pub fn instance_status(&self) -> InstanceStatus {
        match self {
            WaitReason::Approval => InstanceStatus::WaitingForApproval,
            WaitReason::Tasks => InstanceStatus::WaitingForTask,
            WaitReason::Input => InstanceStatus::WaitingForInput,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// Back-reference from a child instance to the step that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance_id: Uuid,
    pub step_id: String,
}

/// One execution of a workflow definition against a business process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_version: u32,
    /// Owning business process (joiner/mover/leaver case ID).
    pub process_id: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub progress_percentage: u8,
    /// Free-form business fields of the owning process.
    pub context: Value,
    /// Mutable workflow variables.
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Progress as a whole percentage, clamped to 0..=100.
    pub fn compute_progress(completed: u32, total: u32) -> u8 {
        if total == 0 {
            return 0;
        }
        ((u64::from(completed) * 100) / u64::from(total)).min(100) as u8
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Status of a single step within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Completed or skipped steps count toward progress and are not re-run on resume.
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown step status '{s}'"))
    }
}

/// Per (instance, step) execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub instance_id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Task/approval IDs created while executing, used to detect completion.
    #[serde(default)]
    pub created_item_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A fresh record in `Pending` state.
    pub fn pending(instance_id: Uuid, step_id: &str, step_name: &str, step_type: StepType) -> Self {
        Self {
            instance_id,
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            step_type,
            status: StepStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_item_ids: Vec::new(),
            output: None,
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Instance log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Audit log entry attached to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceLogEntry {
    pub id: Uuid,
    pub instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Event tag, e.g. `step_started`, `workflow_completed`.
    pub event: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InstanceLogEntry {
    pub fn new(instance_id: Uuid, event: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: None,
            step_name: None,
            event: event.to_string(),
            level,
            message: message.into(),
            data: None,
            user_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: &str, step_name: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self.step_name = Some(step_name.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Status of an external task or approval created by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Open,
    Completed,
    Rejected,
    Cancelled,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Open => "open",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Rejected => "rejected",
            WorkItemStatus::Cancelled => "cancelled",
        }
    }

    /// Any state other than `Open` releases a waiting step.
    pub fn is_closed(&self) -> bool {
        !matches!(self, WorkItemStatus::Open)
    }
}
