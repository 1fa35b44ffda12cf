//! Parallel step: fan out to the referenced steps and join on all of them.
//!
//! Branches run concurrently against a shared snapshot of the instance
//! variables and are settled independently. The step waits while any branch
//! waits; once every branch is done the outcomes are joined under the
//! step's failure policy:
//! - `fail_on_any_error` (default): any failed branch fails the step
//! - otherwise the step succeeds if at least one branch succeeded

use std::collections::BTreeMap;

use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use tenure_types::instance::{
    InstanceLogEntry, LogLevel, StepRecord, StepStatus, WaitReason, WorkflowInstance,
};
use tenure_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use crate::repository::definition::DefinitionRepository;
use crate::repository::instance::InstanceRepository;
use crate::workflow::context::EvaluationContext;
use crate::workflow::engine::{EngineError, WorkflowEngine};
use crate::workflow::step_runner::{StepAction, StepOutput};
use crate::workflow::transition::TransitionError;

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum BranchState {
    Succeeded,
    Skipped,
    Failed,
    Waiting(WaitReason),
}

/// Settled (or suspended) state of one branch.
#[derive(Debug, Clone)]
pub struct BranchOutcome {
    pub step_id: String,
    pub state: BranchState,
    pub output: Value,
    pub error: Option<String>,
    pub item_ids: Vec<String>,
    pub variables: Map<String, Value>,
}

impl BranchOutcome {
    fn from_record(record: &StepRecord) -> Self {
        let state = match record.status {
            StepStatus::Completed => BranchState::Succeeded,
            StepStatus::Skipped => BranchState::Skipped,
            _ => BranchState::Failed,
        };
        Self {
            step_id: record.step_id.clone(),
            state,
            output: record.output.clone().unwrap_or(Value::Null),
            error: record.error_message.clone(),
            item_ids: record.created_item_ids.clone(),
            variables: Map::new(),
        }
    }

    fn is_success(&self) -> bool {
        matches!(self.state, BranchState::Succeeded | BranchState::Skipped)
    }
}

/// Join branch outcomes into the parallel step's output.
///
/// The aggregate is keyed by step ID in sorted order regardless of the
/// order branches finished in.
pub fn join_branches(outcomes: &[BranchOutcome], fail_on_any_error: bool) -> StepOutput {
    let branches: BTreeMap<&str, Value> = outcomes
        .iter()
        .map(|o| {
            (
                o.step_id.as_str(),
                json!({
                    "success": o.is_success(),
                    "output": o.output,
                    "error": o.error,
                    "waiting": matches!(o.state, BranchState::Waiting(_)),
                }),
            )
        })
        .collect();

    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    let failed = outcomes
        .iter()
        .filter(|o| o.state == BranchState::Failed)
        .count();
    let reasons: Vec<WaitReason> = outcomes
        .iter()
        .filter_map(|o| match o.state {
            BranchState::Waiting(reason) => Some(reason),
            _ => None,
        })
        .collect();

    let mut item_ids: Vec<String> = Vec::new();
    for id in outcomes.iter().flat_map(|o| o.item_ids.iter()) {
        if !item_ids.contains(id) {
            item_ids.push(id.clone());
        }
    }

    let success = if !reasons.is_empty() {
        false
    } else if fail_on_any_error {
        failed == 0
    } else {
        succeeded > 0
    };
    let aggregate = json!({
        "success": success,
        "succeeded": succeeded,
        "failed": failed,
        "branches": branches,
    });

    if !reasons.is_empty() {
        let reason = [WaitReason::Approval, WaitReason::Tasks, WaitReason::Input]
            .into_iter()
            .find(|r| reasons.contains(r))
            .unwrap_or(WaitReason::Tasks);
        return StepOutput::wait(reason, aggregate).with_items(item_ids);
    }

    if !success {
        return StepOutput::fail(
            format!("{failed} of {} parallel branches failed", outcomes.len()),
            aggregate,
        )
        .with_items(item_ids);
    }

    let mut output = StepOutput::continue_with(aggregate).with_items(item_ids);
    for outcome in outcomes.iter().filter(|o| o.is_success()) {
        output.variables.extend(outcome.variables.clone());
    }
    output
}

// ---------------------------------------------------------------------------
// Engine glue
// ---------------------------------------------------------------------------

impl<D: DefinitionRepository, I: InstanceRepository> WorkflowEngine<D, I> {
    /// Run (or re-check) every branch of a parallel step.
    ///
    /// On re-entry after a wait, branches that already settled keep their
    /// recorded outcome and only suspended branches run again.
    pub(crate) async fn run_parallel(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        step: &StepDefinition,
        eval: &EvaluationContext,
        resuming: bool,
    ) -> Result<StepOutput, EngineError> {
        let StepConfig::Parallel {
            step_ids,
            fail_on_any_error,
        } = &step.config
        else {
            return Ok(StepOutput::fail("not a parallel step", json!({})));
        };
        if step_ids.is_empty() {
            return Ok(StepOutput::fail("parallel step has no branches", json!({})));
        }

        let mut branches = Vec::with_capacity(step_ids.len());
        for id in step_ids {
            let branch = definition.step(id).ok_or_else(|| TransitionError::UnknownTarget {
                from: step.id.clone(),
                target: id.clone(),
            })?;
            branches.push(branch);
        }

        let mut outcomes: Vec<Option<BranchOutcome>> = vec![None; branches.len()];
        let mut pending = Vec::new();
        for (position, branch) in branches.iter().enumerate() {
            let existing = self.instances.get_step_record(&instance.id, &branch.id).await?;
            let record = match existing {
                Some(r) if resuming && (r.status.is_settled() || r.status == StepStatus::Failed) => {
                    outcomes[position] = Some(BranchOutcome::from_record(&r));
                    continue;
                }
                Some(r) if resuming && r.status == StepStatus::InProgress => r,
                Some(_) => {
                    let fresh = StepRecord::pending(instance.id, &branch.id, &branch.name, branch.step_type());
                    self.instances.update_step_record(&fresh).await?;
                    fresh
                }
                None => {
                    let fresh = StepRecord::pending(instance.id, &branch.id, &branch.name, branch.step_type());
                    self.instances.create_step_record(&fresh).await?;
                    fresh
                }
            };

            let branch_eval = eval.clone().with_step(branch);
            if record.status == StepStatus::Pending
                && !self
                    .runner
                    .evaluator()
                    .evaluate_condition_groups(&branch.conditions, &branch_eval)?
            {
                self.instances
                    .skip_step(&instance.id, &branch.id, Some("entry conditions not met"))
                    .await?;
                outcomes[position] = Some(BranchOutcome {
                    step_id: branch.id.clone(),
                    state: BranchState::Skipped,
                    output: Value::Null,
                    error: None,
                    item_ids: Vec::new(),
                    variables: Map::new(),
                });
                continue;
            }

            self.instances
                .start_step(&instance.id, &branch.id, chrono::Utc::now())
                .await?;
            let record = self
                .instances
                .get_step_record(&instance.id, &branch.id)
                .await?
                .unwrap_or(record);
            let ctx = self
                .step_context(definition, instance, branch, &record, branch_eval, None)
                .await?;
            pending.push((position, *branch, ctx));
        }

        tracing::debug!(
            instance_id = %instance.id,
            step_id = step.id.as_str(),
            running = pending.len(),
            total = branches.len(),
            "dispatching parallel branches"
        );

        let results = join_all(
            pending
                .iter()
                .map(|(_, branch, ctx)| self.runner.run(branch, ctx)),
        )
        .await;

        for ((position, branch, _), result) in pending.iter().zip(results) {
            let output = result.unwrap_or_else(|e| StepOutput::fail(e.to_string(), json!({ "error": e.to_string() })));
            outcomes[*position] = Some(self.settle_branch(&instance.id, branch, output).await?);
        }

        let outcomes: Vec<BranchOutcome> = outcomes.into_iter().flatten().collect();
        Ok(join_branches(&outcomes, fail_on_any_error.unwrap_or(true)))
    }

    /// Persist one branch result on its own step record.
    async fn settle_branch(
        &self,
        instance_id: &Uuid,
        branch: &StepDefinition,
        output: StepOutput,
    ) -> Result<BranchOutcome, EngineError> {
        if !output.created_item_ids.is_empty() {
            self.record_items(instance_id, &branch.id, &output.created_item_ids)
                .await?;
        }

        let state = match output.action {
            StepAction::Continue => {
                self.instances
                    .complete_step(instance_id, &branch.id, Some(&output.output))
                    .await?;
                BranchState::Succeeded
            }
            StepAction::Skip => {
                self.instances
                    .skip_step(instance_id, &branch.id, output.error.as_deref())
                    .await?;
                BranchState::Skipped
            }
            StepAction::Wait(reason) => {
                if let Some(mut record) = self.instances.get_step_record(instance_id, &branch.id).await? {
                    record.output = Some(output.output.clone());
                    self.instances.update_step_record(&record).await?;
                }
                BranchState::Waiting(reason)
            }
            StepAction::Fail => {
                let message = output.error.clone().unwrap_or_else(|| "branch failed".to_string());
                self.instances
                    .fail_step(instance_id, &branch.id, &message, Some(&output.output))
                    .await?;
                BranchState::Failed
            }
        };

        let (event, level) = match state {
            BranchState::Succeeded => ("branch_completed", LogLevel::Info),
            BranchState::Skipped => ("branch_skipped", LogLevel::Info),
            BranchState::Waiting(_) => ("branch_waiting", LogLevel::Info),
            BranchState::Failed => ("branch_failed", LogLevel::Warning),
        };
        self.log(
            InstanceLogEntry::new(
                *instance_id,
                event,
                level,
                format!("Parallel branch '{}': {}", branch.name, event.trim_start_matches("branch_")),
            )
            .with_step(&branch.id, &branch.name)
            .with_data(output.output.clone()),
        )
        .await;

        Ok(BranchOutcome {
            step_id: branch.id.clone(),
            state,
            output: output.output,
            error: output.error,
            item_ids: output.created_item_ids,
            variables: output.variables,
        })
    }

    /// The suspended parallel step that `step_id` is a branch of, if any.
    pub(crate) async fn waiting_parallel_for<'d>(
        &self,
        definition: &'d WorkflowDefinition,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<&'d StepDefinition>, EngineError> {
        for candidate in &definition.steps {
            let StepConfig::Parallel { step_ids, .. } = &candidate.config else {
                continue;
            };
            if !step_ids.iter().any(|id| id == step_id) {
                continue;
            }
            let record = self.instances.get_step_record(instance_id, &candidate.id).await?;
            if record.is_some_and(|r| r.status == StepStatus::InProgress) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Whether any branch of `parallel` is still suspended.
    pub(crate) async fn parallel_branches_pending(
        &self,
        definition: &WorkflowDefinition,
        instance_id: &Uuid,
        parallel: &StepDefinition,
    ) -> Result<bool, EngineError> {
        let StepConfig::Parallel { step_ids, .. } = &parallel.config else {
            return Ok(false);
        };
        for id in step_ids.iter().filter(|id| definition.step(id).is_some()) {
            let record = self.instances.get_step_record(instance_id, id).await?;
            if record.is_some_and(|r| matches!(r.status, StepStatus::InProgress | StepStatus::Pending)) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
