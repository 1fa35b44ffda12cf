//! CallWorkflow step: start another definition as a child instance.
//!
//! The child shares the parent's process ID and carries a [`ParentLink`]
//! back to the calling step. Children are driven through the same
//! `step_once` primitive as top-level instances, bounded by
//! `max_sub_workflow_iterations`. With `wait_for_completion` a child that
//! needs to wait cannot finish synchronously and fails the calling step;
//! without it the parent continues once the child ends or suspends.
//!
//! A call whose target definition is already running further up the
//! parent chain, or that would nest deeper than `max_sub_workflow_depth`,
//! fails before the child is created.

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use tenure_types::instance::{InstanceLogEntry, InstanceStatus, LogLevel, ParentLink, WorkflowInstance};
use tenure_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use uuid::Uuid;

use crate::repository::definition::DefinitionRepository;
use crate::repository::instance::InstanceRepository;
use crate::workflow::context::EvaluationContext;
use crate::workflow::engine::{EngineError, StepTransition, WorkflowEngine, saturating_count};
use crate::workflow::step_runner::StepOutput;

/// Child variables from `child_var -> parent path` mappings. Missing paths are left out.
pub fn map_inputs(mapping: &HashMap<String, String>, parent: &EvaluationContext) -> Map<String, Value> {
    let mut variables = Map::new();
    for (child_var, path) in mapping {
        match parent.lookup(path) {
            Some(value) => {
                variables.insert(child_var.clone(), value);
            }
            None => {
                tracing::debug!(child_var = child_var.as_str(), path = path.as_str(), "input mapping path not found");
            }
        }
    }
    variables
}

/// Parent outputs from `parent_var -> child path` mappings.
pub fn map_outputs(mapping: &HashMap<String, String>, child: &EvaluationContext) -> Map<String, Value> {
    mapping
        .iter()
        .filter_map(|(parent_var, path)| child.lookup(path).map(|v| (parent_var.clone(), v)))
        .collect()
}

impl<D: DefinitionRepository, I: InstanceRepository> WorkflowEngine<D, I> {
    pub(crate) async fn run_call_workflow(
        &self,
        parent: &WorkflowInstance,
        step: &StepDefinition,
        eval: &EvaluationContext,
    ) -> Result<StepOutput, EngineError> {
        let StepConfig::CallWorkflow {
            workflow_id,
            workflow_code,
            input_mapping,
            output_mapping,
            wait_for_completion,
        } = &step.config
        else {
            return Ok(StepOutput::fail("not a call_workflow step", json!({})));
        };

        let child_definition = match (workflow_id, workflow_code) {
            (Some(id), _) => self.definitions.get_by_id(id).await?,
            (None, Some(code)) => self.definitions.get_by_code(code).await?,
            (None, None) => {
                return Ok(StepOutput::fail(
                    "call_workflow requires workflow_id or workflow_code",
                    json!({}),
                ));
            }
        };
        let target = workflow_id
            .map(|id| id.to_string())
            .or_else(|| workflow_code.clone())
            .unwrap_or_default();
        let Some(child_definition) = child_definition else {
            return Ok(StepOutput::fail(
                format!("sub-workflow '{target}' not found"),
                json!({ "workflow": target }),
            ));
        };
        if !child_definition.is_active {
            return Ok(StepOutput::fail(
                format!("sub-workflow '{}' is not active", child_definition.code),
                json!({ "workflow": child_definition.code }),
            ));
        }

        let chain = self.call_chain(parent).await?;
        if chain.contains(&child_definition.id) {
            return Ok(StepOutput::fail(
                format!(
                    "recursive sub-workflow call: '{}' is already running in this call chain",
                    child_definition.code
                ),
                json!({ "workflow": child_definition.code }),
            ));
        }
        if saturating_count(chain.len()) > self.config.max_sub_workflow_depth {
            return Ok(StepOutput::fail(
                format!(
                    "sub-workflow '{}' would exceed the nesting depth of {}",
                    child_definition.code, self.config.max_sub_workflow_depth
                ),
                json!({ "workflow": child_definition.code, "depth": chain.len() }),
            ));
        }

        let mut context = match &parent.context {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        context.insert(
            "_parent".to_string(),
            json!({
                "instance_id": parent.id,
                "step_id": step.id,
                "process_id": parent.process_id,
            }),
        );

        let child = self
            .create_instance(
                &child_definition,
                &parent.process_id,
                Value::Object(context),
                map_inputs(input_mapping, eval),
                parent.started_by.clone(),
                Some(ParentLink {
                    instance_id: parent.id,
                    step_id: step.id.clone(),
                }),
            )
            .await?;

        tracing::info!(
            instance_id = %parent.id,
            child_instance_id = %child.id,
            step_id = step.id.as_str(),
            workflow = child_definition.code.as_str(),
            wait = *wait_for_completion,
            "sub-workflow started"
        );
        self.log(
            InstanceLogEntry::new(
                parent.id,
                "sub_workflow_started",
                LogLevel::Info,
                format!("Started sub-workflow '{}'", child_definition.title),
            )
            .with_step(&step.id, &step.name)
            .with_data(json!({ "child_instance_id": child.id })),
        )
        .await;

        let start = child.current_step_id.clone().unwrap_or_default();

        if !*wait_for_completion {
            let (status, error) = match self.drive_child(&child_definition, &child, start).await? {
                ChildRun::Completed => (InstanceStatus::Completed, None),
                ChildRun::Suspended(status) => (status, None),
                ChildRun::Failed(error) => (InstanceStatus::Failed, Some(error)),
                ChildRun::IterationLimit => {
                    let error = self.iteration_limit_error(&child_definition);
                    self.fail_instance(&child_definition, &child.id, None, &error)
                        .await?;
                    (InstanceStatus::Failed, Some(error))
                }
            };
            if let Some(error) = &error {
                tracing::warn!(
                    instance_id = %parent.id,
                    child_instance_id = %child.id,
                    error = error.as_str(),
                    "fire-and-forget sub-workflow failed"
                );
            }
            let mut result = json!({
                "child_instance_id": child.id,
                "status": status,
            });
            if let Some(error) = error {
                result["error"] = json!(error);
            }
            return Ok(StepOutput::continue_with(result));
        }

        match self.drive_child(&child_definition, &child, start).await? {
            ChildRun::Completed => {}
            ChildRun::Failed(error) => {
                return Ok(StepOutput::fail(
                    format!("sub-workflow '{}' failed: {error}", child_definition.code),
                    json!({ "child_instance_id": child.id, "status": InstanceStatus::Failed, "error": error }),
                ));
            }
            ChildRun::Suspended(status) => {
                let error = format!(
                    "sub-workflow '{}' cannot complete synchronously (child is {status})",
                    child_definition.code
                );
                self.instances
                    .update_status(&child.id, InstanceStatus::Cancelled, Some(&error))
                    .await?;
                return Ok(StepOutput::fail(
                    error,
                    json!({ "child_instance_id": child.id, "status": status }),
                ));
            }
            ChildRun::IterationLimit => {
                let error = self.iteration_limit_error(&child_definition);
                self.fail_instance(&child_definition, &child.id, None, &error)
                    .await?;
                return Ok(StepOutput::fail(error, json!({ "child_instance_id": child.id })));
            }
        }

        let finished = self
            .instances
            .get_by_id(&child.id)
            .await?
            .ok_or(EngineError::InstanceNotFound(child.id))?;
        let outputs = map_outputs(output_mapping, &EvaluationContext::for_instance(&finished));

        let mut output = StepOutput::continue_with(json!({
            "child_instance_id": child.id,
            "status": InstanceStatus::Completed,
            "outputs": outputs,
        }));
        output.variables = outputs;
        Ok(output)
    }

    /// Run a child step by step until it ends, waits, fails or hits the ceiling.
    async fn drive_child(
        &self,
        definition: &WorkflowDefinition,
        child: &WorkflowInstance,
        start: String,
    ) -> Result<ChildRun, EngineError> {
        let mut current = start;
        for _ in 0..self.config.max_sub_workflow_iterations {
            match self.step_once(definition, child.id, &current, None).await {
                Ok(StepTransition::Next(next)) => current = next,
                Ok(StepTransition::End) => {
                    self.complete_instance(definition, &child.id).await?;
                    return Ok(ChildRun::Completed);
                }
                Ok(StepTransition::Waiting | StepTransition::Halted) => {
                    return Ok(ChildRun::Suspended(self.child_status(&child.id).await?));
                }
                Err(EngineError::Repository(e)) => return Err(EngineError::Repository(e)),
                Err(e) => {
                    let error = e.to_string();
                    self.fail_instance(definition, &child.id, Some(&current), &error)
                        .await?;
                    return Ok(ChildRun::Failed(error));
                }
            }
        }
        Ok(ChildRun::IterationLimit)
    }

    fn iteration_limit_error(&self, definition: &WorkflowDefinition) -> String {
        format!(
            "sub-workflow '{}' exceeded {} steps",
            definition.code, self.config.max_sub_workflow_iterations
        )
    }

    /// Definition IDs of `instance` and its ancestors, nearest first.
    ///
    /// The walk stops one level past the depth ceiling so a corrupt parent
    /// link cannot loop it.
    async fn call_chain(&self, instance: &WorkflowInstance) -> Result<Vec<Uuid>, EngineError> {
        let limit = self.config.max_sub_workflow_depth as usize + 1;
        let mut chain = vec![instance.definition_id];
        let mut link = instance.parent.clone();
        while let Some(parent) = link {
            if chain.len() > limit {
                break;
            }
            let Some(ancestor) = self.instances.get_by_id(&parent.instance_id).await? else {
                break;
            };
            chain.push(ancestor.definition_id);
            link = ancestor.parent;
        }
        Ok(chain)
    }

    async fn child_status(&self, child_id: &Uuid) -> Result<InstanceStatus, EngineError> {
        Ok(self
            .instances
            .get_by_id(child_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(*child_id))?
            .status)
    }
}

enum ChildRun {
    Completed,
    Failed(String),
    Suspended(InstanceStatus),
    IterationLimit,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
