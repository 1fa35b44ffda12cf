//! Definition validation: structure, per-step configuration and graph shape.
//!
//! Validation never fails; every finding is returned in a
//! [`ValidationResult`]. Structural errors short-circuit the later passes:
//! the graph checks (reachability, loops, end reachability) only run once
//! every step is well-formed and every reference resolves.
//!
//! The step graph is modelled with `petgraph`. Edges follow the same rules as
//! the transition resolver: an explicit `on_complete` contributes its targets,
//! a missing one falls through to next-by-order, and Parallel steps add an
//! edge to each branch they fan out to.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde_json::Value;
use tenure_types::validation::{ValidationCode, ValidationIssue, ValidationResult};
use tenure_types::workflow::{StepConfig, StepDefinition, StepType, Transition, WorkflowDefinition};

use super::transition::next_by_order;

#[derive(Default)]
struct Findings {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Findings {
    fn error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
    }

    fn warn(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    fn required(&mut self, step: &StepDefinition, field: &str, message: &str) {
        self.error(
            ValidationIssue::new(ValidationCode::MissingRequiredConfig, message)
                .for_step(&step.id)
                .on_field(field),
        );
    }

    fn recommended(&mut self, step: &StepDefinition, field: &str, message: &str) {
        self.warn(
            ValidationIssue::new(ValidationCode::MissingRecommendedConfig, message)
                .for_step(&step.id)
                .on_field(field),
        );
    }

    fn finish(self) -> ValidationResult {
        ValidationResult::from_issues(self.errors, self.warnings)
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Validate a parsed definition.
pub fn validate_definition(definition: &WorkflowDefinition) -> ValidationResult {
    let mut findings = Findings::default();

    if definition.title.trim().is_empty() {
        findings.error(ValidationIssue::new(ValidationCode::MissingTitle, "title is required"));
    }
    if definition.code.trim().is_empty() {
        findings.error(ValidationIssue::new(ValidationCode::MissingCode, "code is required"));
    }
    if !findings.errors.is_empty() {
        return findings.finish();
    }

    if definition.steps.is_empty() {
        findings.error(ValidationIssue::new(
            ValidationCode::NoSteps,
            "workflow must have at least one step",
        ));
        return findings.finish();
    }

    check_steps(&definition.steps, false, &mut HashSet::new(), &mut findings);
    check_start_and_end(definition, &mut findings);
    check_references(definition, &mut findings);
    check_self_calls(definition, &mut findings);

    if findings.errors.is_empty() {
        check_graph(definition, &mut findings);
    }

    findings.finish()
}

/// Parse a YAML or JSON definition, reporting problems as validation errors.
pub fn parse_definition(source: &str) -> Result<WorkflowDefinition, ValidationResult> {
    let parse_error = |message: String| {
        ValidationResult::from_issues(
            vec![ValidationIssue::new(ValidationCode::StepsParseError, message)],
            Vec::new(),
        )
    };

    // YAML is a superset of JSON, so one parser covers both.
    let raw: Value = serde_yaml_ng::from_str(source)
        .map_err(|e| parse_error(format!("definition could not be parsed: {e}")))?;
    let Value::Object(fields) = &raw else {
        return Err(parse_error("definition must be a mapping".to_string()));
    };

    let mut findings = Findings::default();
    let blank = |key: &str| match fields.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if blank("title") {
        findings.error(ValidationIssue::new(ValidationCode::MissingTitle, "title is required"));
    }
    if blank("code") {
        findings.error(ValidationIssue::new(ValidationCode::MissingCode, "code is required"));
    }
    if blank("process_type") {
        findings.error(ValidationIssue::new(
            ValidationCode::MissingProcessType,
            "process_type is required (joiner, mover or leaver)",
        ));
    }
    if !findings.errors.is_empty() {
        return Err(findings.finish());
    }

    serde_json::from_value(raw)
        .map_err(|e| parse_error(format!("steps could not be parsed: {e}")))
}

/// Parse and validate a definition source in one go.
pub fn validate_source(source: &str) -> ValidationResult {
    match parse_definition(source) {
        Ok(definition) => validate_definition(&definition),
        Err(result) => result,
    }
}

// ---------------------------------------------------------------------------
// Per-step checks
// ---------------------------------------------------------------------------

/// Step IDs are unique across the whole tree, loop bodies included.
fn check_steps<'a>(
    steps: &'a [StepDefinition],
    nested: bool,
    seen: &mut HashSet<&'a str>,
    findings: &mut Findings,
) {
    for (index, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            findings.error(
                ValidationIssue::new(
                    ValidationCode::MissingStepId,
                    format!("step at position {} has no id", index + 1),
                )
                .on_field("id"),
            );
        } else if !seen.insert(step.id.as_str()) {
            findings.error(
                ValidationIssue::new(
                    ValidationCode::DuplicateStepId,
                    format!("duplicate step id '{}'", step.id),
                )
                .for_step(&step.id),
            );
        }
        if step.name.trim().is_empty() {
            findings.error(
                ValidationIssue::new(ValidationCode::MissingStepName, "step name is required")
                    .for_step(&step.id)
                    .on_field("name"),
            );
        }
        if nested && !allowed_in_loop(step) {
            findings.error(
                ValidationIssue::new(
                    ValidationCode::InvalidNestedStep,
                    format!("{} steps cannot run inside a for_each loop", step.step_type()),
                )
                .for_step(&step.id),
            );
        }
        check_config(step, findings);
        if let StepConfig::ForEach { steps: body, .. } = &step.config {
            check_steps(body, true, seen, findings);
        }
    }
}

/// Loop bodies run to completion in one pass; nothing inside may suspend.
fn allowed_in_loop(step: &StepDefinition) -> bool {
    match &step.config {
        StepConfig::CreateTask { wait_for_completion, .. }
        | StepConfig::AssignTasks { wait_for_completion, .. } => !wait_for_completion,
        _ => !matches!(
            step.step_type(),
            StepType::Start
                | StepType::End
                | StepType::Approval
                | StepType::Wait
                | StepType::WaitForTasks
                | StepType::Parallel
                | StepType::CallWorkflow
        ),
    }
}

fn check_config(step: &StepDefinition, findings: &mut Findings) {
    match &step.config {
        StepConfig::Start {} | StepConfig::End {} => {}
        StepConfig::CreateTask { title, due_in_days, .. } => {
            if title.trim().is_empty() {
                findings.required(step, "title", "create_task needs a title");
            }
            if due_in_days.is_none() {
                findings.recommended(step, "due_in_days", "task has no due date");
            }
        }
        StepConfig::AssignTasks { tasks, .. } => {
            if tasks.is_empty() {
                findings.required(step, "tasks", "assign_tasks needs at least one task");
            }
            for (i, task) in tasks.iter().enumerate() {
                if task.title.trim().is_empty() {
                    findings.required(step, &format!("tasks[{i}].title"), "every task needs a title");
                }
                if task.due_in_days.is_none() {
                    findings.recommended(
                        step,
                        &format!("tasks[{i}].due_in_days"),
                        "task has no due date",
                    );
                }
            }
        }
        StepConfig::Approval { approver, message, due_in_days, .. } => {
            if approver.is_none() {
                findings.required(step, "approver", "approval needs an approver");
            }
            if due_in_days.is_none() {
                findings.recommended(step, "due_in_days", "approval has no due date");
            }
            if message.is_none() {
                findings.recommended(step, "message", "approval has no message for the approver");
            }
        }
        StepConfig::Notification { recipients, template, message, .. } => {
            if recipients.is_empty() {
                findings.required(step, "recipients", "notification needs at least one recipient");
            }
            if template.is_none() && message.is_none() {
                findings.recommended(step, "template", "notification has neither a template nor a message");
            }
        }
        StepConfig::Condition { conditions, .. } => {
            if conditions.is_empty() {
                findings.required(step, "conditions", "condition step needs at least one condition group");
            }
        }
        StepConfig::SetVariable { assignments } => {
            if assignments.is_empty() {
                findings.required(step, "assignments", "set_variable needs at least one assignment");
            }
            for (i, assignment) in assignments.iter().enumerate() {
                if assignment.name.trim().is_empty() {
                    findings.required(step, &format!("assignments[{i}].name"), "assignment needs a variable name");
                }
            }
        }
        StepConfig::Wait { duration_minutes } => {
            if duration_minutes.is_none() {
                findings.recommended(
                    step,
                    "duration_minutes",
                    "wait has no duration and will wait for input",
                );
            }
        }
        StepConfig::WaitForTasks { step_ids, .. } => {
            if step_ids.is_empty() {
                findings.required(step, "step_ids", "wait_for_tasks needs the steps to wait on");
            }
        }
        StepConfig::Parallel { step_ids, .. } => {
            if step_ids.is_empty() {
                findings.required(step, "step_ids", "parallel needs at least one branch");
            }
        }
        StepConfig::ForEach { collection, steps, .. } => {
            if collection.trim().is_empty() {
                findings.required(step, "collection", "for_each needs a collection path");
            }
            if steps.is_empty() {
                findings.required(step, "steps", "for_each needs at least one inner step");
            }
        }
        StepConfig::CallWorkflow { workflow_id, workflow_code, .. } => {
            let has_code = workflow_code.as_deref().is_some_and(|c| !c.trim().is_empty());
            if workflow_id.is_none() && !has_code {
                findings.required(step, "workflow_code", "call_workflow needs a workflow_id or workflow_code");
            }
        }
        StepConfig::Webhook { url, .. } => {
            if url.trim().is_empty() {
                findings.required(step, "url", "webhook needs a url");
            }
        }
        StepConfig::Action { action, .. } => {
            if action.trim().is_empty() {
                findings.required(step, "action", "action step needs an action name");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Definition-level checks
// ---------------------------------------------------------------------------

fn check_start_and_end(definition: &WorkflowDefinition, findings: &mut Findings) {
    let starts = count_of(definition, StepType::Start);
    if starts == 0 {
        findings.error(ValidationIssue::new(
            ValidationCode::MissingStartStep,
            "workflow needs a start step",
        ));
    } else if starts > 1 {
        findings.error(ValidationIssue::new(
            ValidationCode::MultipleStartSteps,
            format!("workflow has {starts} start steps, expected one"),
        ));
    }
    if count_of(definition, StepType::End) == 0 {
        findings.error(ValidationIssue::new(
            ValidationCode::MissingEndStep,
            "workflow needs an end step",
        ));
    }
}

fn count_of(definition: &WorkflowDefinition, step_type: StepType) -> usize {
    definition
        .steps
        .iter()
        .filter(|s| s.step_type() == step_type)
        .count()
}

/// A definition that calls itself can only recurse until the depth ceiling.
fn check_self_calls(definition: &WorkflowDefinition, findings: &mut Findings) {
    for step in &definition.steps {
        let StepConfig::CallWorkflow { workflow_id, workflow_code, .. } = &step.config else {
            continue;
        };
        let by_id = *workflow_id == Some(definition.id);
        let by_code = workflow_code.as_deref() == Some(definition.code.as_str());
        if by_id || by_code {
            findings.error(
                ValidationIssue::new(
                    ValidationCode::RecursiveSubWorkflow,
                    format!("step calls its own workflow '{}'", definition.code),
                )
                .for_step(&step.id),
            );
        }
    }
}

fn check_references(definition: &WorkflowDefinition, findings: &mut Findings) {
    let ids: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &definition.steps {
        if let Some(transition) = &step.on_complete {
            for target in transition.targets() {
                if !ids.contains(target) {
                    findings.error(
                        ValidationIssue::new(
                            ValidationCode::InvalidTransitionTarget,
                            format!("transition targets unknown step '{target}'"),
                        )
                        .for_step(&step.id)
                        .on_field("on_complete"),
                    );
                }
            }
            if let Transition::Branch { branches } = transition {
                let defaults = branches.iter().filter(|b| b.is_default).count();
                if defaults > 1 {
                    findings.error(
                        ValidationIssue::new(
                            ValidationCode::MultipleDefaultBranches,
                            format!("{defaults} default branches, at most one is allowed"),
                        )
                        .for_step(&step.id)
                        .on_field("on_complete"),
                    );
                }
            }
        }

        let references: &[String] = match &step.config {
            StepConfig::Parallel { step_ids, .. } | StepConfig::WaitForTasks { step_ids, .. } => step_ids,
            _ => &[],
        };
        for reference in references {
            if !ids.contains(reference.as_str()) {
                findings.error(
                    ValidationIssue::new(
                        ValidationCode::InvalidStepReference,
                        format!("references unknown step '{reference}'"),
                    )
                    .for_step(&step.id)
                    .on_field("step_ids"),
                );
            } else if reference == &step.id {
                findings.error(
                    ValidationIssue::new(ValidationCode::InvalidStepReference, "step references itself")
                        .for_step(&step.id)
                        .on_field("step_ids"),
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Graph checks
// ---------------------------------------------------------------------------

/// Step IDs reachable in one hop from `step`.
fn successors<'a>(definition: &'a WorkflowDefinition, step: &'a StepDefinition) -> Vec<&'a str> {
    let mut targets = match (&step.on_complete, &step.config) {
        (None, StepConfig::End {}) => Vec::new(),
        (None | Some(Transition::Next), _) => next_by_order(definition, step)
            .map(|next| vec![next.id.as_str()])
            .unwrap_or_default(),
        (Some(transition), _) => transition.targets(),
    };
    if let StepConfig::Parallel { step_ids, .. } = &step.config {
        targets.extend(step_ids.iter().map(String::as_str));
    }
    targets
}

/// A conditioned branch is an exit from a loop.
fn has_exit_condition(step: &StepDefinition) -> bool {
    matches!(
        &step.on_complete,
        Some(Transition::Branch { branches }) if branches.iter().any(|b| b.is_conditioned())
    )
}

fn check_graph(definition: &WorkflowDefinition, findings: &mut Findings) {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, NodeIndex> = definition
        .steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in &definition.steps {
        let from = nodes[step.id.as_str()];
        for target in successors(definition, step) {
            if let Some(&to) = nodes.get(target) {
                graph.update_edge(from, to, ());
            }
        }
    }

    let Some(start) = definition.start_step().map(|s| nodes[s.id.as_str()]) else {
        return;
    };

    // Reachability
    let mut visited = HashSet::new();
    let mut bfs = Bfs::new(&graph, start);
    while let Some(node) = bfs.next(&graph) {
        visited.insert(node);
    }
    for step in definition.ordered_steps() {
        if !visited.contains(&nodes[step.id.as_str()]) {
            findings.warn(
                ValidationIssue::new(
                    ValidationCode::UnreachableStep,
                    format!("step '{}' can never be reached from the start step", step.name),
                )
                .for_step(&step.id),
            );
        }
    }

    // Loops without a conditioned exit
    let by_id: HashMap<&str, &StepDefinition> =
        definition.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    for component in tarjan_scc(&graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&node| graph.contains_edge(node, node));
        if !cyclic {
            continue;
        }
        let members: Vec<&StepDefinition> = component.iter().map(|&n| by_id[graph[n]]).collect();
        if members.iter().any(|s| has_exit_condition(s)) {
            continue;
        }
        let mut ids: Vec<&str> = members.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        for step in &members {
            findings.warn(
                ValidationIssue::new(
                    ValidationCode::PotentialInfiniteLoop,
                    format!("loop [{}] has no conditioned exit", ids.join(" -> ")),
                )
                .for_step(&step.id),
            );
        }
    }

    // End reachability
    let reaches_end = definition
        .steps
        .iter()
        .filter(|s| s.step_type() == StepType::End)
        .any(|end| has_path_connecting(&graph, start, nodes[end.id.as_str()], None));
    if !reaches_end {
        findings.error(ValidationIssue::new(
            ValidationCode::EndUnreachable,
            "no end step is reachable from the start step; the workflow will never complete",
        ));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
