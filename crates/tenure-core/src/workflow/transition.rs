//! Transition resolution: which step runs after the current one.
//!
//! Pure and side-effect free. The engine decides what to do with an
//! unmatched branch (see `UnmatchedBranchPolicy`).

use tenure_types::workflow::{StepConfig, StepDefinition, Transition, WorkflowDefinition};

use super::context::EvaluationContext;
use super::expression::{ConditionEvaluator, ExpressionError};

/// Outcome of resolving a step's transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Step(String),
    /// The workflow is done.
    End,
    /// A branch transition matched nothing and has no default.
    Unmatched,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("step '{from}' transitions to unknown step '{target}'")]
    UnknownTarget { from: String, target: String },

    #[error("branch condition on step '{step_id}' failed to evaluate: {source}")]
    Condition {
        step_id: String,
        #[source]
        source: ExpressionError,
    },
}

/// Resolve the step following `current`.
///
/// `ctx.result` should hold the output of `current` so branch rules can
/// inspect it.
pub fn resolve_next(
    definition: &WorkflowDefinition,
    current: &StepDefinition,
    ctx: &EvaluationContext,
    evaluator: &ConditionEvaluator,
) -> Result<NextStep, TransitionError> {
    let transition = match (&current.on_complete, &current.config) {
        (Some(transition), _) => transition,
        // An End step without an explicit transition finishes the workflow.
        (None, StepConfig::End {}) => return Ok(NextStep::End),
        (None, _) => &Transition::Next,
    };

    let next = match transition {
        Transition::Next => match next_by_order(definition, current) {
            Some(step) => NextStep::Step(step.id.clone()),
            None => NextStep::End,
        },
        Transition::Goto { target } => NextStep::Step(target.clone()),
        Transition::Branch { branches } => {
            let mut matched = None;
            for branch in branches.iter().filter(|b| !b.is_default) {
                let hit = evaluator
                    .evaluate_conditions(&branch.conditions, branch.logic, ctx)
                    .map_err(|source| TransitionError::Condition {
                        step_id: current.id.clone(),
                        source,
                    })?;
                if hit {
                    matched = Some(branch.target.clone());
                    break;
                }
            }
            match matched.or_else(|| {
                branches
                    .iter()
                    .find(|b| b.is_default)
                    .map(|b| b.target.clone())
            }) {
                Some(target) => NextStep::Step(target),
                None => NextStep::Unmatched,
            }
        }
        Transition::Parallel { targets } => match targets.first() {
            Some(target) => NextStep::Step(target.clone()),
            None => NextStep::End,
        },
        Transition::End => NextStep::End,
    };

    if let NextStep::Step(target) = &next {
        if definition.step(target).is_none() {
            return Err(TransitionError::UnknownTarget {
                from: current.id.clone(),
                target: target.clone(),
            });
        }
    }

    Ok(next)
}

/// The step with the smallest `order` strictly greater than `current`'s.
///
/// Branch targets of a Parallel step are skipped: they already ran as part
/// of the fan-out.
pub fn next_by_order<'a>(
    definition: &'a WorkflowDefinition,
    current: &StepDefinition,
) -> Option<&'a StepDefinition> {
    let branch_targets: &[String] = match &current.config {
        StepConfig::Parallel { step_ids, .. } => step_ids,
        _ => &[],
    };

    definition
        .steps
        .iter()
        .filter(|s| s.order > current.order)
        .filter(|s| !branch_targets.contains(&s.id))
        .min_by_key(|s| s.order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{definition, step};
    use serde_json::json;
    use tenure_types::workflow::{BranchRule, Condition, ConditionLogic, ConditionOperator};

    fn branch(conditions: Vec<Condition>, target: &str, is_default: bool) -> BranchRule {
        BranchRule {
            conditions,
            logic: ConditionLogic::All,
            target: target.to_string(),
            is_default,
        }
    }

    fn approved() -> Condition {
        Condition::compare("result.decision", ConditionOperator::Equals, json!("approved"))
    }

    fn def_with_branch(branches: Vec<BranchRule>) -> WorkflowDefinition {
        let mut review = step("review", 2, StepConfig::Condition {
            conditions: vec![],
            output_variable: None,
        });
        review.on_complete = Some(Transition::Branch { branches });
        definition(vec![
            step("start", 1, StepConfig::Start {}),
            review,
            step("x", 3, StepConfig::End {}),
            step("y", 4, StepConfig::End {}),
        ])
    }

    #[test]
    fn test_next_by_order_picks_smallest_greater_order() {
        let def = definition(vec![
            step("end", 30, StepConfig::End {}),
            step("start", 10, StepConfig::Start {}),
            step("middle", 20, StepConfig::Wait { duration_minutes: Some(5) }),
        ]);
        let ctx = EvaluationContext::default();
        let eval = ConditionEvaluator::new();
        let start = def.step("start").unwrap();
        assert_eq!(
            resolve_next(&def, start, &ctx, &eval).unwrap(),
            NextStep::Step("middle".to_string())
        );
        let end = def.step("end").unwrap();
        assert_eq!(resolve_next(&def, end, &ctx, &eval).unwrap(), NextStep::End);
    }

    #[test]
    fn test_branch_matches_condition_else_default() {
        let def = def_with_branch(vec![
            branch(vec![approved()], "x", false),
            branch(vec![], "y", true),
        ]);
        let eval = ConditionEvaluator::new();
        let review = def.step("review").unwrap();

        let ctx = EvaluationContext::default().with_result(json!({"decision": "approved"}));
        assert_eq!(
            resolve_next(&def, review, &ctx, &eval).unwrap(),
            NextStep::Step("x".to_string())
        );

        let ctx = EvaluationContext::default().with_result(json!({"decision": "rejected"}));
        assert_eq!(
            resolve_next(&def, review, &ctx, &eval).unwrap(),
            NextStep::Step("y".to_string())
        );
    }

    #[test]
    fn test_branch_without_match_or_default_is_unmatched() {
        let def = def_with_branch(vec![branch(vec![approved()], "x", false)]);
        let eval = ConditionEvaluator::new();
        let ctx = EvaluationContext::default().with_result(json!({"decision": "rejected"}));
        assert_eq!(
            resolve_next(&def, def.step("review").unwrap(), &ctx, &eval).unwrap(),
            NextStep::Unmatched
        );
    }

    #[test]
    fn test_goto_unknown_target_is_rejected() {
        let mut start = step("start", 1, StepConfig::Start {});
        start.on_complete = Some(Transition::Goto {
            target: "ghost".to_string(),
        });
        let def = definition(vec![start, step("end", 2, StepConfig::End {})]);
        let err = resolve_next(
            &def,
            def.step("start").unwrap(),
            &EvaluationContext::default(),
            &ConditionEvaluator::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::UnknownTarget { .. }));
    }

    #[test]
    fn test_parallel_transition_and_parallel_step_ordering() {
        let mut start = step("start", 1, StepConfig::Start {});
        start.on_complete = Some(Transition::Parallel {
            targets: vec!["fan".to_string(), "end".to_string()],
        });
        let def = definition(vec![
            start,
            step("fan", 2, StepConfig::Parallel {
                step_ids: vec!["a".to_string(), "b".to_string()],
                fail_on_any_error: None,
            }),
            step("a", 3, StepConfig::Action { action: "a".into(), parameters: json!({}) }),
            step("b", 4, StepConfig::Action { action: "b".into(), parameters: json!({}) }),
            step("end", 5, StepConfig::End {}),
        ]);
        let ctx = EvaluationContext::default();
        let eval = ConditionEvaluator::new();
        assert_eq!(
            resolve_next(&def, def.step("start").unwrap(), &ctx, &eval).unwrap(),
            NextStep::Step("fan".to_string())
        );
        assert_eq!(
            resolve_next(&def, def.step("fan").unwrap(), &ctx, &eval).unwrap(),
            NextStep::Step("end".to_string())
        );
    }

    #[test]
    fn test_end_step_is_terminal_even_with_later_steps() {
        let def = definition(vec![
            step("start", 1, StepConfig::Start {}),
            step("end", 2, StepConfig::End {}),
            step("cleanup", 3, StepConfig::Wait { duration_minutes: None }),
        ]);
        assert_eq!(
            resolve_next(
                &def,
                def.step("end").unwrap(),
                &EvaluationContext::default(),
                &ConditionEvaluator::new()
            )
            .unwrap(),
            NextStep::End
        );
    }

    #[test]
    fn test_end_transition() {
        let mut start = step("start", 1, StepConfig::Start {});
        start.on_complete = Some(Transition::End);
        let def = definition(vec![start, step("end", 2, StepConfig::End {})]);
        assert_eq!(
            resolve_next(
                &def,
                def.step("start").unwrap(),
                &EvaluationContext::default(),
                &ConditionEvaluator::new()
            )
            .unwrap(),
            NextStep::End
        );
    }
}
