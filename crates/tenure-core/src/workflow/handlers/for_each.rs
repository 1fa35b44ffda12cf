//! ForEach step: run an inline step list once per collection item.
//!
//! Each iteration sees the parent's variables plus `item_variable`,
//! `index_variable` and a `loop` object (`index`, `total`, `first`, `last`).
//! Variables written inside an iteration stay inside it; only the aggregate
//! output (and `output_variable`) reach the parent.

use futures_util::future::join_all;
use serde_json::{Value, json};
use tenure_types::workflow::{ForEachErrorPolicy, ForEachMode, StepConfig, StepDefinition};

use crate::workflow::step_runner::{StepAction, StepContext, StepError, StepOutput, StepRunner};

/// Result of one loop iteration.
#[derive(Debug, Clone)]
struct IterationResult {
    index: usize,
    success: bool,
    output: Value,
    error: Option<String>,
}

impl IterationResult {
    fn to_json(&self) -> Value {
        json!({
            "index": self.index,
            "success": self.success,
            "output": self.output,
            "error": self.error,
        })
    }
}

/// Execute a `for_each` step.
pub async fn run_for_each(
    runner: &StepRunner,
    step: &StepDefinition,
    ctx: &StepContext,
) -> Result<StepOutput, StepError> {
    let StepConfig::ForEach {
        collection,
        item_variable,
        index_variable,
        steps,
        mode,
        max_concurrency,
        on_error,
        output_variable,
    } = &step.config
    else {
        return Err(StepError::Unsupported {
            step_id: step.id.clone(),
            step_type: step.step_type().to_string(),
        });
    };

    if collection.trim().is_empty() {
        return Err(StepError::missing(step, "collection"));
    }
    if steps.is_empty() {
        return Err(StepError::missing(step, "steps"));
    }

    let items = match ctx.eval.lookup(collection) {
        Some(Value::Array(items)) => items,
        _ => {
            tracing::debug!(
                step_id = step.id.as_str(),
                collection = collection.as_str(),
                "for_each collection is not an array, nothing to iterate"
            );
            Vec::new()
        }
    };
    let total = items.len();

    let mut body: Vec<&StepDefinition> = steps.iter().collect();
    body.sort_by_key(|s| s.order);

    let vars = LoopVariables {
        item: item_variable,
        index: index_variable,
        total,
    };

    let mut results: Vec<IterationResult> = Vec::with_capacity(total);
    match mode {
        ForEachMode::Sequential => {
            for (index, item) in items.iter().enumerate() {
                let result = run_iteration(runner, &body, ctx, &vars, index, item).await;
                let stop = !result.success && *on_error == ForEachErrorPolicy::Fail;
                results.push(result);
                if stop {
                    break;
                }
            }
        }
        ForEachMode::Parallel => {
            let batch_size = max_concurrency
                .filter(|n| *n > 0)
                .unwrap_or(runner.for_each_concurrency());
            let indexed: Vec<(usize, &Value)> = items.iter().enumerate().collect();
            for batch in indexed.chunks(batch_size) {
                let batch_results = join_all(
                    batch
                        .iter()
                        .map(|(index, item)| run_iteration(runner, &body, ctx, &vars, *index, item)),
                )
                .await;
                let any_failed = batch_results.iter().any(|r| !r.success);
                results.extend(batch_results);
                if any_failed && *on_error == ForEachErrorPolicy::Fail {
                    break;
                }
            }
            results.sort_by_key(|r| r.index);
        }
    }

    let successful = results.iter().filter(|r| r.success).count();
    let failed = results.len() - successful;
    let output = json!({
        "iterations": total,
        "successful_iterations": successful,
        "failed_iterations": failed,
        "results": results.iter().map(IterationResult::to_json).collect::<Vec<_>>(),
    });

    tracing::info!(
        instance_id = %ctx.instance_id,
        step_id = step.id.as_str(),
        iterations = total,
        successful,
        failed,
        "for_each finished"
    );

    if failed > 0 && *on_error == ForEachErrorPolicy::Fail {
        let first_error = results
            .iter()
            .find(|r| !r.success)
            .and_then(|r| r.error.clone())
            .unwrap_or_default();
        return Ok(StepOutput::fail(
            format!("for_each iteration failed: {first_error}"),
            output,
        ));
    }

    let mut result = StepOutput::continue_with(output.clone());
    if let Some(name) = output_variable {
        result = result.with_variable(name, output);
    }
    Ok(result)
}

struct LoopVariables<'a> {
    item: &'a str,
    index: &'a str,
    total: usize,
}

async fn run_iteration(
    runner: &StepRunner,
    body: &[&StepDefinition],
    parent: &StepContext,
    vars: &LoopVariables<'_>,
    index: usize,
    item: &Value,
) -> IterationResult {
    let mut scope = parent.clone();
    scope.eval.set_variable(vars.item, item.clone());
    scope.eval.set_variable(vars.index, json!(index));
    scope.eval.set_variable(
        "loop",
        json!({
            "index": index,
            "total": vars.total,
            "first": index == 0,
            "last": index + 1 == vars.total,
        }),
    );

    let mut last_output = Value::Null;
    for inner in body {
        let inner_ctx = scope.for_sibling(inner);

        match runner
            .evaluator()
            .evaluate_condition_groups(&inner.conditions, &inner_ctx.eval)
        {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => return failed(index, last_output, format!("step '{}': {e}", inner.id)),
        }

        let output = match runner.run(inner, &inner_ctx).await {
            Ok(output) => output,
            Err(e) => return failed(index, last_output, format!("step '{}': {e}", inner.id)),
        };

        match output.action {
            StepAction::Continue => {
                scope.eval.merge_variables(&output.variables);
                scope.eval.result = output.output.clone();
                last_output = output.output;
            }
            StepAction::Skip => {}
            StepAction::Wait(_) => {
                return failed(
                    index,
                    output.output,
                    format!("step '{}' cannot wait inside a loop", inner.id),
                );
            }
            StepAction::Fail => {
                let error = output
                    .error
                    .unwrap_or_else(|| format!("step '{}' failed", inner.id));
                return failed(index, output.output, error);
            }
        }
    }

    IterationResult {
        index,
        success: true,
        output: last_output,
        error: None,
    }
}

fn failed(index: usize, output: Value, error: String) -> IterationResult {
    IterationResult {
        index,
        success: false,
        output,
        error: Some(error),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_support::{MockExecution, MockHttp, MockNotifier, step, step_context};
    use tenure_types::config::EngineConfig;
    use tenure_types::workflow::VariableAssignment;

    fn runner(execution: Arc<MockExecution>) -> StepRunner {
        StepRunner::new(
            execution,
            Arc::new(MockNotifier::default()),
            Arc::new(MockHttp::default()),
            &EngineConfig::default(),
        )
    }

    fn grant_loop(mode: ForEachMode, on_error: ForEachErrorPolicy) -> StepDefinition {
        step(
            "grant-each",
            4,
            StepConfig::ForEach {
                collection: "variables.systems".to_string(),
                item_variable: "system".to_string(),
                index_variable: "i".to_string(),
                steps: vec![
                    step("label", 1, StepConfig::SetVariable {
                        assignments: vec![VariableAssignment {
                            name: "label".to_string(),
                            value: json!("{{variables.i}}:{{variables.system}}"),
                        }],
                    }),
                    step("grant", 2, StepConfig::Action {
                        action: "grant_{{variables.system}}".to_string(),
                        parameters: json!({"label": "{{variables.label}}", "last": "{{variables.loop.last}}"}),
                    }),
                ],
                mode,
                max_concurrency: Some(2),
                on_error,
                output_variable: Some("grants".to_string()),
            },
        )
    }

    fn ctx_with(systems: Value) -> StepContext {
        let mut ctx = step_context(json!({}));
        ctx.eval.set_variable("systems", systems);
        ctx
    }

    #[tokio::test]
    async fn test_empty_collection_continues() {
        let execution = Arc::new(MockExecution::default());
        let runner = runner(Arc::clone(&execution));
        let out = run_for_each(
            &runner,
            &grant_loop(ForEachMode::Sequential, ForEachErrorPolicy::Fail),
            &ctx_with(json!([])),
        )
        .await
        .unwrap();
        assert_eq!(out.action, StepAction::Continue);
        assert_eq!(out.output["iterations"], 0);
        assert!(execution.actions().is_empty());
    }

    #[tokio::test]
    async fn test_non_array_collection_iterates_zero_times() {
        let runner = runner(Arc::new(MockExecution::default()));
        let out = run_for_each(
            &runner,
            &grant_loop(ForEachMode::Sequential, ForEachErrorPolicy::Fail),
            &ctx_with(json!("not-a-list")),
        )
        .await
        .unwrap();
        assert_eq!(out.action, StepAction::Continue);
        assert_eq!(out.output["iterations"], 0);
    }

    #[tokio::test]
    async fn test_sequential_runs_body_per_item_with_loop_vars() {
        let execution = Arc::new(MockExecution::default());
        let runner = runner(Arc::clone(&execution));
        let out = run_for_each(
            &runner,
            &grant_loop(ForEachMode::Sequential, ForEachErrorPolicy::Fail),
            &ctx_with(json!(["email", "vpn"])),
        )
        .await
        .unwrap();

        assert_eq!(out.action, StepAction::Continue);
        assert_eq!(out.output["successful_iterations"], 2);
        let actions = execution.actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].0, "grant_email");
        assert_eq!(actions[0].1, json!({"label": "0:email", "last": false}));
        assert_eq!(actions[1].1, json!({"label": "1:vpn", "last": true}));

        // iteration-scoped variables stay inside the loop
        assert!(!out.variables.contains_key("label"));
        assert!(out.variables.contains_key("grants"));
    }

    #[tokio::test]
    async fn test_fail_policy_stops_at_first_failure() {
        let execution = Arc::new(MockExecution::default());
        execution.fail_action("grant_email");
        let runner = runner(Arc::clone(&execution));
        let out = run_for_each(
            &runner,
            &grant_loop(ForEachMode::Sequential, ForEachErrorPolicy::Fail),
            &ctx_with(json!(["email", "vpn", "hr"])),
        )
        .await
        .unwrap();
        assert_eq!(out.action, StepAction::Fail);
        assert_eq!(out.output["failed_iterations"], 1);
        assert_eq!(out.output["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_continue_policy_records_failures() {
        let execution = Arc::new(MockExecution::default());
        execution.fail_action("grant_vpn");
        let runner = runner(Arc::clone(&execution));
        let out = run_for_each(
            &runner,
            &grant_loop(ForEachMode::Sequential, ForEachErrorPolicy::Continue),
            &ctx_with(json!(["email", "vpn", "hr"])),
        )
        .await
        .unwrap();
        assert_eq!(out.action, StepAction::Continue);
        assert_eq!(out.output["successful_iterations"], 2);
        assert_eq!(out.output["failed_iterations"], 1);
        assert_eq!(out.output["results"][1]["success"], false);
    }

    #[tokio::test]
    async fn test_parallel_mode_preserves_index_order() {
        let execution = Arc::new(MockExecution::default());
        let runner = runner(Arc::clone(&execution));
        let out = run_for_each(
            &runner,
            &grant_loop(ForEachMode::Parallel, ForEachErrorPolicy::Continue),
            &ctx_with(json!(["a", "b", "c", "d", "e"])),
        )
        .await
        .unwrap();
        assert_eq!(out.output["iterations"], 5);
        let indexes: Vec<u64> = out.output["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["index"].as_u64().unwrap())
            .collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
        assert_eq!(execution.actions().len(), 5);
    }

    #[tokio::test]
    async fn test_missing_collection_is_config_error() {
        let runner = runner(Arc::new(MockExecution::default()));
        let step = step("loop", 2, StepConfig::ForEach {
            collection: String::new(),
            item_variable: "item".to_string(),
            index_variable: "index".to_string(),
            steps: vec![],
            mode: ForEachMode::Sequential,
            max_concurrency: None,
            on_error: ForEachErrorPolicy::Fail,
            output_variable: None,
        });
        let err = run_for_each(&runner, &step, &step_context(json!({}))).await.unwrap_err();
        assert!(matches!(err, StepError::MissingConfig { .. }));
    }
}
