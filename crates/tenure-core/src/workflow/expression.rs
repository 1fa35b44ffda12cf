//! Condition evaluation for entry conditions, branch rules and condition steps.
//!
//! Two condition forms are supported:
//! - structured comparisons (`{field, operator, value}`) resolved against the
//!   [`EvaluationContext`] with dot-path lookup
//! - JEXL expressions (`{expression}`) evaluated by `jexl_eval` against the
//!   context's JSON object, with a small set of string transforms registered
//!
//! **Security note:** context data is always passed as the evaluation
//! context, NEVER interpolated into expression strings.

use serde_json::{Value, json};
use tenure_types::workflow::{Condition, ConditionGroup, ConditionLogic, ConditionOperator};

use super::context::EvaluationContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during condition evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates conditions and condition groups against an evaluation context.
///
/// The JEXL evaluator is built per call since its transform table is not `Send`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// A JEXL evaluator with the standard transforms registered.
    fn jexl() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().cloned().unwrap_or(Value::Null);
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(json!(contains(&subject, &needle)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
    }

    /// Evaluate a JEXL expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_expression(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = Self::jexl()
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(is_truthy(&result))
    }

    /// Evaluate a single condition.
    pub fn evaluate_condition(
        &self,
        condition: &Condition,
        ctx: &EvaluationContext,
    ) -> Result<bool, ExpressionError> {
        match condition {
            Condition::Expression { expression } => {
                self.evaluate_expression(expression, &ctx.to_value())
            }
            Condition::Compare {
                field,
                operator,
                value,
            } => Ok(compare(ctx.lookup(field).as_ref(), *operator, value)),
        }
    }

    /// Combine conditions with `all`/`any` logic. An empty list holds.
    pub fn evaluate_conditions(
        &self,
        conditions: &[Condition],
        logic: ConditionLogic,
        ctx: &EvaluationContext,
    ) -> Result<bool, ExpressionError> {
        if conditions.is_empty() {
            return Ok(true);
        }
        match logic {
            ConditionLogic::All => {
                for condition in conditions {
                    if !self.evaluate_condition(condition, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionLogic::Any => {
                for condition in conditions {
                    if self.evaluate_condition(condition, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Every group must hold. No groups means no restriction.
    pub fn evaluate_condition_groups(
        &self,
        groups: &[ConditionGroup],
        ctx: &EvaluationContext,
    ) -> Result<bool, ExpressionError> {
        for group in groups {
            if !self.evaluate_conditions(&group.conditions, group.logic, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Structured comparison
// ---------------------------------------------------------------------------

/// Apply `operator` to the resolved field value (`None` when the path is missing).
pub fn compare(actual: Option<&Value>, operator: ConditionOperator, expected: &Value) -> bool {
    use ConditionOperator as Op;

    match operator {
        Op::Exists => actual.is_some_and(|v| !v.is_null()),
        Op::NotExists => actual.is_none_or(Value::is_null),
        Op::IsEmpty => actual.is_none_or(is_empty),
        Op::IsNotEmpty => actual.is_some_and(|v| !is_empty(v)),
        Op::Equals => actual.is_some_and(|v| loosely_equal(v, expected)),
        Op::NotEquals => !actual.is_some_and(|v| loosely_equal(v, expected)),
        Op::GreaterThan => ordering(actual, expected).is_some_and(|o| o.is_gt()),
        Op::GreaterThanOrEqual => ordering(actual, expected).is_some_and(|o| o.is_ge()),
        Op::LessThan => ordering(actual, expected).is_some_and(|o| o.is_lt()),
        Op::LessThanOrEqual => ordering(actual, expected).is_some_and(|o| o.is_le()),
        Op::Contains => actual.is_some_and(|v| contains(v, expected)),
        Op::NotContains => !actual.is_some_and(|v| contains(v, expected)),
        Op::In => actual.is_some_and(|v| contains(expected, v)),
        Op::NotIn => !actual.is_some_and(|v| contains(expected, v)),
        Op::StartsWith => match (actual.and_then(Value::as_str), expected.as_str()) {
            (Some(a), Some(e)) => a.starts_with(e),
            _ => false,
        },
        Op::EndsWith => match (actual.and_then(Value::as_str), expected.as_str()) {
            (Some(a), Some(e)) => a.ends_with(e),
            _ => false,
        },
    }
}

/// Equality that treats numbers by value and compares numeric strings to numbers.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

fn ordering(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual.as_str(), expected.as_str()) {
        (Some(a), Some(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Substring for strings, membership for arrays, key presence for objects.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvaluationContext {
        let mut ctx = EvaluationContext {
            process: json!({ "employee": { "department": "IT", "grade": "7" } }),
            result: json!({ "decision": "approved" }),
            ..Default::default()
        };
        ctx.set_variable("systems", json!(["github", "jira"]));
        ctx.set_variable("level", json!(4));
        ctx.set_variable("notes", json!(""));
        ctx
    }

    fn cmp(field: &str, op: ConditionOperator, value: Value) -> Condition {
        Condition::compare(field, op, value)
    }

    #[test]
    fn test_structured_operators() {
        let eval = ConditionEvaluator::new();
        let ctx = ctx();
        let cases = [
            (cmp("process.employee.department", ConditionOperator::Equals, json!("IT")), true),
            (cmp("process.employee.grade", ConditionOperator::Equals, json!(7)), true),
            (cmp("variables.level", ConditionOperator::GreaterThan, json!(3)), true),
            (cmp("variables.level", ConditionOperator::LessThanOrEqual, json!(3)), false),
            (cmp("variables.systems", ConditionOperator::Contains, json!("jira")), true),
            (cmp("variables.systems", ConditionOperator::NotContains, json!("slack")), true),
            (cmp("process.employee.department", ConditionOperator::In, json!(["IT", "HR"])), true),
            (cmp("process.employee.department", ConditionOperator::NotIn, json!(["HR"])), true),
            (cmp("variables.notes", ConditionOperator::IsEmpty, Value::Null), true),
            (cmp("variables.missing", ConditionOperator::IsEmpty, Value::Null), true),
            (cmp("variables.missing", ConditionOperator::NotExists, Value::Null), true),
            (cmp("variables.level", ConditionOperator::Exists, Value::Null), true),
            (cmp("decision", ConditionOperator::StartsWith, json!("app")), true),
            (cmp("decision", ConditionOperator::EndsWith, json!("ed")), true),
            (cmp("variables.missing", ConditionOperator::NotEquals, json!(1)), true),
        ];
        for (condition, expected) in cases {
            assert_eq!(
                eval.evaluate_condition(&condition, &ctx).unwrap(),
                expected,
                "{condition:?}"
            );
        }
    }

    #[test]
    fn test_expression_condition() {
        let eval = ConditionEvaluator::new();
        let ctx = ctx();
        let c = Condition::Expression {
            expression: "variables.level > 3 && process.employee.department == 'IT'".to_string(),
        };
        assert!(eval.evaluate_condition(&c, &ctx).unwrap());

        let c = Condition::Expression {
            expression: "result.decision|upper == 'REJECTED'".to_string(),
        };
        assert!(!eval.evaluate_condition(&c, &ctx).unwrap());
    }

    #[test]
    fn test_expression_syntax_error_is_reported() {
        let eval = ConditionEvaluator::new();
        let c = Condition::Expression {
            expression: "variables.level >".to_string(),
        };
        assert!(eval.evaluate_condition(&c, &ctx()).is_err());
    }

    #[test]
    fn test_logic_all_and_any() {
        let eval = ConditionEvaluator::new();
        let ctx = ctx();
        let conditions = vec![
            cmp("variables.level", ConditionOperator::Equals, json!(4)),
            cmp("variables.level", ConditionOperator::Equals, json!(5)),
        ];
        assert!(!eval.evaluate_conditions(&conditions, ConditionLogic::All, &ctx).unwrap());
        assert!(eval.evaluate_conditions(&conditions, ConditionLogic::Any, &ctx).unwrap());
        assert!(eval.evaluate_conditions(&[], ConditionLogic::Any, &ctx).unwrap());
    }

    #[test]
    fn test_groups_require_every_group() {
        let eval = ConditionEvaluator::new();
        let ctx = ctx();
        let groups = vec![
            ConditionGroup {
                logic: ConditionLogic::Any,
                conditions: vec![cmp("variables.level", ConditionOperator::Equals, json!(4))],
            },
            ConditionGroup {
                logic: ConditionLogic::All,
                conditions: vec![cmp("decision", ConditionOperator::Equals, json!("rejected"))],
            },
        ];
        assert!(!eval.evaluate_condition_groups(&groups, &ctx).unwrap());
        assert!(eval.evaluate_condition_groups(&groups[..1], &ctx).unwrap());
        assert!(eval.evaluate_condition_groups(&[], &ctx).unwrap());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!("x")));
    }
}
