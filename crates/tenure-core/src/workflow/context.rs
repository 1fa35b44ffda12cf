//! Evaluation context with dot-path lookup and `{{path}}` template resolution.
//!
//! `EvaluationContext` is the data surface conditions, templates and
//! mappings read from. It exposes five namespaces:
//!
//! - `variables` -- the instance's mutable variables
//! - `process` -- business fields of the owning process (instance context)
//! - `instance` -- identity and status of the running instance
//! - `step` -- the step being executed
//! - `result` -- output of the step that just finished (or trigger data)
//!
//! Paths without a namespace prefix resolve against `result` first and then
//! against `variables`.

use serde_json::{Map, Value, json};
use tenure_types::instance::WorkflowInstance;
use tenure_types::workflow::StepDefinition;

/// Namespaces addressable from paths and templates.
pub const NAMESPACES: [&str; 5] = ["variables", "process", "instance", "step", "result"];

// ---------------------------------------------------------------------------
// EvaluationContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    pub variables: Map<String, Value>,
    pub process: Value,
    pub instance: Value,
    pub step: Value,
    pub result: Value,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self {
            variables: Map::new(),
            process: json!({}),
            instance: json!({}),
            step: json!({}),
            result: Value::Null,
        }
    }
}

impl EvaluationContext {
    /// Build the context for an instance (no step, no result yet).
    pub fn for_instance(instance: &WorkflowInstance) -> Self {
        Self {
            variables: instance.variables.clone(),
            process: if instance.context.is_object() {
                instance.context.clone()
            } else {
                json!({})
            },
            instance: json!({
                "id": instance.id.to_string(),
                "definition_id": instance.definition_id.to_string(),
                "definition_version": instance.definition_version,
                "process_id": instance.process_id,
                "status": instance.status.as_str(),
                "started_at": instance.started_at.to_rfc3339(),
                "started_by": instance.started_by,
                "parent_instance_id": instance.parent.as_ref().map(|p| p.instance_id.to_string()),
            }),
            step: json!({}),
            result: Value::Null,
        }
    }

    pub fn with_step(mut self, step: &StepDefinition) -> Self {
        self.step = json!({
            "id": step.id,
            "name": step.name,
            "type": step.step_type().as_str(),
            "order": step.order,
        });
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// Merge a batch of variables, overwriting existing keys.
    pub fn merge_variables(&mut self, variables: &Map<String, Value>) {
        for (key, value) in variables {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    /// The JSON object handed to JEXL expressions.
    pub fn to_value(&self) -> Value {
        json!({
            "variables": self.variables,
            "process": self.process,
            "instance": self.instance,
            "step": self.step,
            "result": self.result,
        })
    }

    /// Resolve a dot-path against the namespaces.
    ///
    /// Returns `None` for missing paths. A `null` stored at the path is
    /// returned as `Some(Value::Null)`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }

        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let namespace = match head {
            "variables" => Some(self.variables_value()),
            "process" => Some(self.process.clone()),
            "instance" => Some(self.instance.clone()),
            "step" => Some(self.step.clone()),
            "result" => Some(self.result.clone()),
            _ => None,
        };

        match namespace {
            Some(root) => match rest {
                Some(rest) => get_path(&root, rest).cloned(),
                None => Some(root),
            },
            None => get_path(&self.result, path)
                .or_else(|| self.variables.get(head).and_then(|v| match rest {
                    Some(rest) => get_path(v, rest),
                    None => Some(v),
                }))
                .cloned(),
        }
    }

    /// Replace every `{{path}}` token with the value at `path`.
    ///
    /// Whitespace inside the braces is ignored. Tokens that do not resolve
    /// are left verbatim.
    pub fn resolve_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + len;
            out.push_str(&rest[..start]);

            let token = &rest[start..end + 2];
            match self.lookup(&rest[start + 2..end]) {
                Some(value) => out.push_str(&value_to_string(&value)),
                None => out.push_str(token),
            }
            rest = &rest[end + 2..];
        }

        out.push_str(rest);
        out
    }

    /// Resolve templates inside a JSON value.
    ///
    /// A string consisting of exactly one token keeps the referenced value's
    /// JSON type; other strings are rendered as text. Arrays and objects are
    /// resolved recursively.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(path) = single_token(s) {
                    if let Some(v) = self.lookup(path) {
                        return v;
                    }
                }
                Value::String(self.resolve_template(s))
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn variables_value(&self) -> Value {
        Value::Object(self.variables.clone())
    }
}

/// `"{{ a.b }}"` -> `Some("a.b")`; anything else -> `None`.
fn single_token(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Walk a dot-path (`a.b.0.c` or `a.b[0].c`) into a JSON value.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = step_into(current, key)?;
        }
        for index in indices {
            current = current.as_array()?.get(index)?;
        }
    }
    Some(current)
}

fn step_into<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// `items[0][1]` -> (`items`, [0, 1]).
fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let Some(open) = segment.find('[') else {
        return (segment, Vec::new());
    };
    let key = &segment[..open];
    let indices = segment[open..]
        .split('[')
        .filter_map(|part| part.strip_suffix(']'))
        .filter_map(|n| n.trim().parse().ok())
        .collect();
    (key, indices)
}

/// Render a JSON value for string interpolation.
///
/// Strings are inserted raw, `null` becomes empty, everything else is JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
