//! Template rendering.
//!
//! Placeholders look like `{{ inputs.name }}` or `{{ parents[0].value }}` and
//! are resolved against a JSON variable tree built by `render_context`.
//!
//! Outputs of finished runs are visible as `{{ outputs.<task_id>.<key> }}`;
//! runs under an each are keyed by value: `{{ outputs.<task_id>.<value>.<key> }}`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::domain::execution::{Execution, TaskRun};
use crate::domain::flow::Flow;
use crate::ports::renderer::{RenderError, Renderer};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("placeholder pattern is a valid regex")
});

/// Default `Renderer`: dotted paths with optional `[index]` segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl Renderer for TemplateRenderer {
    fn render(&self, template: &str, vars: &Value) -> Result<String, RenderError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&template[last..whole.start()]);
            let value = lookup(vars, path.as_str())?;
            out.push_str(&stringify(value));
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }
}

fn lookup<'v>(vars: &'v Value, path: &str) -> Result<&'v Value, RenderError> {
    if path.is_empty() {
        return Err(RenderError::InvalidExpression(path.to_string()));
    }

    let mut current = vars;
    for segment in path.split('.') {
        let (name, index) = match segment.split_once('[') {
            Some((name, rest)) => {
                let index = rest
                    .strip_suffix(']')
                    .and_then(|i| i.trim().parse::<usize>().ok())
                    .ok_or_else(|| RenderError::InvalidExpression(path.to_string()))?;
                (name.trim(), Some(index))
            }
            None => (segment.trim(), None),
        };
        if name.is_empty() {
            return Err(RenderError::InvalidExpression(path.to_string()));
        }

        current = current
            .get(name)
            .ok_or_else(|| RenderError::UnknownVariable(path.to_string()))?;
        if let Some(index) = index {
            current = current
                .get(index)
                .ok_or_else(|| RenderError::UnknownVariable(path.to_string()))?;
        }
    }
    Ok(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Variables visible to templates rendered for `run` (or at flow level).
pub fn render_context(flow: &Flow, execution: &Execution, run: Option<&TaskRun>) -> Value {
    let mut vars = json!({
        "flow": {
            "id": flow.id,
            "namespace": flow.namespace,
            "revision": flow.revision,
        },
        "execution": {
            "id": execution.id.to_string(),
        },
        "inputs": execution.inputs,
        "vars": execution.variables,
        "outputs": outputs_of(execution),
    });

    if let Some(run) = run {
        vars["taskrun"] = json!({
            "id": run.id.to_string(),
            "task_id": run.task_id,
            "value": run.value,
            "attempt": run.attempt_number(),
        });
        vars["parents"] = execution
            .parents_of(run)
            .into_iter()
            .map(|p| {
                json!({
                    "id": p.id.to_string(),
                    "task_id": p.task_id,
                    "value": p.value,
                })
            })
            .collect();
    }
    vars
}

fn outputs_of(execution: &Execution) -> Value {
    let mut outputs = Map::new();
    for run in &execution.task_run_list {
        if run.outputs.is_null() {
            continue;
        }
        match &run.value {
            None => {
                outputs.insert(run.task_id.clone(), run.outputs.clone());
            }
            Some(value) => {
                let slot = outputs
                    .entry(run.task_id.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(by_value) = slot {
                    by_value.insert(value.clone(), run.outputs.clone());
                }
            }
        }
    }
    Value::Object(outputs)
}

/// Renders every string leaf of a JSON document.
pub fn render_value(renderer: &dyn Renderer, value: &Value, vars: &Value) -> Result<Value, RenderError> {
    Ok(match value {
        Value::String(s) => Value::String(renderer.render(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(renderer, item, vars))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_value(renderer, v, vars)?)))
                .collect::<Result<_, RenderError>>()?,
        ),
        other => other.clone(),
    })
}
