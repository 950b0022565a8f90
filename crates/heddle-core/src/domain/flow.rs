//! Flow definition: a versioned, validated task tree.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::task::{EachValues, Task, TaskKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub namespace: String,
    pub id: String,
    #[serde(default = "default_revision")]
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<FlowInput>,
    /// Static variables, exposed to templates as `vars.*`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub tasks: Vec<Task>,
    /// Flow-level error sub-tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Task>,
}

fn default_revision() -> u32 {
    1
}

/// Declared execution input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInput {
    pub id: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl Flow {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            revision: default_revision(),
            inputs: Vec::new(),
            variables: BTreeMap::new(),
            tasks,
            errors: Vec::new(),
        }
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_errors(mut self, errors: Vec<Task>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_input(mut self, input: FlowInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Finds a task anywhere in the tree, error sub-trees included.
    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks
            .iter()
            .chain(self.errors.iter())
            .find_map(|t| t.find(task_id))
    }

    /// Ids of every task living in an error sub-tree (flow-level or nested).
    pub fn error_task_ids(&self) -> HashSet<&str> {
        fn collect<'a>(task: &'a Task, in_errors: bool, out: &mut HashSet<&'a str>) {
            if in_errors {
                out.insert(task.id.as_str());
            }
            for list in task.child_lists() {
                for child in list {
                    collect(child, in_errors, out);
                }
            }
            for error in &task.errors {
                collect(error, true, out);
            }
        }

        let mut out = HashSet::new();
        for task in &self.tasks {
            collect(task, false, &mut out);
        }
        for task in &self.errors {
            collect(task, true, &mut out);
        }
        out
    }

    /// Every runnable task type used by the flow, error sub-trees included.
    pub fn task_types(&self) -> BTreeSet<&str> {
        fn collect<'a>(task: &'a Task, out: &mut BTreeSet<&'a str>) {
            if let Some(task_type) = task.task_type() {
                out.insert(task_type);
            }
            for child in task.child_lists().into_iter().flatten() {
                collect(child, out);
            }
            for error in &task.errors {
                collect(error, out);
            }
        }

        let mut out = BTreeSet::new();
        for task in self.tasks.iter().chain(self.errors.iter()) {
            collect(task, &mut out);
        }
        out
    }

    /// Merges `provided` with declared defaults.
    ///
    /// Undeclared inputs are passed through untouched.
    pub fn resolve_inputs(
        &self,
        mut provided: BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, ValidationError> {
        for input in &self.inputs {
            if provided.contains_key(&input.id) {
                continue;
            }
            match &input.default {
                Some(default) => {
                    provided.insert(input.id.clone(), default.clone());
                }
                None if input.required => {
                    return Err(ValidationError::MissingInput(input.id.clone()));
                }
                None => {}
            }
        }
        Ok(provided)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tasks.is_empty() {
            return Err(ValidationError::EmptyFlow {
                namespace: self.namespace.clone(),
                flow_id: self.id.clone(),
            });
        }

        let mut inputs = HashSet::new();
        for input in &self.inputs {
            if !inputs.insert(input.id.as_str()) {
                return Err(ValidationError::DuplicateInput(input.id.clone()));
            }
        }

        let mut seen = HashSet::new();
        for task in self.tasks.iter().chain(self.errors.iter()) {
            validate_task(task, &mut seen)?;
        }
        Ok(())
    }
}

fn validate_task<'a>(task: &'a Task, seen: &mut HashSet<&'a str>) -> Result<(), ValidationError> {
    if !seen.insert(task.id.as_str()) {
        return Err(ValidationError::DuplicateTaskId(task.id.clone()));
    }
    if task.retry.as_ref().is_some_and(|r| r.max_attempt == 0) {
        return Err(ValidationError::ZeroMaxAttempt(task.id.clone()));
    }

    match &task.kind {
        TaskKind::Runnable { .. } => {}
        TaskKind::Sequential { tasks } => {
            ensure_not_empty(task, tasks)?;
        }
        TaskKind::Parallel { tasks, concurrent } => {
            ensure_not_empty(task, tasks)?;
            ensure_concurrency(task, *concurrent)?;
        }
        TaskKind::Each {
            tasks,
            values,
            concurrent,
            ..
        } => {
            ensure_not_empty(task, tasks)?;
            ensure_concurrency(task, *concurrent)?;
            if matches!(values, EachValues::List(v) if v.is_empty()) {
                return Err(ValidationError::EmptyEachValues(task.id.clone()));
            }
        }
        TaskKind::Switch {
            cases, defaults, ..
        } => {
            if cases.is_empty() && defaults.is_empty() {
                return Err(ValidationError::EmptySwitch(task.id.clone()));
            }
            if cases.values().any(Vec::is_empty) {
                return Err(ValidationError::EmptyContainer(task.id.clone()));
            }
        }
    }

    for list in task.child_lists() {
        for child in list {
            validate_task(child, seen)?;
        }
    }
    for error in &task.errors {
        validate_task(error, seen)?;
    }
    Ok(())
}

fn ensure_not_empty(task: &Task, children: &[Task]) -> Result<(), ValidationError> {
    if children.is_empty() {
        return Err(ValidationError::EmptyContainer(task.id.clone()));
    }
    Ok(())
}

fn ensure_concurrency(task: &Task, concurrent: Option<usize>) -> Result<(), ValidationError> {
    if concurrent == Some(0) {
        return Err(ValidationError::ZeroConcurrency(task.id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::RetryPolicy;
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    fn leaf(id: &str) -> Task {
        Task::runnable(id, "noop")
    }

    #[test]
    fn valid_flow_passes() {
        let flow = Flow::new(
            "io.heddle",
            "hello",
            vec![
                leaf("a"),
                Task::parallel("p", vec![leaf("b"), leaf("c")], Some(2)),
            ],
        )
        .with_errors(vec![leaf("alert")]);

        assert_eq!(flow.validate(), Ok(()));
        assert!(flow.find_task("c").is_some());
        assert!(flow.find_task("alert").is_some());
    }

    #[test]
    fn task_types_cover_nested_and_error_tasks() {
        let flow = Flow::new(
            "ns",
            "f",
            vec![
                Task::runnable("a", "shell"),
                Task::sequential("s", vec![Task::runnable("b", "http")])
                    .with_errors(vec![Task::runnable("cleanup", "shell")]),
            ],
        )
        .with_errors(vec![Task::runnable("alert", "slack")]);

        let types: Vec<_> = flow.task_types().into_iter().collect();
        assert_eq!(types, vec!["http", "shell", "slack"]);
    }

    #[rstest]
    #[case::empty_flow(
        Flow::new("ns", "f", vec![]),
        ValidationError::EmptyFlow { namespace: "ns".into(), flow_id: "f".into() }
    )]
    #[case::empty_sequential(
        Flow::new("ns", "f", vec![Task::sequential("s", vec![])]),
        ValidationError::EmptyContainer("s".into())
    )]
    #[case::duplicate_in_error_branch(
        Flow::new("ns", "f", vec![leaf("a")]).with_errors(vec![leaf("a")]),
        ValidationError::DuplicateTaskId("a".into())
    )]
    #[case::empty_switch(
        Flow::new("ns", "f", vec![Task::switch("s", "x", BTreeMap::new(), vec![])]),
        ValidationError::EmptySwitch("s".into())
    )]
    #[case::empty_each_values(
        Flow::new("ns", "f", vec![Task::each("e", vec![leaf("t")], EachValues::List(vec![]))]),
        ValidationError::EmptyEachValues("e".into())
    )]
    #[case::zero_concurrency(
        Flow::new("ns", "f", vec![Task::parallel("p", vec![leaf("a")], Some(0))]),
        ValidationError::ZeroConcurrency("p".into())
    )]
    #[case::zero_max_attempt(
        Flow::new("ns", "f", vec![leaf("a").with_retry(RetryPolicy::constant(0, Duration::ZERO))]),
        ValidationError::ZeroMaxAttempt("a".into())
    )]
    fn invalid_flows_are_rejected(#[case] flow: Flow, #[case] expected: ValidationError) {
        assert_eq!(flow.validate(), Err(expected));
    }

    #[test]
    fn error_task_ids_cover_nested_error_branches() {
        let flow = Flow::new(
            "ns",
            "f",
            vec![Task::sequential("s", vec![leaf("a")]).with_errors(vec![leaf("cleanup")])],
        )
        .with_errors(vec![Task::sequential("notify", vec![leaf("mail")])]);

        let ids = flow.error_task_ids();
        assert!(ids.contains("cleanup"));
        assert!(ids.contains("notify"));
        assert!(ids.contains("mail"));
        assert!(!ids.contains("a"));
        assert!(!ids.contains("s"));
    }

    #[test]
    fn inputs_fall_back_to_defaults() {
        let flow = Flow::new("ns", "f", vec![leaf("a")])
            .with_input(FlowInput {
                id: "env".into(),
                required: true,
                default: Some(json!("dev")),
            })
            .with_input(FlowInput {
                id: "user".into(),
                required: true,
                default: None,
            });

        assert_eq!(
            flow.resolve_inputs(BTreeMap::new()),
            Err(ValidationError::MissingInput("user".into()))
        );

        let provided = BTreeMap::from([("user".to_string(), json!("kim"))]);
        let inputs = flow.resolve_inputs(provided).unwrap();
        assert_eq!(inputs["env"], json!("dev"));
        assert_eq!(inputs["user"], json!("kim"));
    }

    #[test]
    fn flow_deserializes_with_default_revision() {
        let flow: Flow = serde_json::from_value(json!({
            "namespace": "ns",
            "id": "f",
            "tasks": [{ "id": "a", "type": "runnable", "task_type": "noop" }]
        }))
        .unwrap();

        assert_eq!(flow.revision, 1);
        assert_eq!(flow.validate(), Ok(()));
    }
}
