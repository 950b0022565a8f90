//! Static task tree of a flow.
//!
//! A `Task` is immutable once the flow is loaded. Leaves (`Runnable`) are
//! executed by workers; containers (`Sequential`, `Parallel`, `Each`,
//! `Switch`) are resolved by the engine and never leave the executor.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within the flow.
    pub id: String,

    #[serde(flatten)]
    pub kind: TaskKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Error sub-tree, run when this container ends FAILED.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Task>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,

    /// A FAILED run of this task is aggregated as WARNING by its parent.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Runnable {
        /// Worker-side task type (looked up in the `TaskTypeRegistry`).
        task_type: String,
        #[serde(default)]
        properties: serde_json::Value,
    },
    Sequential {
        tasks: Vec<Task>,
    },
    Parallel {
        tasks: Vec<Task>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrent: Option<usize>,
    },
    Each {
        tasks: Vec<Task>,
        values: EachValues,
        /// EachParallel when true.
        #[serde(default)]
        parallel: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrent: Option<usize>,
    },
    Switch {
        /// Template rendered into the case key.
        value: String,
        #[serde(default)]
        cases: BTreeMap<String, Vec<Task>>,
        #[serde(default)]
        defaults: Vec<Task>,
    },
}

/// Iteration domain of an `Each` container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EachValues {
    /// Literal list; every item is rendered on its own.
    List(Vec<String>),
    /// One template rendered into a JSON array.
    Expression(String),
}

impl Task {
    pub fn runnable(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            TaskKind::Runnable {
                task_type: task_type.into(),
                properties: serde_json::Value::Null,
            },
        )
    }

    pub fn sequential(id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self::with_kind(id, TaskKind::Sequential { tasks })
    }

    pub fn parallel(id: impl Into<String>, tasks: Vec<Task>, concurrent: Option<usize>) -> Self {
        Self::with_kind(id, TaskKind::Parallel { tasks, concurrent })
    }

    pub fn each(id: impl Into<String>, tasks: Vec<Task>, values: EachValues) -> Self {
        Self::with_kind(
            id,
            TaskKind::Each {
                tasks,
                values,
                parallel: false,
                concurrent: None,
            },
        )
    }

    pub fn each_parallel(
        id: impl Into<String>,
        tasks: Vec<Task>,
        values: EachValues,
        concurrent: Option<usize>,
    ) -> Self {
        Self::with_kind(
            id,
            TaskKind::Each {
                tasks,
                values,
                parallel: true,
                concurrent,
            },
        )
    }

    pub fn switch(
        id: impl Into<String>,
        value: impl Into<String>,
        cases: BTreeMap<String, Vec<Task>>,
        defaults: Vec<Task>,
    ) -> Self {
        Self::with_kind(
            id,
            TaskKind::Switch {
                value: value.into(),
                cases,
                defaults,
            },
        )
    }

    fn with_kind(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            retry: None,
            timeout_ms: None,
            errors: Vec::new(),
            disabled: false,
            allow_failure: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_errors(mut self, errors: Vec<Task>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_properties(mut self, value: serde_json::Value) -> Self {
        if let TaskKind::Runnable { properties, .. } = &mut self.kind {
            *properties = value;
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn allowing_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn is_flowable(&self) -> bool {
        !matches!(self.kind, TaskKind::Runnable { .. })
    }

    pub fn task_type(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Runnable { task_type, .. } => Some(task_type),
            _ => None,
        }
    }

    /// Every direct child list, in declaration order (cases before defaults).
    /// Error sub-trees are not included.
    pub fn child_lists(&self) -> Vec<&[Task]> {
        match &self.kind {
            TaskKind::Runnable { .. } => Vec::new(),
            TaskKind::Sequential { tasks }
            | TaskKind::Parallel { tasks, .. }
            | TaskKind::Each { tasks, .. } => vec![tasks.as_slice()],
            TaskKind::Switch {
                cases, defaults, ..
            } => cases
                .values()
                .map(Vec::as_slice)
                .chain(std::iter::once(defaults.as_slice()))
                .collect(),
        }
    }

    /// Depth-first search over children and error sub-trees.
    pub fn find(&self, id: &str) -> Option<&Task> {
        if self.id == id {
            return Some(self);
        }
        self.child_lists()
            .into_iter()
            .chain(std::iter::once(self.errors.as_slice()))
            .flat_map(|list| list.iter())
            .find_map(|child| child.find(id))
    }
}

/// Per-task retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_attempt: u32,

    pub backoff: Backoff,

    /// Failure kinds that may be retried.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorKind>,
}

fn default_retry_on() -> Vec<ErrorKind> {
    vec![ErrorKind::Transient, ErrorKind::Infrastructure]
}

impl RetryPolicy {
    pub fn constant(max_attempt: u32, interval: Duration) -> Self {
        Self {
            max_attempt,
            backoff: Backoff::Constant {
                interval_ms: interval.as_millis() as u64,
            },
            retry_on: default_retry_on(),
        }
    }

    pub fn exponential(
        max_attempt: u32,
        interval: Duration,
        multiplier: f64,
        max_interval: Option<Duration>,
    ) -> Self {
        Self {
            max_attempt,
            backoff: Backoff::Exponential {
                interval_ms: interval.as_millis() as u64,
                multiplier,
                max_interval_ms: max_interval.map(|d| d.as_millis() as u64),
            },
            retry_on: default_retry_on(),
        }
    }

    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }
}

/// Declarative backoff; turned into a `BackoffStrategy` by the retry module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Constant {
        interval_ms: u64,
    },
    Exponential {
        interval_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_interval_ms: Option<u64>,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_tree_deserializes_from_tagged_json() {
        let json = r#"
        {
          "id": "root",
          "type": "parallel",
          "concurrent": 2,
          "tasks": [
            { "id": "a", "type": "runnable", "task_type": "shell", "properties": { "cmd": "echo a" } },
            {
              "id": "loop",
              "type": "each",
              "values": ["x", "y"],
              "tasks": [ { "id": "t", "type": "runnable", "task_type": "shell" } ]
            }
          ],
          "errors": [ { "id": "alert", "type": "runnable", "task_type": "notify" } ]
        }"#;

        let task: Task = serde_json::from_str(json).unwrap();
        assert!(matches!(task.kind, TaskKind::Parallel { concurrent: Some(2), .. }));
        assert_eq!(task.errors.len(), 1);
        assert_eq!(task.find("t").map(|t| t.id.as_str()), Some("t"));
        assert_eq!(task.find("alert").and_then(Task::task_type), Some("notify"));
        assert!(task.find("missing").is_none());
    }

    #[test]
    fn each_values_accept_list_or_expression() {
        let list: EachValues = serde_json::from_str(r#"["a","b"]"#).unwrap();
        let expr: EachValues = serde_json::from_str(r#""{{ inputs.items }}""#).unwrap();
        assert_eq!(list, EachValues::List(vec!["a".into(), "b".into()]));
        assert_eq!(expr, EachValues::Expression("{{ inputs.items }}".into()));
    }

    #[test]
    fn retry_policy_defaults_retry_on() {
        let json = r#"{ "max_attempt": 3, "backoff": { "type": "exponential", "interval_ms": 100 } }"#;
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();

        assert!(policy.retries(ErrorKind::Transient));
        assert!(!policy.retries(ErrorKind::Permanent));
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                interval_ms: 100,
                multiplier: 2.0,
                max_interval_ms: None
            }
        );
    }

    #[test]
    fn switch_child_lists_include_defaults() {
        let mut cases = BTreeMap::new();
        cases.insert("a".to_string(), vec![Task::runnable("a1", "noop")]);
        let task = Task::switch("s", "{{ inputs.k }}", cases, vec![Task::runnable("d1", "noop")]);

        assert_eq!(task.child_lists().len(), 2);
        assert!(task.is_flowable());
        assert!(task.find("d1").is_some());
    }
}
