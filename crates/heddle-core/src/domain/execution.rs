//! Execution / TaskRun model.
//!
//! Both aggregates are copy-on-write: every `with_*` method returns a new
//! value and leaves `self` untouched, so a snapshot handed to the resolution
//! engine can never change under it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::errors::ErrorKind;
use super::flow::Flow;
use super::ids::{ExecutionId, TaskRunId};
use super::state::{State, StateError, StateType};

/// Failure reported for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }
}

/// One retry cycle of a TaskRun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("task run {0} not found")]
    TaskRunNotFound(TaskRunId),

    #[error("task run {0} has no attempt")]
    NoAttempt(TaskRunId),

    #[error("a task run for task `{task_id}` (value {value:?}) already exists under this parent")]
    DuplicatePosition {
        task_id: String,
        value: Option<String>,
    },
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub execution_id: ExecutionId,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_run_id: Option<TaskRunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub state: State,
    #[serde(default)]
    pub attempts: Vec<TaskRunAttempt>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub outputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(
        id: TaskRunId,
        execution_id: ExecutionId,
        task_id: impl Into<String>,
        parent_task_run_id: Option<TaskRunId>,
        value: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            execution_id,
            task_id: task_id.into(),
            parent_task_run_id,
            value,
            state: State::new(now),
            attempts: Vec::new(),
            outputs: serde_json::Value::Null,
            retry_at: None,
        }
    }

    /// Does this run occupy the logical position (task, parent, value)?
    pub fn is_for(&self, task_id: &str, parent: Option<TaskRunId>, value: Option<&str>) -> bool {
        self.task_id == task_id
            && self.parent_task_run_id == parent
            && self.value.as_deref() == value
    }

    pub fn current_attempt(&self) -> Option<&TaskRunAttempt> {
        self.attempts.last()
    }

    /// 1-based number of the current attempt (0 before the first dispatch).
    pub fn attempt_number(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn last_failure(&self) -> Option<&TaskFailure> {
        self.attempts.iter().rev().find_map(|a| a.failure.as_ref())
    }

    pub fn with_state(&self, next: StateType, now: DateTime<Utc>) -> Result<TaskRun, StateError> {
        let mut run = self.clone();
        run.state = self.state.with_state(next, now)?;
        Ok(run)
    }

    /// Like `with_state`, but a no-op when already in `next`.
    pub fn ensure_state(&self, next: StateType, now: DateTime<Utc>) -> Result<TaskRun, StateError> {
        if self.state.current() == next {
            return Ok(self.clone());
        }
        self.with_state(next, now)
    }

    /// Moves the current attempt to `next`; the run's own state is untouched.
    pub fn with_attempt_state(
        &self,
        next: StateType,
        failure: Option<TaskFailure>,
        now: DateTime<Utc>,
    ) -> Result<TaskRun, ExecutionError> {
        let mut run = self.clone();
        let attempt = run
            .attempts
            .last_mut()
            .ok_or(ExecutionError::NoAttempt(self.id))?;
        attempt.state = attempt.state.with_state(next, now)?;
        if failure.is_some() {
            attempt.failure = failure;
        }
        Ok(run)
    }

    /// Arms a fresh CREATED attempt and puts the run back to CREATED.
    pub fn with_new_attempt(&self, now: DateTime<Utc>) -> Result<TaskRun, StateError> {
        let mut run = self.ensure_state(StateType::Created, now)?;
        run.attempts.push(TaskRunAttempt {
            state: State::new(now),
            failure: None,
        });
        run.retry_at = None;
        Ok(run)
    }

    /// Parks the run in RETRYING until `retry_at`.
    pub fn with_retry_at(
        &self,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TaskRun, StateError> {
        let mut run = self.with_state(StateType::Retrying, now)?;
        run.retry_at = Some(retry_at);
        Ok(run)
    }

    pub fn with_outputs(&self, outputs: serde_json::Value) -> TaskRun {
        let mut run = self.clone();
        run.outputs = outputs;
        run
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    pub state: State,
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Set when the execution was failed for a configuration problem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        flow: &Flow,
        inputs: BTreeMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision,
            state: State::new(now),
            task_run_list: Vec::new(),
            inputs,
            variables: flow.variables.clone(),
            diagnostic: None,
        }
    }

    pub fn with_state(&self, next: StateType, now: DateTime<Utc>) -> Result<Execution, StateError> {
        let mut execution = self.clone();
        execution.state = self.state.with_state(next, now)?;
        Ok(execution)
    }

    /// Replaces the TaskRun carrying the same id.
    pub fn with_task_run(&self, task_run: TaskRun) -> Result<Execution, ExecutionError> {
        let index = self
            .task_run_list
            .iter()
            .position(|r| r.id == task_run.id)
            .ok_or(ExecutionError::TaskRunNotFound(task_run.id))?;
        let mut execution = self.clone();
        execution.task_run_list[index] = task_run;
        Ok(execution)
    }

    /// Appends a new TaskRun, refusing a second run for the same position.
    pub fn with_appended(&self, task_run: TaskRun) -> Result<Execution, ExecutionError> {
        let exists = self
            .find_position(
                &task_run.task_id,
                task_run.parent_task_run_id,
                task_run.value.as_deref(),
            )
            .is_some();
        if exists {
            return Err(ExecutionError::DuplicatePosition {
                task_id: task_run.task_id,
                value: task_run.value,
            });
        }
        let mut execution = self.clone();
        execution.task_run_list.push(task_run);
        Ok(execution)
    }

    pub fn with_diagnostic(&self, diagnostic: impl Into<String>) -> Execution {
        let mut execution = self.clone();
        execution.diagnostic = Some(diagnostic.into());
        execution
    }

    pub fn find_task_run(&self, id: TaskRunId) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|r| r.id == id)
    }

    pub fn find_position(
        &self,
        task_id: &str,
        parent: Option<TaskRunId>,
        value: Option<&str>,
    ) -> Option<&TaskRun> {
        self.task_run_list
            .iter()
            .find(|r| r.is_for(task_id, parent, value))
    }

    pub fn children_of(&self, parent: TaskRunId) -> impl Iterator<Item = &TaskRun> {
        self.task_run_list
            .iter()
            .filter(move |r| r.parent_task_run_id == Some(parent))
    }

    /// Ancestors of `run`, nearest first.
    pub fn parents_of(&self, run: &TaskRun) -> Vec<&TaskRun> {
        let mut parents = Vec::new();
        let mut current = run.parent_task_run_id;
        while let Some(id) = current {
            let Some(parent) = self.find_task_run(id) else {
                break;
            };
            parents.push(parent);
            current = parent.parent_task_run_id;
        }
        parents
    }

    pub fn all_task_runs_terminated(&self) -> bool {
        self.task_run_list.iter().all(|r| r.state.is_terminated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::Task;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn execution() -> Execution {
        let flow = Flow::new("ns", "f", vec![Task::runnable("a", "noop")]);
        Execution::new(ExecutionId::from_ulid(Ulid::new()), &flow, BTreeMap::new(), t(0))
    }

    fn run(execution: &Execution, task_id: &str, value: Option<&str>) -> TaskRun {
        TaskRun::new(
            TaskRunId::from_ulid(Ulid::new()),
            execution.id,
            task_id,
            None,
            value.map(str::to_string),
            t(0),
        )
    }

    #[test]
    fn append_rejects_second_run_for_same_position() {
        let execution = execution();
        let first = run(&execution, "t", Some("x"));
        let execution = execution.with_appended(first).unwrap();

        let other_value = run(&execution, "t", Some("y"));
        let execution = execution.with_appended(other_value).unwrap();
        assert_eq!(execution.task_run_list.len(), 2);

        let duplicate = run(&execution, "t", Some("x"));
        assert!(matches!(
            execution.with_appended(duplicate),
            Err(ExecutionError::DuplicatePosition { .. })
        ));
    }

    #[test]
    fn with_task_run_replaces_by_id_and_keeps_original() {
        let execution = execution();
        let original = run(&execution, "a", None);
        let execution = execution.with_appended(original.clone()).unwrap();

        let running = original.with_state(StateType::Running, t(1)).unwrap();
        let updated = execution.with_task_run(running).unwrap();

        assert_eq!(
            execution.task_run_list[0].state.current(),
            StateType::Created
        );
        assert_eq!(updated.task_run_list[0].state.current(), StateType::Running);
    }

    #[test]
    fn with_task_run_fails_for_unknown_id() {
        let execution = execution();
        let stranger = run(&execution, "a", None);
        assert_eq!(
            execution.with_task_run(stranger.clone()),
            Err(ExecutionError::TaskRunNotFound(stranger.id))
        );
    }

    #[test]
    fn retry_cycle_appends_attempts() {
        let execution = execution();
        let run = run(&execution, "a", None).with_new_attempt(t(0)).unwrap();
        assert_eq!(run.attempt_number(), 1);

        let failed = run
            .with_attempt_state(
                StateType::Failed,
                Some(TaskFailure::transient("boom")),
                t(1),
            )
            .unwrap()
            .with_retry_at(t(5), t(1))
            .unwrap();
        assert_eq!(failed.state.current(), StateType::Retrying);
        assert_eq!(failed.retry_at, Some(t(5)));

        let retried = failed.with_new_attempt(t(5)).unwrap();
        assert_eq!(retried.state.current(), StateType::Created);
        assert_eq!(retried.attempt_number(), 2);
        assert_eq!(retried.retry_at, None);
        assert_eq!(retried.last_failure().map(|f| f.message.as_str()), Some("boom"));
    }

    #[test]
    fn attempt_state_requires_an_attempt() {
        let execution = execution();
        let run = run(&execution, "a", None);
        assert_eq!(
            run.with_attempt_state(StateType::Running, None, t(1)),
            Err(ExecutionError::NoAttempt(run.id))
        );
    }

    #[test]
    fn parents_are_listed_nearest_first() {
        let execution = execution();
        let outer = run(&execution, "outer", None);
        let mut inner = run(&execution, "inner", None);
        inner.parent_task_run_id = Some(outer.id);
        let mut leaf = run(&execution, "leaf", None);
        leaf.parent_task_run_id = Some(inner.id);

        let execution = execution
            .with_appended(outer.clone())
            .and_then(|e| e.with_appended(inner.clone()))
            .and_then(|e| e.with_appended(leaf.clone()))
            .unwrap();

        let parents: Vec<_> = execution
            .parents_of(&leaf)
            .into_iter()
            .map(|r| r.task_id.as_str())
            .collect();
        assert_eq!(parents, vec!["inner", "outer"]);
        assert_eq!(execution.children_of(outer.id).count(), 1);
    }
}
