//! Restart of a FAILED or KILLED execution.
//!
//! The successful prefix is kept; failed leaves, error-branch runs and
//! everything below them are dropped, failed containers are re-opened as
//! RESTARTED. The next activation moves RESTARTED to RUNNING and resolution
//! picks up where the prefix ends.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::errors::ErrorKind;
use crate::domain::execution::{Execution, ExecutionError};
use crate::domain::flow::Flow;
use crate::domain::ids::TaskRunId;
use crate::domain::state::{StateError, StateType};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RestartError {
    #[error("execution in state {0} cannot be restarted")]
    NotRestartable(StateType),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl RestartError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

pub fn restart(
    flow: &Flow,
    execution: &Execution,
    now: DateTime<Utc>,
) -> Result<Execution, RestartError> {
    let current = execution.state.current();
    if !matches!(current, StateType::Failed | StateType::Killed) {
        return Err(RestartError::NotRestartable(current));
    }

    let error_tasks = flow.error_task_ids();
    let is_failure = |state: StateType| {
        matches!(
            state,
            StateType::Failed | StateType::Killed | StateType::Cancelled
        )
    };

    // task_run_list は作成順なので、親は必ず子より先に現れる
    let mut reopened: HashSet<TaskRunId> = HashSet::new();
    let mut removed: HashSet<TaskRunId> = HashSet::new();
    let mut kept = Vec::with_capacity(execution.task_run_list.len());

    for run in &execution.task_run_list {
        let parent_removed = run.parent_task_run_id.is_some_and(|p| removed.contains(&p));
        let parent_reopened = run.parent_task_run_id.is_none_or(|p| reopened.contains(&p));
        let is_container = flow.find_task(&run.task_id).is_some_and(|t| t.is_flowable());

        if parent_removed || error_tasks.contains(run.task_id.as_str()) {
            removed.insert(run.id);
            continue;
        }
        if parent_reopened && is_failure(run.state.current()) {
            if is_container {
                reopened.insert(run.id);
                kept.push(run.with_state(StateType::Restarted, now)?);
            } else {
                removed.insert(run.id);
            }
            continue;
        }
        kept.push(run.clone());
    }

    let mut restarted = execution.with_state(StateType::Restarted, now)?;
    restarted.task_run_list = kept;
    restarted.diagnostic = None;
    Ok(restarted)
}
