//! Status - execution の読み取り専用ビュー
//!
//! 「いま何が起きているか / なぜ止まったか」を 1 つの JSON で返す。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ErrorKind;
use crate::domain::execution::{Execution, TaskRun};
use crate::domain::ids::{ExecutionId, TaskRunId};
use crate::domain::state::StateType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: ExecutionId,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    pub state: StateType,
    pub duration_ms: u64,
    /// TaskRun 数（状態別）
    pub counts: BTreeMap<StateType, usize>,
    pub task_runs: Vec<TaskRunStatus>,
    pub failures: Vec<FailureView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunStatus {
    pub id: TaskRunId,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_run_id: Option<TaskRunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub state: StateType,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// FAILED な TaskRun と、その最後の失敗理由
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureView {
    pub task_run_id: TaskRunId,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TaskRunStatus {
    fn of(run: &TaskRun, now: DateTime<Utc>) -> Self {
        Self {
            id: run.id,
            task_id: run.task_id.clone(),
            parent_task_run_id: run.parent_task_run_id,
            value: run.value.clone(),
            state: run.state.current(),
            attempts: run.attempt_number(),
            started_at: run.state.start_date(),
            duration_ms: millis(run.state.duration(now)),
        }
    }
}

impl ExecutionStatus {
    pub fn of(execution: &Execution, now: DateTime<Utc>) -> Self {
        let mut counts = BTreeMap::new();
        for run in &execution.task_run_list {
            *counts.entry(run.state.current()).or_insert(0) += 1;
        }

        let failures = execution
            .task_run_list
            .iter()
            .filter(|r| r.state.is_failed())
            .map(|r| {
                let failure = r.last_failure();
                FailureView {
                    task_run_id: r.id,
                    task_id: r.task_id.clone(),
                    value: r.value.clone(),
                    attempts: r.attempt_number(),
                    kind: failure.map(|f| f.kind),
                    message: failure
                        .map(|f| f.message.clone())
                        .unwrap_or_else(|| "failed without an error message".to_string()),
                }
            })
            .collect();

        Self {
            execution_id: execution.id,
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            flow_revision: execution.flow_revision,
            state: execution.state.current(),
            duration_ms: millis(execution.state.duration(now)),
            counts,
            task_runs: execution
                .task_run_list
                .iter()
                .map(|r| TaskRunStatus::of(r, now))
                .collect(),
            failures,
            diagnostic: execution.diagnostic.clone(),
        }
    }

    pub fn count(&self, state: StateType) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}
