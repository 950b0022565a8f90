//! Message payloads exchanged with the executor loop and the workers.
//!
//! Shapes only; the wire format belongs to whatever transport carries them.

use serde::{Deserialize, Serialize};

use super::execution::{Execution, TaskFailure};
use super::ids::{ExecutionId, TaskRunId};
use super::state::StateType;

/// One dispatched attempt of a runnable leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub execution_id: ExecutionId,
    pub task_run_id: TaskRunId,
    pub task_id: String,
    pub task_type: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Rendered task properties.
    pub definition: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTaskResult {
    pub execution_id: ExecutionId,
    pub task_run_id: TaskRunId,
    pub attempt: u32,
    pub state: StateType,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub outputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}

impl WorkerTaskResult {
    pub fn for_task(task: &WorkerTask, state: StateType) -> Self {
        Self {
            execution_id: task.execution_id,
            task_run_id: task.task_run_id,
            attempt: task.attempt,
            state,
            outputs: serde_json::Value::Null,
            failure: None,
        }
    }

    pub fn with_outputs(mut self, outputs: serde_json::Value) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_failure(mut self, failure: TaskFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// One attempt of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptKey {
    pub task_run_id: TaskRunId,
    pub attempt: u32,
}

impl WorkerTask {
    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            task_run_id: self.task_run_id,
            attempt: self.attempt,
        }
    }
}

/// Asks the workers to stop one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerKill {
    pub execution_id: ExecutionId,
    pub task_run_id: TaskRunId,
    pub attempt: u32,
}

impl WorkerKill {
    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            task_run_id: self.task_run_id,
            attempt: self.attempt,
        }
    }
}

/// What travels on the worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Task(WorkerTask),
    Kill(WorkerKill),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionKillRequest {
    pub execution_id: ExecutionId,
}

/// Everything that can wake the executor up for one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// New or externally updated execution.
    ExecutionChanged { execution: Execution },
    WorkerTaskResult(WorkerTaskResult),
    Kill(ExecutionKillRequest),
    Restart { execution_id: ExecutionId },
    /// RUNNING -> PAUSED. 実行中の attempt はそのまま、新しい dispatch を止める
    Pause { execution_id: ExecutionId },
    /// PAUSED -> RUNNING
    Resume { execution_id: ExecutionId },
    /// Retry backoff elapsed.
    RetryDue {
        execution_id: ExecutionId,
        task_run_id: TaskRunId,
    },
    /// Task timeout watchdog.
    TimeoutCheck {
        execution_id: ExecutionId,
        task_run_id: TaskRunId,
        attempt: u32,
    },
    /// Kill grace period elapsed.
    KillTimeout { execution_id: ExecutionId },
    /// Re-emit the WorkerTasks that could not be handed to a worker.
    Resend {
        execution_id: ExecutionId,
        attempts: Vec<AttemptKey>,
    },
}

impl Inbound {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Inbound::ExecutionChanged { execution } => execution.id,
            Inbound::WorkerTaskResult(result) => result.execution_id,
            Inbound::Kill(request) => request.execution_id,
            Inbound::Restart { execution_id }
            | Inbound::Pause { execution_id }
            | Inbound::Resume { execution_id }
            | Inbound::RetryDue { execution_id, .. }
            | Inbound::TimeoutCheck { execution_id, .. }
            | Inbound::KillTimeout { execution_id }
            | Inbound::Resend { execution_id, .. } => *execution_id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::ExecutionChanged { .. } => "execution_changed",
            Inbound::WorkerTaskResult(_) => "worker_task_result",
            Inbound::Kill(_) => "kill",
            Inbound::Restart { .. } => "restart",
            Inbound::Pause { .. } => "pause",
            Inbound::Resume { .. } => "resume",
            Inbound::RetryDue { .. } => "retry_due",
            Inbound::TimeoutCheck { .. } => "timeout_check",
            Inbound::KillTimeout { .. } => "kill_timeout",
            Inbound::Resend { .. } => "resend",
        }
    }
}
