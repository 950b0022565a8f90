//! Domain model (ids, state, task tree, flow, execution, messages).

pub mod errors;
pub mod execution;
pub mod flow;
pub mod ids;
pub mod messages;
pub mod resolved;
pub mod state;
pub mod task;
pub mod task_type;

pub use errors::{ErrorKind, RegistryError, ValidationError};
pub use execution::{Execution, ExecutionError, TaskFailure, TaskRun, TaskRunAttempt};
pub use flow::{Flow, FlowInput};
pub use ids::{ExecutionId, TaskRunId};
pub use messages::{
    AttemptKey, ExecutionKillRequest, Inbound, WorkerKill, WorkerMessage, WorkerTask, WorkerTaskResult,
};
pub use resolved::ResolvedTask;
pub use state::{History, State, StateError, StateType};
pub use task::{Backoff, EachValues, RetryPolicy, Task, TaskKind};
pub use task_type::{TaskTypeDescriptor, TaskTypeRegistry};
