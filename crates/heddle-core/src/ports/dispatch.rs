//! WorkerDispatcher port - runnable leaf を worker に渡す
//!
//! executor は dispatch の完了を待たない。送れなかった attempt だけを
//! `Resend` で後から再送する（worker 側で実行中の (task_run_id, attempt) は重複排除される）。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::errors::ErrorKind;
use crate::domain::messages::{WorkerKill, WorkerTask};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Worker channel is at capacity.
    #[error("worker channel is full")]
    Full,

    #[error("worker channel is closed")]
    Closed,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Full => ErrorKind::Transient,
            DispatchError::Closed => ErrorKind::Infrastructure,
        }
    }
}

#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    /// Must not block on a saturated channel.
    async fn dispatch(&self, task: WorkerTask) -> Result<(), DispatchError>;

    async fn kill(&self, kill: WorkerKill) -> Result<(), DispatchError>;
}
