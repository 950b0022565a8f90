//! ExecutionEventSink port - 更新後の execution を下流（indexer / UI / log）へ流す

use async_trait::async_trait;

use crate::domain::execution::Execution;

use super::dispatch::DispatchError;

#[async_trait]
pub trait ExecutionEventSink: Send + Sync {
    /// Called after every persisted state change.
    async fn publish(&self, execution: &Execution) -> Result<(), DispatchError>;
}
