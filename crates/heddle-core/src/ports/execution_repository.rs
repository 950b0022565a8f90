//! ExecutionRepository port - execution 集約の永続化
//!
//! `save` は execution 単位で atomic であること（部分書き込みを見せない）。

use async_trait::async_trait;

use crate::domain::execution::Execution;
use crate::domain::ids::ExecutionId;

use super::flow_repository::RepositoryError;

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<Execution>, RepositoryError>;

    async fn save(&self, execution: &Execution) -> Result<(), RepositoryError>;
}
