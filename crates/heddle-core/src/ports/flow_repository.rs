//! FlowRepository port - flow 定義の読み出し（executor からは read-only）

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::errors::{ErrorKind, ValidationError};
use crate::domain::flow::Flow;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepositoryError {
    /// Storage backend not reachable.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("invalid flow: {0}")]
    Invalid(#[from] ValidationError),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::Unavailable(_) => ErrorKind::Infrastructure,
            RepositoryError::Conflict(_) => ErrorKind::Transient,
            RepositoryError::Invalid(_) => ErrorKind::Permanent,
        }
    }
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// `revision = None` means the latest revision.
    async fn find_by_id(
        &self,
        namespace: &str,
        id: &str,
        revision: Option<u32>,
    ) -> Result<Option<Arc<Flow>>, RepositoryError>;
}
