//! In-memory リポジトリ（開発用・テスト用）
//!
//! # 学習ポイント
//! - tokio::sync::RwLock による async な排他制御
//! - 保存時に clone してスナップショットを渡す（呼び出し側と共有しない）

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::execution::Execution;
use crate::domain::flow::Flow;
use crate::domain::ids::ExecutionId;
use crate::ports::{ExecutionRepository, FlowRepository, RepositoryError};

/// (namespace, id) ごとに revision → Flow を保持
#[derive(Default)]
pub struct InMemoryFlowRepository {
    flows: RwLock<HashMap<(String, String), BTreeMap<u32, Arc<Flow>>>>,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates then stores `flow`; an existing revision is replaced.
    pub async fn insert(&self, flow: Flow) -> Result<(), RepositoryError> {
        flow.validate()?;
        let key = (flow.namespace.clone(), flow.id.clone());
        self.flows
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(flow.revision, Arc::new(flow));
        Ok(())
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn find_by_id(
        &self,
        namespace: &str,
        id: &str,
        revision: Option<u32>,
    ) -> Result<Option<Arc<Flow>>, RepositoryError> {
        let flows = self.flows.read().await;
        let Some(revisions) = flows.get(&(namespace.to_string(), id.to_string())) else {
            return Ok(None);
        };
        let flow = match revision {
            Some(revision) => revisions.get(&revision),
            None => revisions.values().next_back(),
        };
        Ok(flow.cloned())
    }
}

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn find_by_id(&self, id: ExecutionId) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn save(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }
}
