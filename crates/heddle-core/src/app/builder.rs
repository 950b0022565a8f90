//! ExecutorBuilder - executor の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 差し替え可能な依存（clock / id / renderer / decider）とデフォルト

use std::sync::Arc;

use crate::app::config::{ConfigError, ExecutorConfig};
use crate::app::executor::Executor;
use crate::app::executor_loop::{ExecutorDeps, ExecutorHandle, ExecutorLoop};
use crate::domain::errors::RegistryError;
use crate::domain::task_type::{TaskTypeDescriptor, TaskTypeRegistry};
use crate::ports::{
    Clock, ExecutionEventSink, ExecutionRepository, FlowRepository, IdGenerator, Renderer,
    SystemClock, UlidGenerator, WorkerDispatcher,
};
use crate::retry::Decider;

/// ExecutorBuilder はループ一式を組み立てる
///
/// # 使用例
/// ```ignore
/// let handle = ExecutorBuilder::new(flows, executions, dispatcher, events)
///     .register(TaskTypeDescriptor::new("shell"))?
///     .expect_task_types(&["shell"])
///     .config(config)
///     .build()?
///     .start()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_task_types() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
pub struct ExecutorBuilder {
    flows: Arc<dyn FlowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    events: Arc<dyn ExecutionEventSink>,
    config: ExecutorConfig,
    registry: TaskTypeRegistry,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    renderer: Option<Arc<dyn Renderer>>,
    decider: Option<Arc<dyn Decider>>,
    expected_task_types: Option<Vec<String>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These task types were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ExecutorBuilder {
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        executions: Arc<dyn ExecutionRepository>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        events: Arc<dyn ExecutionEventSink>,
    ) -> Self {
        Self {
            flows,
            executions,
            dispatcher,
            events,
            config: ExecutorConfig::default(),
            registry: TaskTypeRegistry::new(),
            clock: None,
            ids: None,
            renderer: None,
            decider: None,
            expected_task_types: None,
        }
    }

    /// Task type を登録（重複はエラー）
    pub fn register(mut self, descriptor: TaskTypeDescriptor) -> Result<Self, RegistryError> {
        self.registry.register(descriptor)?;
        Ok(self)
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// 期待される task_type のリストを設定
    pub fn expect_task_types(mut self, task_types: &[&str]) -> Self {
        self.expected_task_types = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// 検証してから組み立てる
    ///
    /// # 検証
    /// - 設定値（partitions > 0 など）
    /// - expect_task_types() の task_type が全て登録されているか
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_task_types {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| self.registry.get(t).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        // clock を差し替えたら ID の timestamp もそれに揃える
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let mut executor = Executor::new(clock, ids)
            .with_registry(Arc::new(self.registry))
            .with_config(&self.config);
        if let Some(renderer) = self.renderer {
            executor = executor.with_renderer(renderer);
        }
        if let Some(decider) = self.decider {
            executor = executor.with_decider(decider);
        }

        Ok(App {
            config: self.config,
            deps: ExecutorDeps {
                executor: Arc::new(executor),
                flows: self.flows,
                executions: self.executions,
                dispatcher: self.dispatcher,
                events: self.events,
            },
        })
    }
}

/// 組み立て済みで、まだ起動していないループ
pub struct App {
    pub config: ExecutorConfig,
    pub deps: ExecutorDeps,
}

impl App {
    pub fn executor(&self) -> &Arc<Executor> {
        &self.deps.executor
    }

    /// Spawns the partitions. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<ExecutorHandle, ConfigError> {
        ExecutorLoop::start(self.config, self.deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{
        BroadcastEventSink, ChannelDispatcher, InMemoryExecutionRepository, InMemoryFlowRepository,
    };

    fn builder() -> ExecutorBuilder {
        let (dispatcher, _rx) = ChannelDispatcher::new(8);
        ExecutorBuilder::new(
            Arc::new(InMemoryFlowRepository::new()),
            Arc::new(InMemoryExecutionRepository::new()),
            Arc::new(dispatcher),
            Arc::new(BroadcastEventSink::new(8)),
        )
    }

    #[test]
    fn test_build_success() {
        let app = builder()
            .register(TaskTypeDescriptor::new("shell"))
            .unwrap()
            .expect_task_types(&["shell"])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let app = builder()
            .register(TaskTypeDescriptor::new("shell"))
            .unwrap()
            .expect_task_types(&["shell", "http"])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec!["http".to_string()]
        ));
    }

    #[test]
    fn test_build_no_expect_task_types() {
        let app = builder().build().unwrap();
        assert!(app.executor().registry().is_empty());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let err = builder()
            .register(TaskTypeDescriptor::new("shell"))
            .unwrap()
            .register(TaskTypeDescriptor::new("shell"))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateTaskType(t) if t == "shell"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = ExecutorConfig {
            partitions: 0,
            ..ExecutorConfig::default()
        };
        let app = builder().config(config).build();
        assert!(matches!(app, Err(BuildError::Config(ConfigError::InvalidValue { .. }))));
    }
}
