//! heddle-core
//!
//! Core building blocks for the Heddle flow executor.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（flow / task tree, execution, task run, state, messages, errors）
//! - **engine**: 解決エンジン（flowable の nexts / 終端判定）とテンプレート描画
//! - **retry**: backoff と失敗 attempt の Decider
//! - **ports**: 抽象化レイヤー（FlowRepository, ExecutionRepository, WorkerDispatcher, Clock など）
//! - **app**: Executor, ExecutorLoop, builder, restart, status
//! - **impls**: in-memory 実装（開発用・テスト用）
//! - **worker**: handler を実行する worker group

pub mod app;
pub mod domain;
pub mod engine;
pub mod impls;
pub mod ports;
pub mod retry;
pub mod worker;
