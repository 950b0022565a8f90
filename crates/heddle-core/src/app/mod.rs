//! App - アプリケーション層
//!
//! ports と engine を組み合わせて executor を動かす。
//!
//! # 主要コンポーネント
//! - **Executor**: 1 activation 分の状態遷移を計算する（I/O なし）
//! - **ExecutorLoop**: partition ごとに activation を直列実行し、副作用を反映する
//! - **ExecutorBuilder**: 依存のワイヤリングと起動時検証
//! - **restart**: FAILED / KILLED execution の再開
//! - **ExecutionStatus**: 読み取り専用ビュー

pub mod builder;
pub mod config;
pub mod executor;
pub mod executor_loop;
pub mod restart;
pub mod status;


pub use self::builder::{App, BuildError, ExecutorBuilder};
pub use self::config::{ConfigError, ExecutorConfig};
pub use self::executor::{Activation, Executor, ExecutorError, Timer};
pub use self::executor_loop::{ExecutorClient, ExecutorDeps, ExecutorHandle, ExecutorLoop};
pub use self::restart::{RestartError, restart};
pub use self::status::{ExecutionStatus, FailureView, TaskRunStatus};
