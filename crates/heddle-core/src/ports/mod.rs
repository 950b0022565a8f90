//! Ports - 抽象化レイヤー
//!
//! executor が依存する外部コラボレータの trait（Hexagonal Architecture の「ポート」）。
//! 永続化・ブローカー・worker 実行の詳細はここで隠蔽する。
//! 開発用の in-memory 実装は `impls` にある。

pub mod clock;
pub mod dispatch;
pub mod event_sink;
pub mod execution_repository;
pub mod flow_repository;
pub mod id_generator;
pub mod renderer;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::dispatch::{DispatchError, WorkerDispatcher};
pub use self::event_sink::ExecutionEventSink;
pub use self::execution_repository::ExecutionRepository;
pub use self::flow_repository::{FlowRepository, RepositoryError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::renderer::{RenderError, Renderer};
