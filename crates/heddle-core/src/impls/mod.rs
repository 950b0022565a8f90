//! Impls - ports の in-memory 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryFlowRepository / InMemoryExecutionRepository**: 正本の代わり
//! - **ChannelDispatcher**: 同一プロセス内の worker へ mpsc で配送
//! - **BroadcastEventSink**: 更新された execution を購読者へ配る
//!
//! 永続化やブローカーを使う実装は別クレートに置く想定。

pub mod channel;
pub mod memory;

pub use self::channel::{BroadcastEventSink, ChannelDispatcher};
pub use self::memory::{InMemoryExecutionRepository, InMemoryFlowRepository};
