//! Errors - エラー型と分類
//!
//! `ErrorKind` は運用上の分類で、executor が「再配送するか / 実行を失敗させるか」
//! を決めるのに使う。各レイヤーのエラー enum は `kind()` でこれを返す。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operational classification of a failure.
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（repository / broker の障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    /// Whether re-delivering the triggering message can help.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Flow definition problems, detected by `Flow::validate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("flow {namespace}.{flow_id} has no tasks")]
    EmptyFlow { namespace: String, flow_id: String },

    #[error("task `{0}` has an empty task list")]
    EmptyContainer(String),

    #[error("task id `{0}` is declared more than once")]
    DuplicateTaskId(String),

    #[error("switch `{0}` has neither cases nor defaults")]
    EmptySwitch(String),

    #[error("each `{0}` has an empty value list")]
    EmptyEachValues(String),

    #[error("task `{0}` declares concurrent = 0")]
    ZeroConcurrency(String),

    #[error("task `{0}` declares a retry policy with max_attempt = 0")]
    ZeroMaxAttempt(String),

    #[error("input `{0}` is declared more than once")]
    DuplicateInput(String),

    #[error("required input `{0}` was not provided")]
    MissingInput(String),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

/// Task-type and handler registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task type `{0}` is already registered")]
    DuplicateTaskType(String),

    #[error("task type `{0}` is not registered")]
    UnknownTaskType(String),

    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_permanent_errors_are_not_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Infrastructure.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Infrastructure).unwrap();
        assert_eq!(json, "\"infrastructure\"");
    }
}
