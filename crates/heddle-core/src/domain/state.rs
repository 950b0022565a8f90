//! State value object shared by executions, task runs and attempts.
//!
//! A `State` is the current status plus the append-only history of every
//! status it went through. Transitions never mutate: `with_state` returns a new
//! value and leaves the original untouched.
//!
//! State transitions:
//! - CREATED -> RUNNING -> {SUCCESS, WARNING, FAILED, KILLED, CANCELLED}
//! - RUNNING -> PAUSED -> RUNNING
//! - RUNNING -> KILLING -> KILLED
//! - RUNNING -> RETRYING -> CREATED (a new attempt is armed)
//! - terminal -> RESTARTED -> RUNNING
//!
//! それ以外に許す辺:
//! - CREATED -> {KILLED, FAILED, RETRYING}: worker に届く前の kill / 設定ミス /
//!   RUNNING を報告しないまま失敗した attempt
//! - KILLING -> FAILED: kill 中に設定ミスが見つかった
//! - PAUSED -> {KILLING, KILLED}: 停止中の kill

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Created,
    Running,
    Paused,
    Restarted,
    Retrying,
    Retried,
    Killing,
    Killed,
    Warning,
    Success,
    Failed,
    Cancelled,
    Queued,
}

impl StateType {
    /// Is this a terminal state (no further transitions except RESTARTED)?
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            StateType::Success
                | StateType::Failed
                | StateType::Killed
                | StateType::Cancelled
                | StateType::Warning
        )
    }

    pub fn is_created(self) -> bool {
        matches!(self, StateType::Created | StateType::Restarted)
    }

    pub fn is_running(self) -> bool {
        matches!(self, StateType::Running | StateType::Killing)
    }

    pub fn is_failed(self) -> bool {
        self == StateType::Failed
    }

    pub fn is_paused(self) -> bool {
        self == StateType::Paused
    }

    pub fn is_retrying(self) -> bool {
        matches!(self, StateType::Retrying | StateType::Retried)
    }

    pub fn is_success(self) -> bool {
        self == StateType::Success
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: StateType) -> bool {
        use StateType::*;

        if self == next {
            return false;
        }
        if self.is_terminated() {
            return next == Restarted;
        }
        match self {
            Created => matches!(next, Running | Queued | Retrying | Killed | Failed | Cancelled),
            Queued => matches!(next, Running | Killed | Cancelled),
            Running => matches!(
                next,
                Success | Warning | Failed | Killed | Cancelled | Paused | Killing | Retrying
            ),
            Paused => matches!(next, Running | Killing | Killed),
            Retrying => matches!(next, Created | Killed),
            Restarted => next == Running,
            Killing => matches!(next, Killed | Failed),
            _ => false,
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateType::Created => "CREATED",
            StateType::Running => "RUNNING",
            StateType::Paused => "PAUSED",
            StateType::Restarted => "RESTARTED",
            StateType::Retrying => "RETRYING",
            StateType::Retried => "RETRIED",
            StateType::Killing => "KILLING",
            StateType::Killed => "KILLED",
            StateType::Warning => "WARNING",
            StateType::Success => "SUCCESS",
            StateType::Failed => "FAILED",
            StateType::Cancelled => "CANCELLED",
            StateType::Queued => "QUEUED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("state is already {0}")]
    SameState(StateType),

    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: StateType, to: StateType },
}

/// One entry of a state history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    current: StateType,
    histories: Vec<History>,
}

impl State {
    /// A fresh CREATED state.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::of(StateType::Created, now)
    }

    /// A fresh state starting at `state`.
    pub fn of(state: StateType, now: DateTime<Utc>) -> Self {
        Self {
            current: state,
            histories: vec![History { state, date: now }],
        }
    }

    pub fn current(&self) -> StateType {
        self.current
    }

    pub fn histories(&self) -> &[History] {
        &self.histories
    }

    /// Transition to `next`, returning the new state.
    ///
    /// History dates never go backwards: if the clock is behind the last
    /// recorded date, the last date is reused.
    pub fn with_state(&self, next: StateType, now: DateTime<Utc>) -> Result<State, StateError> {
        if self.current == next {
            return Err(StateError::SameState(next));
        }
        if !self.current.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                from: self.current,
                to: next,
            });
        }

        let date = match self.histories.last() {
            Some(last) if last.date > now => last.date,
            _ => now,
        };

        let mut histories = self.histories.clone();
        histories.push(History { state: next, date });
        Ok(State {
            current: next,
            histories,
        })
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.histories.first().map(|h| h.date)
    }

    /// Date of the last transition, only once terminated or paused.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        if !self.is_terminated() && !self.is_paused() {
            return None;
        }
        self.histories.last().map(|h| h.date)
    }

    pub fn last_date(&self) -> Option<DateTime<Utc>> {
        self.histories.last().map(|h| h.date)
    }

    /// Last history date (or `now` while not terminated) minus the first.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        let Some(start) = self.start_date() else {
            return Duration::ZERO;
        };
        let end = if self.is_terminated() {
            self.last_date().unwrap_or(now)
        } else {
            now
        };
        (end - start).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_terminated(&self) -> bool {
        self.current.is_terminated()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_running()
    }

    pub fn is_created(&self) -> bool {
        self.current.is_created()
    }

    pub fn is_failed(&self) -> bool {
        self.current.is_failed()
    }

    pub fn is_paused(&self) -> bool {
        self.current.is_paused()
    }

    pub fn is_retrying(&self) -> bool {
        self.current.is_retrying()
    }
}
