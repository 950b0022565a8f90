//! TaskType registry - runnable `task_type` から振る舞い記述子への対応表
//!
//! 起動時に一度だけ組み立て、以降は read-only で共有する（ロック不要）。
//! 空のレジストリはすべての task_type を受け付ける（open mode）。

use std::collections::HashMap;
use std::time::Duration;

use super::errors::RegistryError;
use super::task::{RetryPolicy, Task};

/// Defaults applied to every runnable task of one type.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTypeDescriptor {
    pub name: String,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

impl TaskTypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: None,
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskTypeRegistry {
    descriptors: HashMap<String, TaskTypeDescriptor>,
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TaskTypeDescriptor) -> Result<(), RegistryError> {
        if self.descriptors.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTaskType(descriptor.name));
        }
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&TaskTypeDescriptor> {
        self.descriptors.get(task_type)
    }

    /// Looks up `task_type`. In open mode every type resolves to `None`.
    pub fn resolve(&self, task_type: &str) -> Result<Option<&TaskTypeDescriptor>, RegistryError> {
        if self.descriptors.is_empty() {
            return Ok(None);
        }
        self.descriptors
            .get(task_type)
            .map(Some)
            .ok_or_else(|| RegistryError::UnknownTaskType(task_type.to_string()))
    }

    /// Task-level policy wins over the type default.
    pub fn effective_retry(&self, task: &Task) -> Option<RetryPolicy> {
        task.retry.clone().or_else(|| {
            task.task_type()
                .and_then(|t| self.get(t))
                .and_then(|d| d.retry.clone())
        })
    }

    pub fn effective_timeout(&self, task: &Task) -> Option<Duration> {
        task.timeout().or_else(|| {
            task.task_type()
                .and_then(|t| self.get(t))
                .and_then(|d| d.timeout)
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
