//! ResolvedTask: a logical position to instantiate as a TaskRun.

use super::execution::{Execution, TaskRun};
use super::ids::TaskRunId;
use super::task::Task;

/// `(task, value, parent)` triple. Recomputed on every evaluation, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask<'f> {
    pub task: &'f Task,
    pub value: Option<String>,
    pub parent_task_run_id: Option<TaskRunId>,
}

impl<'f> ResolvedTask<'f> {
    pub fn new(task: &'f Task, value: Option<String>, parent_task_run_id: Option<TaskRunId>) -> Self {
        Self {
            task,
            value,
            parent_task_run_id,
        }
    }

    /// Resolves a child list under one parent, dropping disabled tasks.
    pub fn of_all(
        tasks: &'f [Task],
        value: Option<&str>,
        parent_task_run_id: Option<TaskRunId>,
    ) -> Vec<ResolvedTask<'f>> {
        tasks
            .iter()
            .filter(|t| !t.disabled)
            .map(|t| ResolvedTask::new(t, value.map(str::to_string), parent_task_run_id))
            .collect()
    }

    pub fn matches(&self, run: &TaskRun) -> bool {
        run.is_for(&self.task.id, self.parent_task_run_id, self.value.as_deref())
    }

    pub fn find_run<'e>(&self, execution: &'e Execution) -> Option<&'e TaskRun> {
        execution.find_position(&self.task.id, self.parent_task_run_id, self.value.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tasks_are_not_resolved() {
        let tasks = vec![
            Task::runnable("a", "noop"),
            Task::runnable("b", "noop").disabled(),
            Task::runnable("c", "noop"),
        ];

        let resolved = ResolvedTask::of_all(&tasks, Some("x"), None);
        let ids: Vec<_> = resolved.iter().map(|r| r.task.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(resolved.iter().all(|r| r.value.as_deref() == Some("x")));
    }
}
