//! Resolution engine.
//!
//! Given the static task tree and an immutable execution snapshot, computes
//! for one container (or the flow root):
//! - the positions that must be instantiated now (`nexts`)
//! - whether the container is complete, and with which terminal state
//!
//! Everything here is a pure function of `(flow, execution)`: evaluating the
//! same snapshot twice yields the same result, which is what makes message
//! redelivery safe. Existing TaskRuns are matched by (task id, parent run,
//! value), never by list position.

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

use crate::domain::errors::{ErrorKind, RegistryError};
use crate::domain::execution::{Execution, TaskRun};
use crate::domain::flow::Flow;
use crate::domain::ids::TaskRunId;
use crate::domain::resolved::ResolvedTask;
use crate::domain::state::StateType;
use crate::domain::task::{EachValues, Task, TaskKind};
use crate::ports::renderer::{RenderError, Renderer};

use super::render::render_context;

/// Configuration problems that surface while resolving.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionError {
    #[error("task `{0}` has no children")]
    EmptyContainer(String),

    #[error("switch `{task_id}` has no case `{key}` and no defaults")]
    NoMatchingCase { task_id: String, key: String },

    #[error("task `{0}` is not a container")]
    NotAContainer(String),

    #[error("task `{0}` is not runnable")]
    NotRunnable(String),

    #[error("task `{0}` is not part of the flow")]
    UnknownTask(String),

    #[error("each `{task_id}` has invalid values: {reason}")]
    InvalidEachValues { task_id: String, reason: String },

    #[error("cannot render `{task_id}`: {source}")]
    Render {
        task_id: String,
        #[source]
        source: RenderError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ResolutionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Permanent
    }
}

/// Result of evaluating one container against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation<'f> {
    pub nexts: Vec<ResolvedTask<'f>>,
    /// `Some` once the container is complete.
    pub state: Option<StateType>,
}

impl<'f> Evaluation<'f> {
    fn next(nexts: Vec<ResolvedTask<'f>>) -> Self {
        Self { nexts, state: None }
    }

    fn in_progress() -> Self {
        Self {
            nexts: Vec::new(),
            state: None,
        }
    }

    fn complete(state: StateType) -> Self {
        Self {
            nexts: Vec::new(),
            state: Some(state),
        }
    }
}

/// Aggregated child outcome. Priority: KILLED > FAILED > WARNING > SUCCESS.
#[derive(Debug, Default)]
struct Outcome {
    killed: bool,
    failed: bool,
    warning: bool,
}

impl Outcome {
    fn record(&mut self, task: &Task, state: StateType) {
        match state {
            StateType::Killed => self.killed = true,
            StateType::Failed | StateType::Cancelled if task.allow_failure => self.warning = true,
            StateType::Failed | StateType::Cancelled => self.failed = true,
            StateType::Warning => self.warning = true,
            _ => {}
        }
    }

    /// No further sibling may start.
    fn is_blocking(&self) -> bool {
        self.killed || self.failed
    }

    fn finish(&self) -> StateType {
        if self.killed {
            StateType::Killed
        } else if self.failed {
            StateType::Failed
        } else if self.warning {
            StateType::Warning
        } else {
            StateType::Success
        }
    }
}

pub struct Resolver<'f, 'e> {
    flow: &'f Flow,
    execution: &'e Execution,
    renderer: &'e dyn Renderer,
}

impl<'f, 'e> Resolver<'f, 'e> {
    pub fn new(flow: &'f Flow, execution: &'e Execution, renderer: &'e dyn Renderer) -> Self {
        Self {
            flow,
            execution,
            renderer,
        }
    }

    /// The root behaves as a Sequential over the flow's tasks with the flow's
    /// error branch.
    pub fn resolve_root(&self) -> Result<Evaluation<'f>, ResolutionError> {
        if self.flow.tasks.is_empty() {
            return Err(ResolutionError::EmptyContainer(self.flow.id.clone()));
        }
        let children = ResolvedTask::of_all(&self.flow.tasks, None, None);
        let nominal = self.sequential(&children);
        Ok(self.with_errors(nominal, &self.flow.errors, None, None))
    }

    pub fn resolve(&self, task: &'f Task, run: &TaskRun) -> Result<Evaluation<'f>, ResolutionError> {
        let parent = Some(run.id);
        let value = run.value.as_deref();

        let nominal = match &task.kind {
            TaskKind::Runnable { .. } => {
                return Err(ResolutionError::NotAContainer(task.id.clone()));
            }
            TaskKind::Sequential { tasks } => {
                ensure_children(task, tasks)?;
                self.sequential(&ResolvedTask::of_all(tasks, value, parent))
            }
            TaskKind::Parallel { tasks, concurrent } => {
                ensure_children(task, tasks)?;
                self.parallel(&ResolvedTask::of_all(tasks, value, parent), *concurrent)
            }
            TaskKind::Each {
                tasks,
                values,
                parallel,
                concurrent,
            } => {
                ensure_children(task, tasks)?;
                let positions: Vec<_> = self
                    .each_values(task, values, run)?
                    .iter()
                    .flat_map(|v| ResolvedTask::of_all(tasks, Some(v.as_str()), parent))
                    .collect();
                if *parallel {
                    self.parallel(&positions, *concurrent)
                } else {
                    self.sequential(&positions)
                }
            }
            TaskKind::Switch {
                value: expression,
                cases,
                defaults,
            } => {
                let key = self.render(task, expression, run)?;
                let key = key.trim();
                let branch = cases.get(key).unwrap_or(defaults);
                if branch.is_empty() {
                    return Err(ResolutionError::NoMatchingCase {
                        task_id: task.id.clone(),
                        key: key.to_string(),
                    });
                }
                self.sequential(&ResolvedTask::of_all(branch, value, parent))
            }
        };

        Ok(self.with_errors(nominal, &task.errors, value, parent))
    }

    pub fn resolve_nexts(
        &self,
        task: &'f Task,
        run: &TaskRun,
    ) -> Result<Vec<ResolvedTask<'f>>, ResolutionError> {
        Ok(self.resolve(task, run)?.nexts)
    }

    pub fn resolve_state(
        &self,
        task: &'f Task,
        run: &TaskRun,
    ) -> Result<Option<StateType>, ResolutionError> {
        Ok(self.resolve(task, run)?.state)
    }

    /// One position in flight at a time, in declaration order.
    fn sequential(&self, positions: &[ResolvedTask<'f>]) -> Evaluation<'f> {
        let mut outcome = Outcome::default();
        for position in positions {
            match position.find_run(self.execution) {
                None => return Evaluation::next(vec![position.clone()]),
                Some(run) if !run.state.is_terminated() => return Evaluation::in_progress(),
                Some(run) => {
                    outcome.record(position.task, run.state.current());
                    if outcome.is_blocking() {
                        return Evaluation::complete(outcome.finish());
                    }
                }
            }
        }
        Evaluation::complete(outcome.finish())
    }

    /// Admits missing positions up to `concurrent` non-terminal runs. After a
    /// failure nothing new is admitted; running siblings are left to finish.
    fn parallel(&self, positions: &[ResolvedTask<'f>], concurrent: Option<usize>) -> Evaluation<'f> {
        let mut outcome = Outcome::default();
        let mut running = 0usize;
        let mut missing = Vec::new();

        for position in positions {
            match position.find_run(self.execution) {
                None => missing.push(position),
                Some(run) if !run.state.is_terminated() => running += 1,
                Some(run) => outcome.record(position.task, run.state.current()),
            }
        }

        if !missing.is_empty() && !outcome.is_blocking() {
            let admit = concurrent.unwrap_or(usize::MAX).saturating_sub(running);
            return Evaluation::next(missing.into_iter().take(admit).cloned().collect());
        }
        if running > 0 {
            return Evaluation::in_progress();
        }
        Evaluation::complete(outcome.finish())
    }

    /// Diverts a FAILED container into its error branch. The container only
    /// reports upward once that branch is done; the result stays FAILED.
    fn with_errors(
        &self,
        nominal: Evaluation<'f>,
        errors: &'f [Task],
        value: Option<&str>,
        parent: Option<TaskRunId>,
    ) -> Evaluation<'f> {
        let errors = ResolvedTask::of_all(errors, value, parent);
        let Some(first) = errors.first() else {
            return nominal;
        };

        let started = errors.iter().any(|e| e.find_run(self.execution).is_some());
        if started {
            let branch = self.sequential(&errors);
            return match branch.state {
                Some(StateType::Killed) => Evaluation::complete(StateType::Killed),
                Some(_) => Evaluation::complete(StateType::Failed),
                None => branch,
            };
        }

        match nominal.state {
            Some(StateType::Failed) => Evaluation::next(vec![first.clone()]),
            _ => nominal,
        }
    }

    /// Renders the iteration domain of an Each: de-duplicated, order kept.
    fn each_values(
        &self,
        task: &Task,
        values: &EachValues,
        run: &TaskRun,
    ) -> Result<Vec<String>, ResolutionError> {
        let invalid = |reason: String| ResolutionError::InvalidEachValues {
            task_id: task.id.clone(),
            reason,
        };

        let raw: Vec<String> = match values {
            EachValues::List(items) => items
                .iter()
                .map(|item| self.render(task, item, run))
                .collect::<Result<_, _>>()?,
            EachValues::Expression(expression) => {
                let rendered = self.render(task, expression, run)?;
                let parsed: Value =
                    serde_json::from_str(&rendered).map_err(|e| invalid(e.to_string()))?;
                let Value::Array(items) = parsed else {
                    return Err(invalid(format!("`{rendered}` is not a JSON array")));
                };
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Null => Err(invalid("null value".to_string())),
                        Value::String(s) => Ok(s),
                        other => Ok(other.to_string()),
                    })
                    .collect::<Result<_, _>>()?
            }
        };

        let mut seen = HashSet::new();
        Ok(raw.into_iter().filter(|v| seen.insert(v.clone())).collect())
    }

    fn render(&self, task: &Task, template: &str, run: &TaskRun) -> Result<String, ResolutionError> {
        let vars = render_context(self.flow, self.execution, Some(run));
        self.renderer
            .render(template, &vars)
            .map_err(|source| ResolutionError::Render {
                task_id: task.id.clone(),
                source,
            })
    }
}

fn ensure_children(task: &Task, children: &[Task]) -> Result<(), ResolutionError> {
    if children.is_empty() {
        return Err(ResolutionError::EmptyContainer(task.id.clone()));
    }
    Ok(())
}
