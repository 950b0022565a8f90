//! Executor - 1 回の activation を処理する状態機械
//!
//! `process` は (flow, execution スナップショット, メッセージ) から次の
//! execution と副作用の一覧（WorkerTask / WorkerKill / タイマー）を計算する。
//! I/O は一切しない。永続化・送信・タイマーの起動は `ExecutorLoop` の仕事。
//!
//! # 流れ
//! 1. RESTART なら `restart()` を先に適用、それ以外で終端済みなら無視
//! 2. CREATED / RESTARTED を RUNNING へ
//! 3. メッセージ固有の処理（結果の反映、kill、pause / resume、retry、timeout ...）
//! 4. 何も変わらなくなるまで container と root を解決する
//!
//! PAUSED の間は新しい task run を作らず、retry も再開時まで保留する。
//! 実行中の attempt の結果はそのまま反映する。
//!
//! 設定ミス（switch の不一致、未知の task type、テンプレート不備）は
//! execution を FAILED にして diagnostic に理由を残す。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::app::config::ExecutorConfig;
use crate::app::restart::{RestartError, restart};
use crate::domain::errors::ErrorKind;
use crate::domain::execution::{Execution, ExecutionError, TaskFailure, TaskRun};
use crate::domain::flow::Flow;
use crate::domain::ids::{ExecutionId, TaskRunId};
use crate::domain::messages::{AttemptKey, Inbound, WorkerKill, WorkerTask, WorkerTaskResult};
use crate::domain::resolved::ResolvedTask;
use crate::domain::state::{StateError, StateType};
use crate::domain::task::{Task, TaskKind};
use crate::domain::task_type::TaskTypeRegistry;
use crate::engine::{ResolutionError, Resolver, TemplateRenderer, render_context, render_value};
use crate::ports::{Clock, DispatchError, IdGenerator, Renderer, RepositoryError};
use crate::retry::{Decider, Decision, DefaultDecider};

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// 設定ミス。`process` の中では execution の FAILED に変換される
    #[error("resolution failed: {source}")]
    Resolution {
        task_run_id: Option<TaskRunId>,
        #[source]
        source: ResolutionError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error("resolution did not settle after {0} passes")]
    Diverged(usize),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("executor loop is shut down")]
    Closed,
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Repository(e) => e.kind(),
            ExecutorError::Dispatch(e) => e.kind(),
            ExecutorError::Closed => ErrorKind::Infrastructure,
            _ => ErrorKind::Permanent,
        }
    }
}

fn resolution(task_run_id: Option<TaskRunId>, source: impl Into<ResolutionError>) -> ExecutorError {
    ExecutorError::Resolution {
        task_run_id,
        source: source.into(),
    }
}

/// A message to feed back into the executor after `after`.
#[derive(Debug, Clone, PartialEq)]
pub struct Timer {
    pub after: Duration,
    pub message: Inbound,
}

/// Output of one activation.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub execution: Execution,
    /// Whether `execution` differs from the input snapshot.
    pub changed: bool,
    pub worker_tasks: Vec<WorkerTask>,
    pub worker_kills: Vec<WorkerKill>,
    pub timers: Vec<Timer>,
}

/// activation 中の作業領域
struct Work {
    execution: Execution,
    changed: bool,
    worker_tasks: Vec<WorkerTask>,
    worker_kills: Vec<WorkerKill>,
    timers: Vec<Timer>,
}

impl Work {
    fn new(execution: Execution) -> Self {
        Self {
            execution,
            changed: false,
            worker_tasks: Vec::new(),
            worker_kills: Vec::new(),
            timers: Vec::new(),
        }
    }

    fn run(&self, id: TaskRunId) -> Result<TaskRun, ExecutorError> {
        self.execution
            .find_task_run(id)
            .cloned()
            .ok_or(ExecutorError::Execution(ExecutionError::TaskRunNotFound(id)))
    }

    fn update(&mut self, run: TaskRun) -> Result<(), ExecutorError> {
        self.execution = self.execution.with_task_run(run)?;
        self.changed = true;
        Ok(())
    }

    fn append(&mut self, run: TaskRun) -> Result<(), ExecutorError> {
        self.execution = self.execution.with_appended(run)?;
        self.changed = true;
        Ok(())
    }

    fn transition(&mut self, next: StateType, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        self.execution = self.execution.with_state(next, now)?;
        self.changed = true;
        Ok(())
    }

    fn kill_for(&self, run: &TaskRun) -> WorkerKill {
        WorkerKill {
            execution_id: self.execution.id,
            task_run_id: run.id,
            attempt: run.attempt_number(),
        }
    }

    fn non_terminated(&self) -> Vec<TaskRunId> {
        self.execution
            .task_run_list
            .iter()
            .filter(|r| !r.state.is_terminated())
            .map(|r| r.id)
            .collect()
    }

    fn finish(self) -> Activation {
        Activation {
            execution: self.execution,
            changed: self.changed,
            worker_tasks: self.worker_tasks,
            worker_kills: self.worker_kills,
            timers: self.timers,
        }
    }
}

fn has_live_attempt(run: &TaskRun) -> bool {
    run.current_attempt()
        .is_some_and(|a| !a.state.is_terminated())
}

/// RUNNING の報告より先に（あるいは報告なしで）結果が届いた run を RUNNING にそろえる
fn started(run: &TaskRun, now: DateTime<Utc>) -> Result<TaskRun, ExecutorError> {
    let mut run = run.clone();
    if run
        .current_attempt()
        .is_some_and(|a| a.state.current() == StateType::Created)
    {
        run = run.with_attempt_state(StateType::Running, None, now)?;
    }
    Ok(run.ensure_state(StateType::Running, now)?)
}

/// Executor は execution の状態遷移を計算する
///
/// 共有される依存はすべて `Arc`。partition 間で 1 つのインスタンスを共有する。
pub struct Executor {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    renderer: Arc<dyn Renderer>,
    registry: Arc<TaskTypeRegistry>,
    decider: Arc<dyn Decider>,
    kill_grace: Duration,
    max_resolution_passes: usize,
}

impl Executor {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        let config = ExecutorConfig::default();
        Self {
            clock,
            ids,
            renderer: Arc::new(TemplateRenderer),
            registry: Arc::new(TaskTypeRegistry::new()),
            decider: Arc::new(DefaultDecider),
            kill_grace: config.kill_grace(),
            max_resolution_passes: config.max_resolution_passes,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_registry(mut self, registry: Arc<TaskTypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_config(mut self, config: &ExecutorConfig) -> Self {
        self.kill_grace = config.kill_grace();
        self.max_resolution_passes = config.max_resolution_passes;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    pub fn registry(&self) -> &TaskTypeRegistry {
        &self.registry
    }

    /// One activation: apply `message` to `execution` and resolve.
    pub fn process(
        &self,
        flow: &Flow,
        execution: &Execution,
        message: &Inbound,
    ) -> Result<Activation, ExecutorError> {
        let now = self.clock.now();
        let mut work = Work::new(execution.clone());

        if let Inbound::Restart { .. } = message {
            work.execution = restart(flow, &work.execution, now)?;
            work.changed = true;
            info!(execution_id = %execution.id, flow_id = %flow.id, "execution restarted");
        } else if work.execution.state.is_terminated() {
            debug!(
                execution_id = %execution.id,
                inbound = message.name(),
                state = %work.execution.state.current(),
                "execution already terminated, message ignored"
            );
            return Ok(work.finish());
        }

        match self.activate(flow, &mut work, message, now) {
            Ok(()) => {}
            Err(ExecutorError::Resolution {
                task_run_id,
                source,
            }) => self.fail(&mut work, task_run_id, &source.to_string(), now)?,
            Err(e) => return Err(e),
        }
        Ok(work.finish())
    }

    /// Ends a non-terminated execution as FAILED (e.g. its flow is gone).
    pub fn fail_execution(
        &self,
        execution: &Execution,
        diagnostic: &str,
    ) -> Result<Activation, ExecutorError> {
        let mut work = Work::new(execution.clone());
        if !work.execution.state.is_terminated() {
            self.fail(&mut work, None, diagnostic, self.clock.now())?;
        }
        Ok(work.finish())
    }

    fn activate(
        &self,
        flow: &Flow,
        work: &mut Work,
        message: &Inbound,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutorError> {
        self.start(flow, work, now)?;

        match message {
            Inbound::ExecutionChanged { .. } | Inbound::Restart { .. } => {}
            Inbound::WorkerTaskResult(result) => self.apply_result(flow, work, result, now)?,
            Inbound::Kill(_) => self.kill(flow, work, now)?,
            Inbound::RetryDue { task_run_id, .. } => {
                self.retry_due(flow, work, *task_run_id, now)?
            }
            Inbound::TimeoutCheck {
                task_run_id,
                attempt,
                ..
            } => self.timeout(flow, work, *task_run_id, *attempt, now)?,
            Inbound::KillTimeout { .. } => self.force_killed(work, now)?,
            Inbound::Pause { .. } => self.pause(work, now)?,
            Inbound::Resume { .. } => self.resume(flow, work, now)?,
            Inbound::Resend { attempts, .. } => self.resend(flow, work, attempts)?,
        }

        self.resolve(flow, work, now)
    }

    fn start(&self, flow: &Flow, work: &mut Work, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        if matches!(
            work.execution.state.current(),
            StateType::Created | StateType::Restarted
        ) {
            work.transition(StateType::Running, now)?;
            info!(
                execution_id = %work.execution.id,
                flow_id = %flow.id,
                revision = flow.revision,
                "execution running"
            );
        }

        let reopened: Vec<TaskRunId> = work
            .execution
            .task_run_list
            .iter()
            .filter(|r| r.state.current() == StateType::Restarted)
            .map(|r| r.id)
            .collect();
        for id in reopened {
            let run = work.run(id)?.with_state(StateType::Running, now)?;
            work.update(run)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // worker results
    // ------------------------------------------------------------------

    fn apply_result(
        &self,
        flow: &Flow,
        work: &mut Work,
        result: &WorkerTaskResult,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutorError> {
        let execution_id = work.execution.id;
        let Some(run) = work.execution.find_task_run(result.task_run_id).cloned() else {
            warn!(%execution_id, task_run_id = %result.task_run_id, "result for unknown task run ignored");
            return Ok(());
        };
        if result.attempt != run.attempt_number() {
            warn!(
                %execution_id,
                task_run_id = %run.id,
                task_id = %run.task_id,
                attempt = result.attempt,
                current = run.attempt_number(),
                "stale attempt result ignored"
            );
            return Ok(());
        }
        if run.state.is_terminated() {
            debug!(%execution_id, task_run_id = %run.id, "result for terminated task run ignored");
            return Ok(());
        }

        // KILLING 中に返ってきた結果は、中身に関係なく KILLED として扱う
        if run.state.current() == StateType::Killing {
            let mut killed = run.clone();
            if has_live_attempt(&run) {
                killed = killed.with_attempt_state(StateType::Killed, None, now)?;
            }
            work.update(killed.with_state(StateType::Killed, now)?)?;
            debug!(%execution_id, task_run_id = %run.id, task_id = %run.task_id, "task run killed");
            return Ok(());
        }

        let attempt_state = run.current_attempt().map(|a| a.state.current());
        if attempt_state.is_none_or(|s| s.is_terminated() || s == result.state) {
            debug!(
                %execution_id,
                task_run_id = %run.id,
                state = %result.state,
                "duplicate result ignored"
            );
            return Ok(());
        }

        match result.state {
            StateType::Running => {
                let running = run
                    .with_attempt_state(StateType::Running, None, now)?
                    .ensure_state(StateType::Running, now)?;
                work.update(running)?;
                debug!(%execution_id, task_run_id = %run.id, task_id = %run.task_id, "task run running");
            }
            StateType::Success | StateType::Warning => {
                let done = started(&run, now)?
                    .with_outputs(result.outputs.clone())
                    .with_attempt_state(result.state, None, now)?
                    .ensure_state(result.state, now)?;
                work.update(done)?;
                info!(
                    %execution_id,
                    task_run_id = %run.id,
                    task_id = %run.task_id,
                    state = %result.state,
                    "task run finished"
                );
            }
            StateType::Killed => {
                let killed = run
                    .with_attempt_state(StateType::Killed, result.failure.clone(), now)?
                    .ensure_state(StateType::Killed, now)?;
                work.update(killed)?;
                info!(%execution_id, task_run_id = %run.id, task_id = %run.task_id, "task run killed by worker");
            }
            StateType::Failed => {
                let failure = result
                    .failure
                    .clone()
                    .unwrap_or_else(|| TaskFailure::transient("task failed without a reason"));
                self.fail_attempt(flow, work, run, failure, now)?;
            }
            other => {
                warn!(%execution_id, task_run_id = %run.id, state = %other, "unsupported result state ignored");
            }
        }
        Ok(())
    }

    /// Applies the retry decision to a failed attempt.
    fn fail_attempt(
        &self,
        flow: &Flow,
        work: &mut Work,
        run: TaskRun,
        failure: TaskFailure,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutorError> {
        let failed = run.with_attempt_state(StateType::Failed, Some(failure.clone()), now)?;
        let policy = flow
            .find_task(&run.task_id)
            .and_then(|task| self.registry.effective_retry(task));

        match self.decider.decide(policy.as_ref(), &failed, &failure) {
            Decision::Retry { delay, reason } => {
                let retry_at = TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                work.update(failed.with_retry_at(retry_at, now)?)?;
                work.timers.push(Timer {
                    after: delay,
                    message: Inbound::RetryDue {
                        execution_id: work.execution.id,
                        task_run_id: run.id,
                    },
                });
                info!(
                    execution_id = %work.execution.id,
                    task_run_id = %run.id,
                    task_id = %run.task_id,
                    error = %failure.message,
                    %reason,
                    "attempt failed, retry scheduled"
                );
            }
            Decision::MarkDead { reason } => {
                work.update(failed.with_state(StateType::Failed, now)?)?;
                info!(
                    execution_id = %work.execution.id,
                    task_run_id = %run.id,
                    task_id = %run.task_id,
                    error = %failure.message,
                    %reason,
                    "task run failed"
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // timers and control messages
    // ------------------------------------------------------------------

    fn retry_due(
        &self,
        flow: &Flow,
        work: &mut Work,
        id: TaskRunId,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutorError> {
        let Some(run) = work.execution.find_task_run(id).cloned() else {
            return Ok(());
        };
        if run.state.current() != StateType::Retrying
            || work.execution.state.current() != StateType::Running
        {
            debug!(execution_id = %work.execution.id, task_run_id = %id, "retry no longer due");
            return Ok(());
        }

        work.update(run.with_new_attempt(now)?)?;
        self.dispatch(flow, work, id)
    }

    fn timeout(
        &self,
        flow: &Flow,
        work: &mut Work,
        id: TaskRunId,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutorError> {
        let Some(run) = work.execution.find_task_run(id).cloned() else {
            return Ok(());
        };
        if attempt != run.attempt_number()
            || run.state.is_terminated()
            || run.state.current() == StateType::Killing
            || !has_live_attempt(&run)
        {
            return Ok(());
        }

        warn!(
            execution_id = %work.execution.id,
            task_run_id = %id,
            task_id = %run.task_id,
            attempt,
            "attempt timed out"
        );
        let kill = work.kill_for(&run);
        work.worker_kills.push(kill);
        let failure = TaskFailure::transient(format!("attempt {attempt} timed out"));
        self.fail_attempt(flow, work, run, failure, now)
    }

    fn kill(&self, flow: &Flow, work: &mut Work, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        if work.execution.state.current() == StateType::Killing {
            debug!(execution_id = %work.execution.id, "execution already killing");
            return Ok(());
        }
        work.transition(StateType::Killing, now)?;
        info!(execution_id = %work.execution.id, "killing execution");

        for id in work.non_terminated() {
            let run = work.run(id)?;
            let container = flow.find_task(&run.task_id).is_some_and(Task::is_flowable);
            match run.state.current() {
                StateType::Killing => {}
                StateType::Running => {
                    if !container {
                        let kill = work.kill_for(&run);
                        work.worker_kills.push(kill);
                    }
                    work.update(run.with_state(StateType::Killing, now)?)?;
                }
                _ => {
                    // まだ worker に渡っていない (CREATED / RETRYING ...) ものは即 KILLED
                    let mut killed = run.clone();
                    if has_live_attempt(&run) {
                        killed = killed.with_attempt_state(StateType::Killed, None, now)?;
                        let kill = work.kill_for(&run);
                        work.worker_kills.push(kill);
                    }
                    work.update(killed.with_state(StateType::Killed, now)?)?;
                }
            }
        }

        work.timers.push(Timer {
            after: self.kill_grace,
            message: Inbound::KillTimeout {
                execution_id: work.execution.id,
            },
        });
        Ok(())
    }

    /// Grace period is over: whatever is still KILLING becomes KILLED.
    fn force_killed(&self, work: &mut Work, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        if work.execution.state.current() != StateType::Killing {
            return Ok(());
        }

        for id in work.non_terminated() {
            let run = work.run(id)?;
            if run.state.current() != StateType::Killing {
                continue;
            }
            let mut killed = run.clone();
            if has_live_attempt(&run) {
                killed = killed.with_attempt_state(StateType::Killed, None, now)?;
            }
            work.update(killed.with_state(StateType::Killed, now)?)?;
            warn!(
                execution_id = %work.execution.id,
                task_run_id = %id,
                task_id = %run.task_id,
                "no kill acknowledgement, forced to KILLED"
            );
        }
        Ok(())
    }

    fn pause(&self, work: &mut Work, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let current = work.execution.state.current();
        if current != StateType::Running {
            debug!(execution_id = %work.execution.id, state = %current, "only a running execution can be paused");
            return Ok(());
        }
        work.transition(StateType::Paused, now)?;
        info!(execution_id = %work.execution.id, "execution paused");
        Ok(())
    }

    fn resume(&self, flow: &Flow, work: &mut Work, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        let current = work.execution.state.current();
        if current != StateType::Paused {
            debug!(execution_id = %work.execution.id, state = %current, "execution is not paused");
            return Ok(());
        }
        work.transition(StateType::Running, now)?;
        info!(execution_id = %work.execution.id, "execution resumed");

        // 停止中に期限が来た retry はここで拾う
        let due: Vec<TaskRunId> = work
            .execution
            .task_run_list
            .iter()
            .filter(|r| r.state.current() == StateType::Retrying)
            .filter(|r| r.retry_at.is_none_or(|at| at <= now))
            .map(|r| r.id)
            .collect();
        for id in due {
            self.retry_due(flow, work, id, now)?;
        }
        Ok(())
    }

    /// Re-emits the listed attempts that are still current and CREATED.
    fn resend(&self, flow: &Flow, work: &mut Work, attempts: &[AttemptKey]) -> Result<(), ExecutorError> {
        if !matches!(
            work.execution.state.current(),
            StateType::Running | StateType::Paused
        ) {
            return Ok(());
        }

        for key in attempts {
            let pending = work.execution.find_task_run(key.task_run_id).is_some_and(|r| {
                r.state.current() == StateType::Created
                    && r.attempt_number() == key.attempt
                    && r.current_attempt()
                        .is_some_and(|a| a.state.current() == StateType::Created)
            });
            if !pending {
                debug!(
                    execution_id = %work.execution.id,
                    task_run_id = %key.task_run_id,
                    attempt = key.attempt,
                    "attempt moved on, resend skipped"
                );
                continue;
            }
            self.dispatch(flow, work, key.task_run_id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // resolution
    // ------------------------------------------------------------------

    /// Resolves containers (newest first) then the root until nothing moves.
    fn resolve(&self, flow: &Flow, work: &mut Work, now: DateTime<Utc>) -> Result<(), ExecutorError> {
        for _ in 0..self.max_resolution_passes {
            let mut progressed = false;

            let containers: Vec<TaskRunId> = work
                .execution
                .task_run_list
                .iter()
                .rev()
                .filter(|r| r.state.is_running())
                .filter(|r| flow.find_task(&r.task_id).is_some_and(Task::is_flowable))
                .map(|r| r.id)
                .collect();
            for id in containers {
                progressed |= self.resolve_container(flow, work, id, now)?;
            }

            match work.execution.state.current() {
                StateType::Killing => {
                    if work.execution.all_task_runs_terminated() {
                        work.transition(StateType::Killed, now)?;
                        info!(execution_id = %work.execution.id, "execution killed");
                        return Ok(());
                    }
                }
                StateType::Running => {
                    let evaluation = Resolver::new(flow, &work.execution, self.renderer.as_ref())
                        .resolve_root()
                        .map_err(|e| resolution(None, e))?;
                    if let Some(state) = evaluation.state {
                        work.transition(state, now)?;
                        info!(
                            execution_id = %work.execution.id,
                            flow_id = %flow.id,
                            %state,
                            "execution finished"
                        );
                        return Ok(());
                    }
                    for next in &evaluation.nexts {
                        progressed |= self.create(flow, work, next, now)?;
                    }
                }
                _ => return Ok(()),
            }

            if !progressed {
                return Ok(());
            }
        }
        Err(ExecutorError::Diverged(self.max_resolution_passes))
    }

    fn resolve_container(
        &self,
        flow: &Flow,
        work: &mut Work,
        id: TaskRunId,
        now: DateTime<Utc>,
    ) -> Result<bool, ExecutorError> {
        let run = work.run(id)?;

        if run.state.current() == StateType::Killing {
            if !work.execution.children_of(id).all(|c| c.state.is_terminated()) {
                return Ok(false);
            }
            work.update(run.with_state(StateType::Killed, now)?)?;
            debug!(execution_id = %work.execution.id, task_run_id = %id, task_id = %run.task_id, "container killed");
            return Ok(true);
        }

        let task = flow
            .find_task(&run.task_id)
            .ok_or_else(|| resolution(Some(id), ResolutionError::UnknownTask(run.task_id.clone())))?;
        let evaluation = Resolver::new(flow, &work.execution, self.renderer.as_ref())
            .resolve(task, &run)
            .map_err(|e| resolution(Some(id), e))?;

        if let Some(state) = evaluation.state {
            work.update(run.with_state(state, now)?)?;
            debug!(
                execution_id = %work.execution.id,
                task_run_id = %id,
                task_id = %run.task_id,
                %state,
                "container finished"
            );
            return Ok(true);
        }
        if work.execution.state.current() != StateType::Running {
            return Ok(false);
        }

        let mut progressed = false;
        for next in &evaluation.nexts {
            progressed |= self.create(flow, work, next, now)?;
        }
        Ok(progressed)
    }

    /// Instantiates a resolved position unless it already exists.
    fn create(
        &self,
        flow: &Flow,
        work: &mut Work,
        next: &ResolvedTask<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, ExecutorError> {
        if next.find_run(&work.execution).is_some() {
            return Ok(false);
        }

        let run = TaskRun::new(
            self.ids.generate_task_run_id(),
            work.execution.id,
            next.task.id.clone(),
            next.parent_task_run_id,
            next.value.clone(),
            now,
        );
        let id = run.id;

        if next.task.is_flowable() {
            work.append(run.with_state(StateType::Running, now)?)?;
            debug!(
                execution_id = %work.execution.id,
                task_run_id = %id,
                task_id = %next.task.id,
                value = ?next.value,
                "container started"
            );
        } else {
            work.append(run.with_new_attempt(now)?)?;
            self.dispatch(flow, work, id)?;
        }
        Ok(true)
    }

    /// Renders the leaf's properties and queues its current attempt.
    fn dispatch(&self, flow: &Flow, work: &mut Work, id: TaskRunId) -> Result<(), ExecutorError> {
        let run = work.run(id)?;
        let task = flow
            .find_task(&run.task_id)
            .ok_or_else(|| resolution(Some(id), ResolutionError::UnknownTask(run.task_id.clone())))?;
        let TaskKind::Runnable {
            task_type,
            properties,
        } = &task.kind
        else {
            return Err(resolution(Some(id), ResolutionError::NotRunnable(task.id.clone())));
        };

        self.registry
            .resolve(task_type)
            .map_err(|e| resolution(Some(id), e))?;
        let vars = render_context(flow, &work.execution, Some(&run));
        let definition = render_value(self.renderer.as_ref(), properties, &vars).map_err(|source| {
            resolution(
                Some(id),
                ResolutionError::Render {
                    task_id: task.id.clone(),
                    source,
                },
            )
        })?;

        let attempt = run.attempt_number();
        work.worker_tasks.push(WorkerTask {
            execution_id: work.execution.id,
            task_run_id: id,
            task_id: run.task_id.clone(),
            task_type: task_type.clone(),
            attempt,
            value: run.value.clone(),
            definition,
        });
        if let Some(timeout) = self.registry.effective_timeout(task) {
            work.timers.push(Timer {
                after: timeout,
                message: Inbound::TimeoutCheck {
                    execution_id: work.execution.id,
                    task_run_id: id,
                    attempt,
                },
            });
        }
        debug!(
            execution_id = %work.execution.id,
            task_run_id = %id,
            task_id = %run.task_id,
            %task_type,
            attempt,
            "task dispatched"
        );
        Ok(())
    }

    /// Fatal configuration error: the offending run FAILS, everything still
    /// open is KILLED and the execution FAILS with `diagnostic`.
    fn fail(
        &self,
        work: &mut Work,
        offending: Option<TaskRunId>,
        diagnostic: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ExecutorError> {
        error!(
            execution_id = %work.execution.id,
            task_run_id = ?offending,
            %diagnostic,
            "execution failed"
        );
        work.worker_tasks.clear();

        for id in work.non_terminated() {
            let run = work.run(id)?;
            let target = if Some(id) == offending {
                StateType::Failed
            } else {
                StateType::Killed
            };
            let mut ended = run.clone();
            if has_live_attempt(&run) {
                ended = ended.with_attempt_state(target, None, now)?;
                let kill = work.kill_for(&run);
                work.worker_kills.push(kill);
            }
            work.update(ended.ensure_state(target, now)?)?;
        }

        work.execution = work.execution.with_diagnostic(diagnostic);
        work.changed = true;
        if work.execution.state.current() == StateType::Paused {
            work.transition(StateType::Running, now)?;
        }
        if !work.execution.state.is_terminated() {
            work.transition(StateType::Failed, now)?;
        }
        Ok(())
    }
}
