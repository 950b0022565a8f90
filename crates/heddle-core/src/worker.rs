//! Workers - WorkerTask を受け取って handler を実行する側
//!
//! - handler は task_type ごとに 1 つ（起動時に登録、実行中は immutable）
//! - inbox を読むのは 1 タスクだけ。handler は attempt ごとに spawn し、
//!   同時実行数は semaphore で `n` に抑える
//! - inbox の読み出しは handler を待たないので、全 slot が埋まっていても
//!   WorkerKill はすぐ処理される（abort して KILLED を返す）
//! - 実行中の (task_run_id, attempt) は重複排除する。終わった attempt の記録は捨てる

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::app::executor::ExecutorError;
use crate::app::executor_loop::ExecutorClient;
use crate::domain::errors::RegistryError;
use crate::domain::execution::TaskFailure;
use crate::domain::messages::{AttemptKey, WorkerKill, WorkerMessage, WorkerTask, WorkerTaskResult};
use crate::domain::state::StateType;

/// A handler for a specific task type.
///
/// `Ok(outputs)` ends the attempt as SUCCESS; `Err` as FAILED with the
/// failure's kind driving the retry decision.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &WorkerTask) -> Result<serde_json::Value, TaskFailure>;
}

/// Registry of handlers (task_type -> handler).
///
/// Built during initialization (mutable), used during runtime (immutable).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Where workers report results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn report(&self, result: WorkerTaskResult) -> Result<(), ExecutorError>;
}

#[async_trait]
impl ResultSink for ExecutorClient {
    async fn report(&self, result: WorkerTaskResult) -> Result<(), ExecutorError> {
        self.worker_result(result).await
    }
}

#[async_trait]
impl ResultSink for mpsc::Sender<WorkerTaskResult> {
    async fn report(&self, result: WorkerTaskResult) -> Result<(), ExecutorError> {
        self.send(result).await.map_err(|_| ExecutorError::Closed)
    }
}

/// Attempt bookkeeping, guarded by one lock so kills never race registration.
#[derive(Default)]
struct Attempts {
    /// 受け取って、まだ結果を返していない attempt
    seen: HashSet<AttemptKey>,
    in_flight: HashMap<AttemptKey, AbortHandle>,
    /// 届く前に kill された attempt
    killed: HashSet<AttemptKey>,
}

struct Shared {
    handlers: Arc<HandlerRegistry>,
    results: Arc<dyn ResultSink>,
    slots: Semaphore,
    attempts: Mutex<Attempts>,
}

impl Shared {
    async fn report(&self, result: WorkerTaskResult) {
        let task_run_id = result.task_run_id;
        if let Err(e) = self.results.report(result).await {
            warn!(%task_run_id, error = %e, "result not delivered");
        }
    }

    fn forget(&self, key: AttemptKey) {
        let mut attempts = lock(&self.attempts);
        attempts.in_flight.remove(&key);
        attempts.seen.remove(&key);
        attempts.killed.remove(&key);
    }
}

/// Worker group handle.
/// - `request_shutdown()` で新規受信を止める（実行中の handler は止めない）
/// - `shutdown_and_join()` で実行中の handler の終了まで待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl WorkerGroup {
    /// Serve `inbox` with at most `n` handlers running at once.
    pub fn spawn(
        n: usize,
        inbox: mpsc::Receiver<WorkerMessage>,
        handlers: Arc<HandlerRegistry>,
        results: Arc<dyn ResultSink>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            handlers,
            results,
            slots: Semaphore::new(n),
            attempts: Mutex::new(Attempts::default()),
        });

        let join = tokio::spawn(serve(Arc::clone(&shared), inbox, shutdown_rx));
        Self {
            shutdown_tx,
            join,
            shared,
        }
    }

    /// Attempts received and not yet reported, plus kills still waiting for their task.
    pub fn tracked(&self) -> usize {
        let attempts = lock(&self.shared.attempts);
        attempts.seen.len() + attempts.killed.len()
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for every running handler.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn serve(
    shared: Arc<Shared>,
    mut inbox: mpsc::Receiver<WorkerMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut running = JoinSet::new();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(_) = running.join_next(), if !running.is_empty() => {}
            message = inbox.recv() => match message {
                Some(WorkerMessage::Task(task)) => start_task(&shared, &mut running, task),
                Some(WorkerMessage::Kill(kill)) => kill_task(&shared, kill),
                // dispatcher が drop された
                None => break,
            },
        }
    }

    while running.join_next().await.is_some() {}
    debug!("worker group stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start_task(shared: &Arc<Shared>, running: &mut JoinSet<()>, task: WorkerTask) {
    let key = task.key();
    let mut attempts = lock(&shared.attempts);
    if !attempts.seen.insert(key) {
        debug!(task_run_id = %task.task_run_id, attempt = task.attempt, "duplicate task ignored");
        return;
    }

    let handler = match shared.handlers.get(&task.task_type) {
        _ if attempts.killed.remove(&key) => Err(WorkerTaskResult::for_task(&task, StateType::Killed)),
        Some(handler) => Ok(Arc::clone(handler)),
        None => {
            let failure = TaskFailure::permanent(format!("no handler for task_type={}", task.task_type));
            Err(WorkerTaskResult::for_task(&task, StateType::Failed).with_failure(failure))
        }
    };
    let handler = match handler {
        Ok(handler) => handler,
        Err(result) => {
            attempts.seen.remove(&key);
            drop(attempts);
            let shared = Arc::clone(shared);
            running.spawn(async move { shared.report(result).await });
            return;
        }
    };

    let attempt = tokio::spawn(run_attempt(Arc::clone(shared), handler, task.clone()));
    attempts.in_flight.insert(key, attempt.abort_handle());
    drop(attempts);

    let shared = Arc::clone(shared);
    running.spawn(async move {
        let outcome = attempt.await;
        shared.forget(key);

        let result = match outcome {
            Ok(Ok(outputs)) => WorkerTaskResult::for_task(&task, StateType::Success).with_outputs(outputs),
            Ok(Err(failure)) => WorkerTaskResult::for_task(&task, StateType::Failed).with_failure(failure),
            Err(e) if e.is_cancelled() => WorkerTaskResult::for_task(&task, StateType::Killed),
            Err(e) => WorkerTaskResult::for_task(&task, StateType::Failed)
                .with_failure(TaskFailure::permanent(format!("handler panicked: {e}"))),
        };
        debug!(task_run_id = %task.task_run_id, state = %result.state, "task finished");
        shared.report(result).await;
    });
}

/// Waits for a free slot, reports RUNNING and runs the handler.
async fn run_attempt(
    shared: Arc<Shared>,
    handler: Arc<dyn TaskHandler>,
    task: WorkerTask,
) -> Result<serde_json::Value, TaskFailure> {
    let _slot = shared
        .slots
        .acquire()
        .await
        .map_err(|_| TaskFailure::permanent("worker group closed"))?;

    shared
        .report(WorkerTaskResult::for_task(&task, StateType::Running))
        .await;
    info!(
        execution_id = %task.execution_id,
        task_run_id = %task.task_run_id,
        task_id = %task.task_id,
        attempt = task.attempt,
        "task started"
    );
    handler.handle(&task).await
}

fn kill_task(shared: &Shared, kill: WorkerKill) {
    let key = kill.key();
    let mut attempts = lock(&shared.attempts);
    if let Some(handle) = attempts.in_flight.get(&key) {
        handle.abort();
        info!(task_run_id = %kill.task_run_id, attempt = kill.attempt, "task aborted");
    } else if !attempts.seen.contains(&key) {
        attempts.killed.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{ExecutionId, TaskRunId};
    use serde_json::json;
    use std::time::Duration;
    use ulid::Ulid;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(&self, task: &WorkerTask) -> Result<serde_json::Value, TaskFailure> {
            Ok(task.definition.clone())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _task: &WorkerTask) -> Result<serde_json::Value, TaskFailure> {
            Err(TaskFailure::transient("boom"))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn handle(&self, _task: &WorkerTask) -> Result<serde_json::Value, TaskFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        }
    }

    struct PendingHandler;

    #[async_trait]
    impl TaskHandler for PendingHandler {
        async fn handle(&self, _task: &WorkerTask) -> Result<serde_json::Value, TaskFailure> {
            std::future::pending().await
        }
    }

    fn kill_of(task: &WorkerTask) -> WorkerMessage {
        WorkerMessage::Kill(WorkerKill {
            execution_id: task.execution_id,
            task_run_id: task.task_run_id,
            attempt: task.attempt,
        })
    }

    async fn next_result(results: &mut mpsc::Receiver<WorkerTaskResult>) -> WorkerTaskResult {
        tokio::time::timeout(Duration::from_secs(2), results.recv())
            .await
            .expect("no result within 2s")
            .unwrap()
    }

    fn pending_group() -> (
        WorkerGroup,
        mpsc::Sender<WorkerMessage>,
        mpsc::Receiver<WorkerTaskResult>,
    ) {
        let mut handlers = HandlerRegistry::new();
        handlers.register("pending", Arc::new(PendingHandler)).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let (results_tx, results_rx) = mpsc::channel(16);
        let group = WorkerGroup::spawn(1, rx, Arc::new(handlers), Arc::new(results_tx));
        (group, tx, results_rx)
    }

    fn task(task_type: &str) -> WorkerTask {
        WorkerTask {
            execution_id: ExecutionId::from_ulid(Ulid::new()),
            task_run_id: TaskRunId::from_ulid(Ulid::new()),
            task_id: "t".into(),
            task_type: task_type.into(),
            attempt: 1,
            value: None,
            definition: json!({ "msg": "hi" }),
        }
    }

    fn group() -> (
        WorkerGroup,
        mpsc::Sender<WorkerMessage>,
        mpsc::Receiver<WorkerTaskResult>,
    ) {
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", Arc::new(EchoHandler)).unwrap();
        handlers.register("fail", Arc::new(FailingHandler)).unwrap();
        handlers.register("slow", Arc::new(SlowHandler)).unwrap();

        let (tx, rx) = mpsc::channel(16);
        let (results_tx, results_rx) = mpsc::channel(16);
        let group = WorkerGroup::spawn(2, rx, Arc::new(handlers), Arc::new(results_tx));
        (group, tx, results_rx)
    }

    #[test]
    fn registry_rejects_duplicate_handlers() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", Arc::new(EchoHandler)).unwrap();
        let err = handlers.register("echo", Arc::new(EchoHandler)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler("echo".into()));
        assert_eq!(handlers.len(), 1);
    }

    #[tokio::test]
    async fn reports_running_then_success_with_outputs() {
        let (group, tx, mut results) = group();
        tx.send(WorkerMessage::Task(task("echo"))).await.unwrap();

        assert_eq!(results.recv().await.unwrap().state, StateType::Running);
        let done = results.recv().await.unwrap();
        assert_eq!(done.state, StateType::Success);
        assert_eq!(done.outputs, json!({ "msg": "hi" }));
        assert_eq!(group.tracked(), 0);
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn handler_error_is_a_failed_result() {
        let (group, tx, mut results) = group();
        tx.send(WorkerMessage::Task(task("fail"))).await.unwrap();

        results.recv().await.unwrap();
        let done = results.recv().await.unwrap();
        assert_eq!(done.state, StateType::Failed);
        assert_eq!(done.failure.unwrap().message, "boom");
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn missing_handler_fails_permanently() {
        let (group, tx, mut results) = group();
        tx.send(WorkerMessage::Task(task("nope"))).await.unwrap();

        let done = results.recv().await.unwrap();
        assert_eq!(done.state, StateType::Failed);
        assert_eq!(done.failure.unwrap().kind, crate::domain::errors::ErrorKind::Permanent);
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn duplicate_attempt_runs_once() {
        let (group, tx, mut results) = group();
        let t = task("echo");
        tx.send(WorkerMessage::Task(t.clone())).await.unwrap();
        tx.send(WorkerMessage::Task(t.clone())).await.unwrap();
        let mut next = t.clone();
        next.attempt = 2;
        tx.send(WorkerMessage::Task(next)).await.unwrap();

        let mut finished = Vec::new();
        while finished.len() < 2 {
            let r = results.recv().await.unwrap();
            if r.state == StateType::Success {
                finished.push(r.attempt);
            }
        }
        finished.sort();
        assert_eq!(finished, vec![1, 2]);

        // no third completion sneaks in
        let extra = tokio::time::timeout(Duration::from_millis(50), results.recv()).await;
        assert!(extra.is_err());
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn kill_aborts_running_handler() {
        let (group, tx, mut results) = group();
        let t = task("slow");
        tx.send(WorkerMessage::Task(t.clone())).await.unwrap();
        assert_eq!(results.recv().await.unwrap().state, StateType::Running);
        tx.send(kill_of(&t)).await.unwrap();

        let done = results.recv().await.unwrap();
        assert_eq!(done.state, StateType::Killed);
        assert_eq!(group.tracked(), 0);
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn kill_is_served_while_every_slot_is_busy() {
        let (group, tx, mut results) = pending_group();
        let busy = task("pending");
        let queued = task("pending");
        tx.send(WorkerMessage::Task(busy.clone())).await.unwrap();
        tx.send(WorkerMessage::Task(queued.clone())).await.unwrap();

        let started = next_result(&mut results).await;
        assert_eq!((started.task_run_id, started.state), (busy.task_run_id, StateType::Running));

        tx.send(kill_of(&busy)).await.unwrap();
        // the freed slot goes to the queued task
        let mut got = vec![next_result(&mut results).await, next_result(&mut results).await]
            .into_iter()
            .map(|r| (r.task_run_id, r.state))
            .collect::<Vec<_>>();
        got.sort();
        let mut expected = vec![
            (busy.task_run_id, StateType::Killed),
            (queued.task_run_id, StateType::Running),
        ];
        expected.sort();
        assert_eq!(got, expected);

        tx.send(kill_of(&queued)).await.unwrap();
        assert_eq!(next_result(&mut results).await.state, StateType::Killed);
        assert_eq!(group.tracked(), 0);
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn queued_task_is_killed_without_waiting_for_a_slot() {
        let (group, tx, mut results) = pending_group();
        let busy = task("pending");
        let queued = task("pending");
        tx.send(WorkerMessage::Task(busy.clone())).await.unwrap();
        tx.send(WorkerMessage::Task(queued.clone())).await.unwrap();
        assert_eq!(next_result(&mut results).await.task_run_id, busy.task_run_id);

        tx.send(kill_of(&queued)).await.unwrap();
        let done = next_result(&mut results).await;
        assert_eq!((done.task_run_id, done.state), (queued.task_run_id, StateType::Killed));

        tx.send(kill_of(&busy)).await.unwrap();
        assert_eq!(next_result(&mut results).await.state, StateType::Killed);
        group.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn kill_before_start_reports_killed() {
        let (tx, rx) = mpsc::channel(16);
        let (results_tx, mut results) = mpsc::channel(16);
        let t = task("echo");
        tx.send(kill_of(&t)).await.unwrap();
        tx.send(WorkerMessage::Task(t)).await.unwrap();

        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", Arc::new(EchoHandler)).unwrap();
        let group = WorkerGroup::spawn(1, rx, Arc::new(handlers), Arc::new(results_tx));

        assert_eq!(results.recv().await.unwrap().state, StateType::Killed);
        assert_eq!(group.tracked(), 0);
        group.shutdown_and_join().await;
    }
}
