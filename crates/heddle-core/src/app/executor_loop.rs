//! ExecutorLoop - partition ごとの評価ループ
//!
//! # 学習ポイント
//! - execution id のハッシュで partition を選ぶ（同一 execution は常に直列）
//! - watch チャネルによる shutdown 通知
//! - タイマーは sleep してから自分の inbox に戻すだけ
//!
//! # activation の流れ
//! 1. execution を読む（ExecutionChanged はまず保存）
//! 2. flow を読む（無ければ execution を FAILED に）
//! 3. `Executor::process`
//! 4. 変更があれば保存 → publish
//! 5. WorkerTask / WorkerKill を送る（送れなかった attempt は RESEND を予約）
//! 6. タイマーを起動
//!
//! 一時的なエラーはその場で `redelivery_delay` 待って同じメッセージをやり直す
//! （最大 `max_redeliveries` 回）。やり直しの間 partition は次のメッセージを
//! 読まないので、同じ execution への到着順は崩れない。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::config::{ConfigError, ExecutorConfig};
use crate::app::executor::{Activation, Executor, ExecutorError};
use crate::domain::execution::Execution;
use crate::domain::ids::ExecutionId;
use crate::domain::messages::{ExecutionKillRequest, Inbound, WorkerTaskResult};
use crate::ports::{ExecutionEventSink, ExecutionRepository, FlowRepository, WorkerDispatcher};

/// ループが使うコラボレータ一式
#[derive(Clone)]
pub struct ExecutorDeps {
    pub executor: Arc<Executor>,
    pub flows: Arc<dyn FlowRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub dispatcher: Arc<dyn WorkerDispatcher>,
    pub events: Arc<dyn ExecutionEventSink>,
}

/// Sends messages into the loop, routed by execution id.
#[derive(Clone)]
pub struct ExecutorClient {
    senders: Arc<Vec<mpsc::Sender<Inbound>>>,
}

impl ExecutorClient {
    fn partition_of(&self, execution_id: ExecutionId) -> usize {
        let mut hasher = DefaultHasher::new();
        execution_id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    async fn send(&self, message: Inbound) -> Result<(), ExecutorError> {
        let partition = self.partition_of(message.execution_id());
        self.senders[partition]
            .send(message)
            .await
            .map_err(|_| ExecutorError::Closed)
    }

    /// Starts (or replaces) an execution.
    pub async fn submit(&self, execution: Execution) -> Result<(), ExecutorError> {
        self.send(Inbound::ExecutionChanged { execution }).await
    }

    pub async fn worker_result(&self, result: WorkerTaskResult) -> Result<(), ExecutorError> {
        self.send(Inbound::WorkerTaskResult(result)).await
    }

    pub async fn kill(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.send(Inbound::Kill(ExecutionKillRequest { execution_id }))
            .await
    }

    pub async fn restart(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.send(Inbound::Restart { execution_id }).await
    }

    pub async fn pause(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.send(Inbound::Pause { execution_id }).await
    }

    pub async fn resume(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.send(Inbound::Resume { execution_id }).await
    }
}

/// Running loop handle.
/// - `shutdown()` で全 partition を止めて join する
/// - 停止後の送信は `ExecutorError::Closed`
pub struct ExecutorHandle {
    client: ExecutorClient,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl ExecutorHandle {
    pub fn client(&self) -> ExecutorClient {
        self.client.clone()
    }

    pub async fn submit(&self, execution: Execution) -> Result<(), ExecutorError> {
        self.client.submit(execution).await
    }

    pub async fn worker_result(&self, result: WorkerTaskResult) -> Result<(), ExecutorError> {
        self.client.worker_result(result).await
    }

    pub async fn kill(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.client.kill(execution_id).await
    }

    pub async fn restart(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.client.restart(execution_id).await
    }

    pub async fn pause(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.client.pause(execution_id).await
    }

    pub async fn resume(&self, execution_id: ExecutionId) -> Result<(), ExecutorError> {
        self.client.resume(execution_id).await
    }

    /// Request shutdown and wait for every partition.
    pub async fn shutdown(self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            let _ = join.await;
        }
        info!("executor loop stopped");
    }
}

pub struct ExecutorLoop;

impl ExecutorLoop {
    /// Spawns one evaluation task per partition.
    pub fn start(config: ExecutorConfig, deps: ExecutorDeps) -> Result<ExecutorHandle, ConfigError> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut senders = Vec::with_capacity(config.partitions);
        let mut inboxes = Vec::with_capacity(config.partitions);
        for _ in 0..config.partitions {
            let (tx, rx) = mpsc::channel(config.inbound_capacity);
            senders.push(tx);
            inboxes.push(rx);
        }
        let client = ExecutorClient {
            senders: Arc::new(senders),
        };

        let joins = inboxes
            .into_iter()
            .enumerate()
            .map(|(index, inbox)| {
                let partition = Partition {
                    index,
                    inbox,
                    client: client.clone(),
                    deps: deps.clone(),
                    config: config.clone(),
                };
                tokio::spawn(partition.run(shutdown_rx.clone()))
            })
            .collect();

        info!(partitions = config.partitions, "executor loop started");
        Ok(ExecutorHandle {
            client,
            shutdown_tx,
            joins,
        })
    }
}

struct Partition {
    index: usize,
    inbox: mpsc::Receiver<Inbound>,
    client: ExecutorClient,
    deps: ExecutorDeps,
    config: ExecutorConfig,
}

impl Partition {
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let message = tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender が drop されたら止める
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                message = self.inbox.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            self.handle(&message, &shutdown_rx).await;
        }
        debug!(partition = self.index, "partition stopped");
    }

    /// Activates `message`, retrying transient failures in place.
    async fn handle(&self, message: &Inbound, shutdown_rx: &watch::Receiver<bool>) {
        let execution_id = message.execution_id();
        let inbound = message.name();
        let mut redeliveries = 0u32;

        loop {
            let err = match self.activate(message).await {
                Ok(()) => return,
                Err(err) => err,
            };
            if !err.kind().is_retryable() || redeliveries >= self.config.max_redeliveries {
                error!(
                    partition = self.index,
                    %execution_id,
                    inbound,
                    redeliveries,
                    error = %err,
                    "activation failed, message dropped"
                );
                return;
            }
            if *shutdown_rx.borrow() {
                warn!(partition = self.index, %execution_id, inbound, error = %err, "activation failed during shutdown");
                return;
            }

            redeliveries += 1;
            warn!(
                partition = self.index,
                %execution_id,
                inbound,
                redelivery = redeliveries,
                error = %err,
                "activation failed, retrying"
            );
            tokio::time::sleep(self.config.redelivery_delay()).await;
        }
    }

    async fn activate(&self, message: &Inbound) -> Result<(), ExecutorError> {
        let execution = match message {
            Inbound::ExecutionChanged { execution } => {
                self.deps.executions.save(execution).await?;
                execution.clone()
            }
            other => {
                let execution_id = other.execution_id();
                self.deps
                    .executions
                    .find_by_id(execution_id)
                    .await?
                    .ok_or(ExecutorError::ExecutionNotFound(execution_id))?
            }
        };

        let flow = self
            .deps
            .flows
            .find_by_id(
                &execution.namespace,
                &execution.flow_id,
                Some(execution.flow_revision),
            )
            .await?;
        let activation = match flow {
            Some(flow) => self.deps.executor.process(&flow, &execution, message)?,
            None => self.deps.executor.fail_execution(
                &execution,
                &format!(
                    "flow {}.{} revision {} not found",
                    execution.namespace, execution.flow_id, execution.flow_revision
                ),
            )?,
        };
        self.apply(activation).await
    }

    async fn apply(&self, activation: Activation) -> Result<(), ExecutorError> {
        let Activation {
            execution,
            changed,
            worker_tasks,
            worker_kills,
            timers,
        } = activation;

        // 保存が先。結果が届いたとき必ず TaskRun が見えるように
        if changed {
            self.deps.executions.save(&execution).await?;
            if let Err(err) = self.deps.events.publish(&execution).await {
                warn!(execution_id = %execution.id, error = %err, "execution event not published");
            }
        }

        let mut undelivered = Vec::new();
        for task in worker_tasks {
            let key = task.key();
            if let Err(err) = self.deps.dispatcher.dispatch(task).await {
                undelivered.push(key);
                warn!(
                    execution_id = %execution.id,
                    task_run_id = %key.task_run_id,
                    attempt = key.attempt,
                    error = %err,
                    "worker task not delivered"
                );
            }
        }
        for kill in worker_kills {
            if let Err(err) = self.deps.dispatcher.kill(kill).await {
                warn!(execution_id = %execution.id, task_run_id = %kill.task_run_id, error = %err, "worker kill not delivered");
            }
        }
        if !undelivered.is_empty() {
            self.schedule(
                self.config.resend_delay(),
                Inbound::Resend {
                    execution_id: execution.id,
                    attempts: undelivered,
                },
            );
        }

        for timer in timers {
            self.schedule(timer.after, timer.message);
        }
        Ok(())
    }

    fn schedule(&self, after: Duration, message: Inbound) {
        let client = self.client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let inbound = message.name();
            if let Err(err) = client.send(message).await {
                debug!(inbound, error = %err, "timer fired after shutdown");
            }
        });
    }
}
