//! チャネルベースの配送（同一プロセス内の worker / 購読者向け）

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::domain::execution::Execution;
use crate::domain::messages::{WorkerKill, WorkerMessage, WorkerTask};
use crate::ports::{DispatchError, ExecutionEventSink, WorkerDispatcher};

/// WorkerMessage を bounded mpsc に積む dispatcher
///
/// 送信は `try_send`。満杯なら `DispatchError::Full` を返し、
/// executor 側が RESEND タイマーで再送する。
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<WorkerMessage>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, message: WorkerMessage) -> Result<(), DispatchError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

#[async_trait]
impl WorkerDispatcher for ChannelDispatcher {
    async fn dispatch(&self, task: WorkerTask) -> Result<(), DispatchError> {
        self.send(WorkerMessage::Task(task))
    }

    async fn kill(&self, kill: WorkerKill) -> Result<(), DispatchError> {
        self.send(WorkerMessage::Kill(kill))
    }
}

/// 更新された execution を broadcast で配る
///
/// 購読者がいなくてもエラーにしない（誰も見ていないだけ）。
pub struct BroadcastEventSink {
    tx: broadcast::Sender<Execution>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Execution> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ExecutionEventSink for BroadcastEventSink {
    async fn publish(&self, execution: &Execution) -> Result<(), DispatchError> {
        // Err は「購読者ゼロ」のみ
        let _ = self.tx.send(execution.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::Flow;
    use crate::domain::ids::{ExecutionId, TaskRunId};
    use crate::domain::task::Task;
    use chrono::Utc;
    use serde_json::json;
    use ulid::Ulid;

    fn worker_task() -> WorkerTask {
        WorkerTask {
            execution_id: ExecutionId::from_ulid(Ulid::new()),
            task_run_id: TaskRunId::from_ulid(Ulid::new()),
            task_id: "a".into(),
            task_type: "noop".into(),
            attempt: 1,
            value: None,
            definition: json!({}),
        }
    }

    #[tokio::test]
    async fn full_channel_reports_full() {
        let (dispatcher, mut rx) = ChannelDispatcher::new(1);
        dispatcher.dispatch(worker_task()).await.unwrap();
        assert_eq!(dispatcher.dispatch(worker_task()).await, Err(DispatchError::Full));

        assert!(matches!(rx.recv().await, Some(WorkerMessage::Task(_))));
        dispatcher.dispatch(worker_task()).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let (dispatcher, rx) = ChannelDispatcher::new(4);
        drop(rx);
        let task = worker_task();
        let kill = WorkerKill {
            execution_id: task.execution_id,
            task_run_id: task.task_run_id,
            attempt: 1,
        };
        assert_eq!(dispatcher.kill(kill).await, Err(DispatchError::Closed));
    }

    #[tokio::test]
    async fn subscribers_receive_published_executions() {
        let sink = BroadcastEventSink::new(8);
        let flow = Flow::new("ns", "f", vec![Task::runnable("a", "noop")]);
        let execution = Execution::new(ExecutionId::from_ulid(Ulid::new()), &flow, Default::default(), Utc::now());

        // 購読者なしでも成功する
        sink.publish(&execution).await.unwrap();

        let mut rx = sink.subscribe();
        sink.publish(&execution).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, execution.id);
    }
}
