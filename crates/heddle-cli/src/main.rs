//! heddle - runs one flow execution against in-process workers.
//!
//! flow 定義（JSON）を読み込み、executor loop と worker group を起動して
//! execution が終端に達するまで待ち、最終 status を JSON で出力する。

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use heddle_core::app::{ExecutionStatus, ExecutorBuilder, ExecutorConfig};
use heddle_core::domain::{Execution, Flow, StateType, TaskFailure, TaskTypeDescriptor, WorkerTask};
use heddle_core::impls::{
    BroadcastEventSink, ChannelDispatcher, InMemoryExecutionRepository, InMemoryFlowRepository,
};
use heddle_core::ports::{Clock, ExecutionRepository, IdGenerator};
use heddle_core::worker::{HandlerRegistry, TaskHandler, WorkerGroup};

/// Heddle flow executor.
#[derive(Parser)]
#[command(name = "heddle")]
#[command(about = "Run a flow definition against in-process workers")]
#[command(version)]
struct Cli {
    /// Flow definition (JSON)
    #[arg(short, long)]
    flow: PathBuf,

    /// Executor configuration (TOML)
    #[arg(short, long, env = "HEDDLE_CONFIG")]
    config: Option<PathBuf>,

    /// Execution input, `key=value` (value parsed as JSON, else taken as a string)
    #[arg(short, long = "input", value_parser = parse_input)]
    inputs: Vec<(String, Value)>,

    /// Number of workers
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Make the demo handler fail for this task id (repeatable)
    #[arg(long = "fail")]
    failing: Vec<String>,

    /// Give up (and kill the execution) after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty input name in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Demo handler properties.
#[derive(Debug, Default, Deserialize)]
struct DemoProperties {
    #[serde(default)]
    sleep_ms: u64,
}

/// Echoes the rendered definition back as outputs.
struct DemoHandler {
    failing: HashSet<String>,
}

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(&self, task: &WorkerTask) -> Result<Value, TaskFailure> {
        let props: DemoProperties = serde_json::from_value(task.definition.clone()).unwrap_or_default();
        if props.sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(props.sleep_ms)).await;
        }

        if self.failing.contains(&task.task_id) {
            return Err(TaskFailure::transient(format!(
                "{} failed on purpose (attempt {})",
                task.task_id, task.attempt
            )));
        }

        info!(task_id = %task.task_id, value = ?task.value, attempt = task.attempt, "demo task done");
        Ok(json!({
            "task_id": task.task_id,
            "value": task.value,
            "definition": task.definition,
        }))
    }
}

fn init_tracing() {
    // stdout は status JSON 用なのでログは stderr へ
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_flow(path: &Path) -> Result<Flow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read flow {}", path.display()))?;
    let flow: Flow = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse flow {}", path.display()))?;
    flow.validate()
        .with_context(|| format!("invalid flow {}", path.display()))?;
    Ok(flow)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    if cli.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let flow = load_flow(&cli.flow)?;
    let config = match &cli.config {
        Some(path) => ExecutorConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ExecutorConfig::default(),
    };
    let inputs = flow.resolve_inputs(cli.inputs.into_iter().collect::<BTreeMap<_, _>>())?;

    // (A) ports
    let flows = Arc::new(InMemoryFlowRepository::new());
    flows.insert(flow.clone()).await?;
    let executions = Arc::new(InMemoryExecutionRepository::new());
    let (dispatcher, inbox) = ChannelDispatcher::new(config.inbound_capacity);
    let events = Arc::new(BroadcastEventSink::new(256));
    let mut updates = events.subscribe();

    // (B) flow が使う task type をすべて demo handler に割り当てる
    let task_types = flow.task_types();
    let demo: Arc<dyn TaskHandler> = Arc::new(DemoHandler {
        failing: cli.failing.iter().cloned().collect(),
    });
    let mut handlers = HandlerRegistry::new();
    let mut builder = ExecutorBuilder::new(flows, executions.clone(), Arc::new(dispatcher), events)
        .config(config);
    for task_type in &task_types {
        builder = builder.register(TaskTypeDescriptor::new(*task_type))?;
        handlers.register(*task_type, Arc::clone(&demo))?;
    }
    let app = builder
        .expect_task_types(&task_types.iter().copied().collect::<Vec<_>>())
        .build()?;

    let clock = Arc::clone(app.executor().clock());
    let execution = Execution::new(
        app.executor().ids().generate_execution_id(),
        &flow,
        inputs,
        clock.now(),
    );
    let execution_id = execution.id;

    // (C) executor loop と worker を起動
    let handle = app.start()?;
    let workers = WorkerGroup::spawn(
        cli.workers,
        inbox,
        Arc::new(handlers),
        Arc::new(handle.client()),
    );

    info!(%execution_id, flow_id = %flow.id, namespace = %flow.namespace, "submitting execution");
    handle.submit(execution).await?;

    // (D) 終端まで待つ（Ctrl-C / timeout で kill）
    let deadline = tokio::time::sleep(Duration::from_secs(cli.timeout_secs));
    tokio::pin!(deadline);
    let mut kill_sent = false;
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(e) if e.id == execution_id && e.state.is_terminated() => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                    let latest = executions.find_by_id(execution_id).await?;
                    if latest.is_some_and(|e| e.state.is_terminated()) {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c(), if !kill_sent => {
                warn!(%execution_id, "interrupted, killing execution");
                handle.kill(execution_id).await?;
                kill_sent = true;
            }
            _ = &mut deadline => {
                if kill_sent {
                    warn!(%execution_id, "execution did not terminate in time");
                    break;
                }
                warn!(%execution_id, timeout_secs = cli.timeout_secs, "timed out, killing execution");
                handle.kill(execution_id).await?;
                kill_sent = true;
                deadline
                    .as_mut()
                    .reset(tokio::time::Instant::now() + Duration::from_secs(cli.timeout_secs));
            }
        }
    }

    // (E) 後片付け
    workers.shutdown_and_join().await;
    handle.shutdown().await;

    let execution = executions
        .find_by_id(execution_id)
        .await?
        .with_context(|| format!("execution {execution_id} was never saved"))?;
    let status = ExecutionStatus::of(&execution, clock.now());
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(match status.state {
        StateType::Success | StateType::Warning => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use heddle_core::ports::{SystemClock, UlidGenerator};

    #[test]
    fn inputs_parse_as_json_or_fall_back_to_strings() {
        assert_eq!(parse_input("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(
            parse_input("items=[\"a\",\"b\"]").unwrap(),
            ("items".to_string(), json!(["a", "b"]))
        );
        assert_eq!(
            parse_input("name=kim").unwrap(),
            ("name".to_string(), json!("kim"))
        );
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=x").is_err());
    }

    #[tokio::test]
    async fn demo_handler_echoes_or_fails_on_request() {
        let handler = DemoHandler {
            failing: HashSet::from(["bad".to_string()]),
        };
        let ids = UlidGenerator::new(SystemClock);
        let task = |task_id: &str| WorkerTask {
            execution_id: ids.generate_execution_id(),
            task_run_id: ids.generate_task_run_id(),
            task_id: task_id.to_string(),
            task_type: "demo".to_string(),
            attempt: 1,
            value: None,
            definition: json!({ "text": "hi" }),
        };

        let outputs = handler.handle(&task("good")).await.unwrap();
        assert_eq!(outputs["definition"], json!({ "text": "hi" }));
        assert!(handler.handle(&task("bad")).await.is_err());
    }
}
