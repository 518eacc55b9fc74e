//! Console entry point: one local chat session over the agent core.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

use hearth::AGENT_VERSION;
use hearth::config::Config;
use hearth::llm::LlamaServerClient;
use hearth::orchestrator::{ResponseComposer, Worker};
use hearth::queue::TaskQueue;
use hearth::session::{self, SessionManager};
use hearth::store::types::{ExternalSource, TaskStatus};
use hearth::store::{LibSqlStore, Store};
use hearth::vector::DisabledVectorIndex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;
    let _log_guard = init_tracing(&config)?;
    info!(version = AGENT_VERSION, "hearth starting");

    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(&config.database_path)
            .await
            .context("opening database")?,
    );
    session::bootstrap(store.as_ref()).await?;

    // Settle whatever the previous process left behind before workers start.
    let stale_sessions = store.close_stale_sessions().await?;
    let queue = TaskQueue::new(store.clone());
    let (orphan_tasks, orphan_steps) = queue.recover_orphans().await?;
    info!(stale_sessions, orphan_tasks, orphan_steps, "Startup recovery finished");

    let backend = Arc::new(LlamaServerClient::new(&config.llm)?);
    let composer = Arc::new(ResponseComposer::new(
        store.clone(),
        backend,
        Arc::new(DisabledVectorIndex),
        config.llm.clone(),
        config.context_window,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::with_capacity(config.worker_count);
    for index in 0..config.worker_count {
        let worker = Worker::new(
            index,
            TaskQueue::new(store.clone()),
            composer.clone(),
            Duration::from_millis(config.poll_interval_ms),
        );
        workers.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    let console = console_loop(store.clone());
    tokio::select! {
        result = console => result?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            info!("Interrupt received");
        }
    }

    shutdown_tx.send(true).ok();
    for handle in workers {
        handle.await.ok();
    }
    info!("hearth stopped");
    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir).context("creating log directory")?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "hearth.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(guard)
}

/// Read lines from stdin, enqueue each as a message, and print the agent's
/// reply once its task settles.
async fn console_loop(store: Arc<dyn Store>) -> anyhow::Result<()> {
    let external_id = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    let mut manager = SessionManager::new(store.clone(), ExternalSource::Console).await?;
    manager.link_identity(&external_id).await?;
    manager.open_session().await?;
    println!("hearth {AGENT_VERSION} — type a message, or /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break; // EOF
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        let (_, task) = manager.save_incoming(text, 0.5).await?;
        match wait_for_reply(store.as_ref(), task.id).await? {
            Some(reply) => println!("hearth> {reply}"),
            None => println!("hearth> (no answer: task failed, see logs)"),
        }
    }

    manager.close().await?;
    Ok(())
}

/// Poll a task until it settles, then resolve its reply text.
async fn wait_for_reply(store: &dyn Store, task_id: Uuid) -> anyhow::Result<Option<String>> {
    loop {
        let Some(task) = store.get_task(task_id).await? else {
            return Ok(None);
        };
        match task.status {
            TaskStatus::Completed => {
                let reply_id = task
                    .output
                    .as_ref()
                    .and_then(|o| o.get("reply_id"))
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok());
                let Some(reply_id) = reply_id else {
                    return Ok(None);
                };
                let reply = store.get_message(reply_id).await?;
                return Ok(reply.map(|m| m.text));
            }
            TaskStatus::Failed => return Ok(None),
            TaskStatus::Pending | TaskStatus::Running => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
