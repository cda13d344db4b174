use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use governor_agent::agent::{Agent, EXIT_GRACEFUL};
use governor_agent::config::AgentConfig;
use governor_agent::engine::{EngineDefinition, MemoryBroker, Task};
use governor_agent::job::{InquirePolicy, JobSpec, WorkerUtils, worker_fn};
use governor_agent::status::spawn_status_server;

const DEMO_ENGINE: &str = "memory";
const DEMO_JOB: &str = "echo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_guard = init_tracing();

    let config = AgentConfig::from_env();

    eprintln!("🛰  Governor agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Directory: http://{}/api/nodes",
        config.directory_host().unwrap_or("(unset)")
    );
    match config.status_port {
        Some(port) => eprintln!("   Status: http://0.0.0.0:{port}/api/status"),
        None => eprintln!("   Status: disabled"),
    }
    eprintln!("   Each stdin line is published as a task to job '{DEMO_JOB}'.\n");

    // ── Engines & jobs ──────────────────────────────────────────────────
    let broker = MemoryBroker::new();
    let agent = Agent::new(
        config,
        vec![EngineDefinition::new(DEMO_ENGINE, Arc::new(broker.clone()))],
    )
    .context("Failed to create agent")?;

    let job = JobSpec::new(
        DEMO_JOB,
        DEMO_ENGINE,
        worker_fn(|task: Task, utils: WorkerUtils| async move {
            info!(job = %utils.job(), task_id = %utils.task_id(), task = %task, "Echo");
            Ok(())
        }),
    )
    .with_inquire(InquirePolicy::keyed(true, |task: &Task| {
        task.get("lock").cloned().unwrap_or_else(|| json!([]))
    }));
    agent
        .consume(job)
        .await
        .context("Failed to register demo job")?;

    // ── Status surface ──────────────────────────────────────────────────
    if let Some(port) = agent.config().status_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let (_addr, _server) = spawn_status_server(Arc::clone(&agent), addr)
            .await
            .with_context(|| format!("Failed to bind status server on {addr}"))?;
    }

    // ── Task input ──────────────────────────────────────────────────────
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let task = serde_json::from_str(&line).unwrap_or(Value::String(line));
                    broker.publish(DEMO_JOB, task);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });

    // ── Signals ─────────────────────────────────────────────────────────
    {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down...");
                agent.shutdown(EXIT_GRACEFUL);
            }
        });
    }

    let outcome = agent.run().await;

    drop(log_guard);
    std::process::exit(outcome.code);
}

/// Install the global subscriber. Logs go to stdout, or to a daily file
/// under `GOVERNOR_LOG_DIR` when set.
fn init_tracing() -> WorkerGuard {
    let log_dir = std::env::var("GOVERNOR_LOG_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty());
    let to_file = log_dir.is_some();

    let (writer, guard) = match log_dir {
        Some(dir) => {
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "governor-agent.log"))
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_ansi(!to_file)
        .with_writer(writer)
        .init();

    guard
}
