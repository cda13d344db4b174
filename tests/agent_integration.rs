//! Integration tests for the agent against a fake governor master.
//!
//! Each test spins up an Axum `/api/nodes` directory and a tokio-tungstenite
//! master on random ports, then drives a real `Agent` with the in-memory
//! engine through startup, task processing, reconnects and shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{Json, Router, http::StatusCode, routing::get};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use governor_agent::agent::{
    Agent, EXIT_CLUSTER_UNREACHABLE, EXIT_ENGINE_ERROR, EXIT_GRACEFUL, ShutdownOutcome,
};
use governor_agent::cluster::{ClusterSession, SessionState};
use governor_agent::config::{
    AgentConfig, BackpressureConfig, DiscoveryConfig, SessionConfig, ShutdownConfig,
};
use governor_agent::engine::{
    ConsumerControl, Engine, EngineContext, EngineDefinition, EngineFactory, MemoryBroker,
    TaskHandler,
};
use governor_agent::error::EngineError;
use governor_agent::job::{InquirePolicy, JobSpec, WorkerUtils, worker_fn};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Calls = Arc<Mutex<Vec<(String, Value)>>>;

/// Fake master: records every call and answers per its knobs.
#[derive(Clone, Default)]
struct FakeMaster {
    directory: String,
    calls: Calls,
    paths: Arc<Mutex<Vec<String>>>,
    /// Number of upcoming `handle-locks` calls to refuse.
    deny: Arc<AtomicUsize>,
    /// Number of upcoming connections to drop right after `identify`.
    drop_after_identify: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
    directory_hits: Arc<AtomicUsize>,
    /// After the first lookup, answer `/api/nodes` only after 500ms.
    slow_directory: Arc<AtomicBool>,
    /// After the first lookup, answer `/api/nodes` with 503.
    failing_directory: Arc<AtomicBool>,
}

impl FakeMaster {
    fn events(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    fn calls_for(&self, event: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn count(&self, event: &str) -> usize {
        self.calls_for(event).len()
    }
}

/// Start the directory and the master socket.
async fn start_master() -> FakeMaster {
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_port = ws_listener.local_addr().unwrap().port();

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master = FakeMaster {
        directory: http_listener.local_addr().unwrap().to_string(),
        ..FakeMaster::default()
    };

    // The standby entry has no port; only the master entry must be complete.
    let nodes = json!([
        {"hostname": "standby", "master": false},
        {"hostname": "127.0.0.1", "port": ws_port.to_string(), "master": true}
    ]);
    let directory = master.clone();
    let app = Router::new().route(
        "/api/nodes",
        get(move || {
            let directory = directory.clone();
            let nodes = nodes.clone();
            async move {
                let n = directory.directory_hits.fetch_add(1, Ordering::SeqCst) + 1;
                if n > 1 && directory.failing_directory.load(Ordering::SeqCst) {
                    return Err(StatusCode::SERVICE_UNAVAILABLE);
                }
                if n > 1 && directory.slow_directory.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(Json(nodes))
            }
        }),
    );
    tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap();
    });

    let accept = master.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = ws_listener.accept().await {
            tokio::spawn(serve_connection(stream, accept.clone()));
        }
    });

    master
}

async fn serve_connection(stream: TcpStream, master: FakeMaster) {
    let paths = Arc::clone(&master.paths);
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        paths.lock().unwrap().push(req.uri().path().to_string());
        Ok(resp)
    };
    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut tx, mut rx) = ws.split();

    while let Some(Ok(msg)) = rx.next().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        let event = frame["event"].as_str().unwrap().to_string();
        let payload = frame["payload"].clone();
        master.calls.lock().unwrap().push((event.clone(), payload));

        let reply = match event.as_str() {
            "handle-locks" => {
                let denied = master
                    .deny
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if denied {
                    json!({"ok": false})
                } else {
                    let n = master.runs.fetch_add(1, Ordering::SeqCst) + 1;
                    json!({"ok": true, "id": format!("run-{n}")})
                }
            }
            _ => json!({}),
        };

        let ack = json!({"type": "ack", "id": frame["id"], "payload": reply});
        if tx.send(Message::Text(ack.to_string().into())).await.is_err() {
            return;
        }

        if event == "identify"
            && master
                .drop_after_identify
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            let _ = tx.send(Message::Close(None)).await;
            return;
        }
    }
}

fn config(directory: &str) -> AgentConfig {
    AgentConfig {
        identify_host: Some(directory.to_string()),
        discovery: DiscoveryConfig {
            initial_delay: Duration::from_millis(1),
            retry_delay: Duration::from_millis(10),
            max_retries: 2,
            no_master_delay: Duration::from_millis(10),
            http_timeout: Duration::from_secs(1),
        },
        session: SessionConfig {
            reconnect_delay: Duration::from_millis(20),
            rpc_timeout: Duration::from_secs(2),
        },
        backpressure: BackpressureConfig {
            tick: Duration::from_millis(50),
            window: Duration::from_secs(60),
            initial_delay: Duration::ZERO,
        },
        shutdown: ShutdownConfig {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(20),
        },
        ..AgentConfig::default()
    }
}

fn memory(broker: &MemoryBroker) -> Vec<EngineDefinition> {
    vec![EngineDefinition::new("memory", Arc::new(broker.clone()))]
}

/// Job keyed on the task's `zip` field.
fn forecast_job() -> JobSpec {
    JobSpec::new(
        "forecast",
        "memory",
        worker_fn(|_task, _utils| async { Ok(()) }),
    )
    .with_inquire(InquirePolicy::keyed(true, |task| task["zip"].clone()))
}

fn spawn_run(agent: &Arc<Agent>) -> tokio::task::JoinHandle<ShutdownOutcome> {
    let agent = Arc::clone(agent);
    tokio::spawn(async move { agent.run().await })
}

/// Poll `cond` every 10ms until it holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn task_round_trip_through_master() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&master.directory), memory(&broker)).unwrap();
        agent.consume(forecast_job()).await.unwrap();

        let runner = spawn_run(&agent);
        wait_until(|| agent.is_ready()).await;

        broker.publish("forecast", json!({"zip": "zip-95629"}));
        wait_until(|| master.count("job-end") == 1).await;
        wait_until(|| broker.queue("forecast").acked().len() == 1).await;

        let id = agent.id().to_string();
        let lock_data = json!([{"key": "zip-95629", "locking": true}]);

        assert_eq!(master.paths.lock().unwrap()[0], "/agent");
        assert_eq!(
            master.events(),
            vec!["identify", "register-job", "handle-locks", "job-end"]
        );
        assert_eq!(master.calls_for("identify"), vec![json!(id)]);
        assert_eq!(
            master.calls_for("register-job"),
            vec![json!({"job_name": "forecast", "agent_name": id})]
        );
        assert_eq!(
            master.calls_for("handle-locks"),
            vec![json!({"agent_name": id, "job_name": "forecast", "lock_data": lock_data})]
        );
        assert_eq!(
            master.calls_for("job-end"),
            vec![json!({"id": "run-1", "lock_data": lock_data})]
        );

        let status = agent.status().await;
        assert_eq!(status.session, SessionState::Identified);
        assert_eq!(status.cluster_nodes.len(), 2);
        assert_eq!(status.jobs[0].tasks.completed, 1);

        agent.shutdown(EXIT_GRACEFUL);
        let outcome = runner.await.unwrap();
        assert_eq!(outcome.code, EXIT_GRACEFUL);
        assert!(outcome.drained);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn refused_locks_requeue_until_granted() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        master.deny.store(2, Ordering::SeqCst);
        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&master.directory), memory(&broker)).unwrap();
        agent.consume(forecast_job()).await.unwrap();

        let runner = spawn_run(&agent);
        wait_until(|| agent.is_ready()).await;

        broker.publish("forecast", json!({"zip": "k"}));
        wait_until(|| broker.queue("forecast").acked().len() == 1).await;

        let queue = broker.queue("forecast");
        assert_eq!(queue.requeue_count(), 2);
        assert_eq!(master.count("handle-locks"), 3);
        // Only the granted inquiry is ever released.
        assert_eq!(master.count("job-end"), 1);
        assert_eq!(agent.status().await.jobs[0].tasks.rejected, 2);

        agent.shutdown(EXIT_GRACEFUL);
        runner.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn deadlettered_failure_still_ends_the_run() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&master.directory), memory(&broker)).unwrap();
        let job = JobSpec::new(
            "forecast",
            "memory",
            worker_fn(|_task, utils: WorkerUtils| async move {
                Err(utils.deadletter(anyhow!("unparseable forecast")))
            }),
        )
        .with_inquire(InquirePolicy::keyed(false, |_task| json!(["a", "b"])));
        agent.consume(job).await.unwrap();

        let runner = spawn_run(&agent);
        wait_until(|| agent.is_ready()).await;

        broker.publish("forecast", json!({"n": 1}));
        wait_until(|| broker.queue("forecast").dead_letters().len() == 1).await;
        wait_until(|| master.count("job-end") == 1).await;

        assert_eq!(
            master.calls_for("job-end"),
            vec![json!({
                "id": "run-1",
                "lock_data": [{"key": "a", "locking": false}, {"key": "b", "locking": false}]
            })]
        );
        assert!(broker.queue("forecast").acked().is_empty());

        agent.shutdown(EXIT_GRACEFUL);
        runner.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dropped_connection_rediscovers_and_identifies_again() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        master.drop_after_identify.store(1, Ordering::SeqCst);
        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&master.directory), memory(&broker)).unwrap();
        agent.consume(forecast_job()).await.unwrap();

        let runner = spawn_run(&agent);
        wait_until(|| master.count("identify") == 2).await;
        wait_until(|| agent.session().state() == SessionState::Identified).await;
        assert_eq!(master.paths.lock().unwrap().len(), 2);

        broker.publish("forecast", json!({"zip": "k"}));
        wait_until(|| broker.queue("forecast").acked().len() == 1).await;

        agent.shutdown(EXIT_GRACEFUL);
        runner.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn losing_the_cluster_mid_session_exits_with_cluster_code() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        master.drop_after_identify.store(1, Ordering::SeqCst);
        master.failing_directory.store(true, Ordering::SeqCst);
        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&master.directory), memory(&broker)).unwrap();
        agent.consume(forecast_job()).await.unwrap();

        let outcome = agent.run().await;

        assert_eq!(outcome.code, EXIT_CLUSTER_UNREACHABLE);
        assert_eq!(master.count("identify"), 1);
        // Startup lookup, then one attempt plus two retries on rediscovery.
        assert_eq!(master.directory_hits.load(Ordering::SeqCst), 4);
        assert_eq!(agent.session().state(), SessionState::Disconnected);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn closing_during_rediscovery_stays_closed() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        master.drop_after_identify.store(1, Ordering::SeqCst);
        master.slow_directory.store(true, Ordering::SeqCst);
        let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::unbounded_channel();
        let session = ClusterSession::new(&config(&master.directory), "agent-1", fatal_tx).unwrap();

        session.establish().await.unwrap();
        // The drop sends the session back to the (slow) directory.
        wait_until(|| master.directory_hits.load(Ordering::SeqCst) == 2).await;

        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(master.paths.lock().unwrap().len(), 1);
        assert_eq!(master.count("identify"), 1);
        assert!(fatal_rx.try_recv().is_err());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_directory_exits_with_cluster_code() {
    timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let directory = listener.local_addr().unwrap().to_string();
        drop(listener);

        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&directory), memory(&broker)).unwrap();
        agent.consume(forecast_job()).await.unwrap();

        let outcome = agent.run().await;
        assert_eq!(outcome.code, EXIT_CLUSTER_UNREACHABLE);
        assert!(!agent.is_ready());
    })
    .await
    .expect("test timed out");
}

/// Engine whose setup always fails.
struct BrokenEngine;

#[async_trait]
impl Engine for BrokenEngine {
    async fn setup(&self) -> Result<(), EngineError> {
        Err(EngineError::Setup {
            engine: "broken".into(),
            reason: "broker refused connection".into(),
        })
    }

    fn consume(
        &self,
        _options: Value,
        _handler: Arc<dyn TaskHandler>,
    ) -> Result<ConsumerControl, EngineError> {
        Ok(ConsumerControl::new().0)
    }
}

impl EngineFactory for BrokenEngine {
    fn build(&self, _ctx: EngineContext) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::new(BrokenEngine))
    }
}

#[tokio::test]
async fn engine_setup_failure_exits_with_engine_code() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        let agent = Agent::new(
            config(&master.directory),
            vec![EngineDefinition::new("broken", Arc::new(BrokenEngine))],
        )
        .unwrap();

        let outcome = agent.run().await;
        assert_eq!(outcome.code, EXIT_ENGINE_ERROR);
        // Cluster came first in the startup order.
        assert_eq!(master.count("identify"), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn job_registered_after_start_activates_immediately() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&master.directory), memory(&broker)).unwrap();

        let runner = spawn_run(&agent);
        wait_until(|| agent.is_ready()).await;

        agent.consume(forecast_job()).await.unwrap();
        assert!(agent.status().await.jobs[0].active);

        broker.publish("forecast", json!({"zip": "late"}));
        wait_until(|| broker.queue("forecast").acked().len() == 1).await;

        agent.shutdown(EXIT_GRACEFUL);
        runner.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_work_then_stops_consuming() {
    timeout(TEST_TIMEOUT, async {
        let master = start_master().await;
        let broker = MemoryBroker::new();
        let agent = Agent::new(config(&master.directory), memory(&broker)).unwrap();
        let job = JobSpec::new(
            "forecast",
            "memory",
            worker_fn(|_task, _utils| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            }),
        );
        agent.consume(job).await.unwrap();

        let runner = spawn_run(&agent);
        wait_until(|| agent.is_ready()).await;

        broker.publish("forecast", json!({"n": 1}));
        wait_until(|| agent.in_flight().count() == 1).await;

        assert!(agent.shutdown(EXIT_GRACEFUL));
        assert!(!agent.shutdown(EXIT_ENGINE_ERROR));

        broker.publish("forecast", json!({"n": 2}));
        let outcome = runner.await.unwrap();

        assert_eq!(
            outcome,
            ShutdownOutcome {
                code: EXIT_GRACEFUL,
                drained: true
            }
        );
        let queue = broker.queue("forecast");
        assert_eq!(queue.acked(), vec![json!({"n": 1})]);
        assert_eq!(queue.len(), 1);
        // No lock policy: the master never hears about tasks.
        assert_eq!(master.count("handle-locks"), 0);
        assert_eq!(agent.session().state(), SessionState::Disconnected);
    })
    .await
    .expect("test timed out");
}
