//! End-to-end tests for the coordinator ↔ worker protocol.
//!
//! Each test spins up a coordinator and a worker on random ports, wired to
//! each other over real HTTP. Only the agent process and version control
//! are stubbed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;

use task_relay::config::{CoordinatorConfig, ForwarderConfig, WorkerConfig, WorkerEndpoint};
use task_relay::coordinator::{
    CoordinatorDeps, HttpWorkerClient, TaskCoordinator, coordinator_routes,
};
use task_relay::error::WorkerError;
use task_relay::forwarder::HttpLogSink;
use task_relay::protocol::SignedBody;
use task_relay::store::LibSqlBackend;
use task_relay::worker::launcher::{AgentExit, AgentSession, LaunchSpec};
use task_relay::worker::{
    AgentLauncher, HttpNotifier, WorkerDeps, WorkerRuntime, WorkingTrees, worker_routes,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const DISPATCH_SECRET: &str = "integration-dispatch-secret";

/// Agent stub: writes to its log, then exits on its own after `run_for`
/// or when stopped.
struct ScriptedLauncher {
    run_for: Option<Duration>,
    stops: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl ScriptedLauncher {
    fn new(run_for: Option<Duration>) -> Self {
        Self {
            run_for,
            stops: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<AgentSession, WorkerError> {
        if let Some(parent) = spec.log_path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&spec.log_path, "agent: reading prompt\nagent: tests pass\n")
            .await
            .unwrap();

        let handle = format!("scripted-{}", spec.task_id);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        self.stops.lock().await.insert(handle.clone(), stop_tx);

        let run_for = self.run_for;
        tokio::spawn(async move {
            let finished = async {
                match run_for {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let exit = tokio::select! {
                _ = finished => AgentExit { success: true, code: Some(0), killed: false },
                _ = stop_rx => AgentExit { success: false, code: None, killed: true },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(AgentSession {
            handle,
            exit: exit_rx,
        })
    }

    async fn stop(&self, handle: &str) -> Result<bool, WorkerError> {
        match self.stops.lock().await.remove(handle) {
            Some(tx) => Ok(tx.send(()).is_ok()),
            None => Ok(false),
        }
    }
}

/// Working trees as plain directories.
struct PlainDirs;

#[async_trait]
impl WorkingTrees for PlainDirs {
    async fn create(&self, _: &Path, path: &Path, _: &str, _: &str) -> Result<(), WorkerError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| WorkerError::WorkingTree(e.to_string()))
    }

    async fn remove(&self, _: &Path, path: &Path) -> Result<(), WorkerError> {
        let _ = tokio::fs::remove_dir_all(path).await;
        Ok(())
    }

    async fn list(&self, _: &Path) -> Result<Vec<PathBuf>, WorkerError> {
        Ok(Vec::new())
    }
}

struct Relay {
    coordinator_url: String,
    worker_url: String,
    http: reqwest::Client,
    _tmp: tempfile::TempDir,
}

/// Start a coordinator and one worker named `mac`.
async fn start_relay(run_for: Option<Duration>) -> Relay {
    let tmp = tempfile::tempdir().unwrap();
    let coord_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let coordinator_url = format!("http://{}", coord_listener.local_addr().unwrap());
    let worker_url = format!("http://{}", worker_listener.local_addr().unwrap());

    // ── Worker ───────────────────────────────────────────────────────────
    let worker_config = WorkerConfig {
        location: "mac".into(),
        state_path: tmp.path().join("state.json"),
        repos_root: tmp.path().join("repos"),
        worktrees_dir: tmp.path().join("worktrees"),
        logs_dir: tmp.path().join("logs"),
        coordinator_url: coordinator_url.clone(),
        dispatch_secret: SecretString::from(DISPATCH_SECRET),
        forwarder: ForwarderConfig {
            poll_interval: Duration::from_millis(20),
            ..ForwarderConfig::default()
        },
        ..WorkerConfig::default()
    };
    let runtime = WorkerRuntime::start(WorkerDeps {
        launcher: Arc::new(ScriptedLauncher::new(run_for)),
        trees: Arc::new(PlainDirs),
        notifier: Arc::new(HttpNotifier::new(Duration::from_secs(2)).unwrap()),
        log_sink: Arc::new(
            HttpLogSink::new(
                &coordinator_url,
                SecretString::from(DISPATCH_SECRET),
                Duration::from_secs(2),
            )
            .unwrap(),
        ),
        credentials: None,
        config: worker_config,
    })
    .await
    .unwrap();
    let worker_app = worker_routes(runtime, SecretString::from(DISPATCH_SECRET));
    tokio::spawn(async move {
        axum::serve(worker_listener, worker_app).await.unwrap();
    });

    // ── Coordinator ──────────────────────────────────────────────────────
    let config = CoordinatorConfig {
        public_url: coordinator_url.clone(),
        dispatch_secret: SecretString::from(DISPATCH_SECRET),
        webhook_secret: SecretString::from("integration-webhook-master"),
        workers: vec![WorkerEndpoint::new("mac", worker_url.clone())],
        worker_call_timeout: Duration::from_secs(2),
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(TaskCoordinator::new(CoordinatorDeps {
        store: Arc::new(LibSqlBackend::new_memory().await.unwrap()),
        client: Arc::new(
            HttpWorkerClient::new(SecretString::from(DISPATCH_SECRET), Duration::from_secs(2))
                .unwrap(),
        ),
        config,
    }));
    let coord_app = coordinator_routes(coordinator);
    tokio::spawn(async move {
        axum::serve(coord_listener, coord_app).await.unwrap();
    });

    // Give the servers a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Relay {
        coordinator_url,
        worker_url,
        http: reqwest::Client::new(),
        _tmp: tmp,
    }
}

impl Relay {
    async fn create_task(&self, user: &str, dedup_key: &str) -> reqwest::Response {
        self.http
            .post(format!("{}/api/tasks", self.coordinator_url))
            .header("x-user-id", user)
            .json(&json!({
                "prompt": "make the failing test pass",
                "repository": "acme/api",
                "dedupKey": dedup_key,
            }))
            .send()
            .await
            .unwrap()
    }

    async fn get_task(&self, user: &str, id: &str) -> reqwest::Response {
        self.http
            .get(format!("{}/api/tasks/{id}", self.coordinator_url))
            .header("x-user-id", user)
            .send()
            .await
            .unwrap()
    }

    /// Poll until the task reaches `status`.
    async fn wait_for_status(&self, id: &str, status: &str) -> Value {
        loop {
            let task: Value = self.get_task("alice", id).await.json().await.unwrap();
            if task["status"] == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn worker_tasks(&self) -> Vec<Value> {
        SignedBody::empty(DISPATCH_SECRET.as_bytes())
            .apply(self.http.get(format!("{}/tasks", self.worker_url)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn task_runs_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let relay = start_relay(Some(Duration::from_millis(300))).await;

        let resp = relay.create_task("alice", "complete-1").await;
        assert_eq!(resp.status(), 201);
        let task: Value = resp.json().await.unwrap();
        assert_eq!(task["status"], "dispatched");
        assert_eq!(task["workerLocation"], "mac");
        let id = task["id"].as_str().unwrap().to_string();

        let done = relay.wait_for_status(&id, "completed").await;
        assert_eq!(done["callbackReceived"], true);
        assert_eq!(done["result"]["exitCode"], 0);
        assert_eq!(done["result"]["workerLocation"], "mac");
        assert!(done["result"]["logs"]["bytes_sent"].as_u64().unwrap() > 0);

        let worker_tasks = relay.worker_tasks().await;
        assert_eq!(worker_tasks.len(), 1);
        assert_eq!(worker_tasks[0]["status"], "completed");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_submission_returns_same_task() {
    timeout(TEST_TIMEOUT, async {
        let relay = start_relay(None).await;

        let first: Value = relay.create_task("alice", "dup").await.json().await.unwrap();
        let second: Value = relay.create_task("alice", "dup").await.json().await.unwrap();
        assert_eq!(first["id"], second["id"]);
        assert_eq!(relay.worker_tasks().await.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_stops_the_worker() {
    timeout(TEST_TIMEOUT, async {
        let relay = start_relay(None).await;
        let task: Value = relay.create_task("alice", "cancel-1").await.json().await.unwrap();
        let id = task["id"].as_str().unwrap().to_string();

        let resp = relay
            .http
            .post(format!("{}/api/tasks/{id}/cancel", relay.coordinator_url))
            .header("x-user-id", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "cancelled");

        // The worker stops the agent and its late callback is only recorded.
        let cancelled = loop {
            let task = relay.wait_for_status(&id, "cancelled").await;
            if task["callbackReceived"] == true {
                break task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        };
        assert_eq!(cancelled["status"], "cancelled");

        let worker_tasks = relay.worker_tasks().await;
        assert_eq!(worker_tasks[0]["status"], "cancelled");

        // A second cancel is a conflict.
        let again = relay
            .http
            .post(format!("{}/api/tasks/{id}/cancel", relay.coordinator_url))
            .header("x-user-id", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 409);
    })
    .await
    .expect("test timed out");
}

// ── Access control ───────────────────────────────────────────────────

#[tokio::test]
async fn task_api_checks_caller() {
    timeout(TEST_TIMEOUT, async {
        let relay = start_relay(None).await;
        let task: Value = relay.create_task("alice", "owner").await.json().await.unwrap();
        let id = task["id"].as_str().unwrap().to_string();

        assert_eq!(relay.get_task("alice", &id).await.status(), 200);
        assert_eq!(relay.get_task("bob", &id).await.status(), 403);
        assert_eq!(relay.get_task("alice", "not-a-uuid").await.status(), 400);
        assert_eq!(
            relay
                .get_task("alice", &uuid::Uuid::new_v4().to_string())
                .await
                .status(),
            404
        );

        let anonymous = relay
            .http
            .get(format!("{}/api/tasks/{id}", relay.coordinator_url))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), 401);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn internal_endpoints_require_signature() {
    timeout(TEST_TIMEOUT, async {
        let relay = start_relay(None).await;
        let task: Value = relay.create_task("alice", "sig").await.json().await.unwrap();
        let id = task["id"].as_str().unwrap().to_string();
        let chunk = json!({"taskId": id, "sequence": 99, "content": "forged\n"});

        // Unsigned log chunk.
        let unsigned = relay
            .http
            .post(format!("{}/internal/logs", relay.coordinator_url))
            .json(&chunk)
            .send()
            .await
            .unwrap();
        assert_eq!(unsigned.status(), 401);

        // Callback signed with the shared secret instead of the task secret.
        let callback = json!({"taskId": id, "status": "completed"});
        let wrong = SignedBody::new(DISPATCH_SECRET.as_bytes(), &callback).unwrap();
        let resp = wrong
            .apply(
                relay
                    .http
                    .post(format!("{}/internal/webhooks/tasks/{id}", relay.coordinator_url)),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        // Unsigned dispatch straight to the worker.
        let direct = relay
            .http
            .post(format!("{}/tasks", relay.worker_url))
            .json(&json!({"taskId": uuid::Uuid::new_v4()}))
            .send()
            .await
            .unwrap();
        assert_eq!(direct.status(), 401);

        // Properly signed chunk is stored once.
        let signed = SignedBody::new(DISPATCH_SECRET.as_bytes(), &chunk).unwrap();
        let stored: Value = signed
            .apply(relay.http.post(format!("{}/internal/logs", relay.coordinator_url)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stored["stored"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_listings_are_signed_and_redacted() {
    timeout(TEST_TIMEOUT, async {
        let relay = start_relay(None).await;
        let task: Value = relay.create_task("alice", "listing").await.json().await.unwrap();
        assert_eq!(task["status"], "dispatched");

        let unsigned = relay
            .http
            .get(format!("{}/tasks", relay.worker_url))
            .send()
            .await
            .unwrap();
        assert_eq!(unsigned.status(), 401);

        let tasks = relay.worker_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["taskId"], task["id"]);
        assert!(tasks[0].get("webhookSecret").is_none());
        assert!(tasks[0].get("webhookUrl").is_none());
        assert!(tasks[0].get("prompt").is_none());

        let orphans_url = |repository: &str| {
            format!(
                "{}/worktrees/orphans?repository={repository}",
                relay.worker_url
            )
        };
        let unsigned = relay.http.get(orphans_url("acme/api")).send().await.unwrap();
        assert_eq!(unsigned.status(), 401);

        let escaped = SignedBody::empty(DISPATCH_SECRET.as_bytes())
            .apply(relay.http.get(orphans_url("..%2F..%2Fetc")))
            .send()
            .await
            .unwrap();
        assert_eq!(escaped.status(), 400);

        let listed: Value = SignedBody::empty(DISPATCH_SECRET.as_bytes())
            .apply(relay.http.get(orphans_url("acme/api")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["repository"], "acme/api");
        assert!(listed["orphans"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reconcile_endpoint_reports() {
    timeout(TEST_TIMEOUT, async {
        let relay = start_relay(None).await;
        let signed = SignedBody::new(DISPATCH_SECRET.as_bytes(), &json!({})).unwrap();
        let report: Value = signed
            .apply(relay.http.post(format!("{}/internal/reconcile", relay.coordinator_url)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["detected"], 0);
        assert_eq!(report["interrupted"], 0);
        assert!(report["errors"].as_array().unwrap().is_empty());

        let health: Value = relay
            .http
            .get(format!("{}/health", relay.worker_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["location"], "mac");
    })
    .await
    .expect("test timed out");
}
