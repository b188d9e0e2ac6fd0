//! Configuration types.
//!
//! Every config has a `Default` carrying the compiled-in constants and a
//! `from_env()` constructor that overrides them from `RELAY_*` variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// How the coordinator picks a worker for `auto` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Fewest dispatched/running tasks; ties go to the first configured worker.
    #[default]
    LeastLoaded,
    RoundRobin,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "least_loaded" | "least-loaded" => Ok(Self::LeastLoaded),
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            other => Err(ConfigError::InvalidValue {
                key: "RELAY_SELECTION_POLICY".into(),
                message: format!("unknown policy {other}"),
            }),
        }
    }
}

/// Credentials required to pass the network edge in front of a worker.
#[derive(Debug, Clone)]
pub struct EdgeAccess {
    pub client_id: String,
    pub client_secret: SecretString,
}

/// A worker the coordinator can dispatch to.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    /// Location tag, e.g. the machine name.
    pub name: String,
    pub base_url: String,
    pub access: Option<EdgeAccess>,
}

impl WorkerEndpoint {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access: None,
        }
    }
}

/// Parse `name=url,name=url` into endpoints.
pub fn parse_workers(spec: &str) -> Result<Vec<WorkerEndpoint>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (name, url) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: "RELAY_WORKERS".into(),
                message: format!("expected name=url, got {pair}"),
            })?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "RELAY_WORKERS".into(),
                    message: format!("empty name or url in {pair}"),
                });
            }
            Ok(WorkerEndpoint::new(name, url))
        })
        .collect()
}

/// Control-plane configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Base URL workers use to reach this coordinator.
    pub public_url: String,
    /// Shared secret for coordinator ↔ worker signatures.
    pub dispatch_secret: SecretString,
    /// Master secret per-task callback secrets are derived from.
    pub webhook_secret: SecretString,
    pub workers: Vec<WorkerEndpoint>,
    pub selection_policy: SelectionPolicy,
    /// Bound on dispatch and cancel calls to workers.
    pub worker_call_timeout: Duration,
    /// Tasks active but not updated for this long are zombies.
    pub stale_threshold: Duration,
    pub reconcile_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("./data/task-relay.db"),
            public_url: "http://localhost:8080".to_string(),
            dispatch_secret: SecretString::from(""),
            webhook_secret: SecretString::from(""),
            workers: Vec::new(),
            selection_policy: SelectionPolicy::LeastLoaded,
            worker_call_timeout: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(30 * 60),
            reconcile_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl CoordinatorConfig {
    /// Build config from environment variables.
    ///
    /// `RELAY_DISPATCH_SECRET` and `RELAY_WEBHOOK_SECRET` are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut workers = match std::env::var("RELAY_WORKERS") {
            Ok(spec) => parse_workers(&spec)?,
            Err(_) => Vec::new(),
        };
        if let (Ok(client_id), Ok(client_secret)) = (
            std::env::var("RELAY_EDGE_CLIENT_ID"),
            std::env::var("RELAY_EDGE_CLIENT_SECRET"),
        ) {
            for worker in &mut workers {
                worker.access = Some(EdgeAccess {
                    client_id: client_id.clone(),
                    client_secret: SecretString::from(client_secret.clone()),
                });
            }
        }

        let selection_policy = match std::env::var("RELAY_SELECTION_POLICY") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.selection_policy,
        };

        Ok(Self {
            bind_addr: env_or("RELAY_COORDINATOR_ADDR", defaults.bind_addr),
            db_path: std::env::var("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            public_url: env_or("RELAY_PUBLIC_URL", defaults.public_url),
            dispatch_secret: required_secret("RELAY_DISPATCH_SECRET")?,
            webhook_secret: required_secret("RELAY_WEBHOOK_SECRET")?,
            workers,
            selection_policy,
            worker_call_timeout: env_secs("RELAY_WORKER_TIMEOUT_SECS")?
                .unwrap_or(defaults.worker_call_timeout),
            stale_threshold: env_secs("RELAY_STALE_THRESHOLD_SECS")?
                .unwrap_or(defaults.stale_threshold),
            reconcile_interval: env_secs("RELAY_RECONCILE_INTERVAL_SECS")?
                .unwrap_or(defaults.reconcile_interval),
        })
    }
}

/// Log Forwarder limits and timings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Hard upper bound on a chunk's content, in bytes.
    pub max_chunk_bytes: usize,
    /// A newline is only preferred as a cut point at or past this fraction
    /// of `max_chunk_bytes`.
    pub newline_window: f64,
    pub flush_interval: Duration,
    pub poll_interval: Duration,
    /// Total delivery attempts per chunk, including the first.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub max_chunks_per_task: u64,
    pub max_bytes_per_task: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 8 * 1024,
            newline_window: 0.8,
            flush_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            max_chunks_per_task: 500,
            max_bytes_per_task: 4 * 1024 * 1024,
        }
    }
}

/// Edge worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Location tag this worker answers to.
    pub location: String,
    pub bind_addr: String,
    /// The persisted Worker State Store file.
    pub state_path: PathBuf,
    /// Where repositories are checked out, as `<repos_root>/<repository>`.
    pub repos_root: PathBuf,
    /// Parent directory of per-task working trees.
    pub worktrees_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub coordinator_url: String,
    pub dispatch_secret: SecretString,
    /// Agent program and arguments; the prompt is passed on stdin.
    pub agent_command: Vec<String>,
    /// Command printing a short-lived upstream token for the agent, if any.
    pub credential_command: Option<Vec<String>>,
    pub credential_ttl: Duration,
    /// Upper bound on one credential command run.
    pub credential_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub callback_timeout: Duration,
    /// Delivery attempts before an unconfirmed callback is dropped.
    pub max_callback_attempts: u32,
    pub forwarder: ForwarderConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let home = relay_home();
        Self {
            location: "local".to_string(),
            bind_addr: "0.0.0.0:8081".to_string(),
            state_path: home.join("state.json"),
            repos_root: home.join("repos"),
            worktrees_dir: home.join("worktrees"),
            logs_dir: home.join("logs"),
            coordinator_url: "http://localhost:8080".to_string(),
            dispatch_secret: SecretString::from(""),
            agent_command: vec!["coding-agent".to_string()],
            credential_command: None,
            credential_ttl: Duration::from_secs(55 * 60),
            credential_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5 * 60),
            callback_timeout: Duration::from_secs(10),
            max_callback_attempts: 288,
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables.
    ///
    /// `RELAY_WORKER_LOCATION` and `RELAY_DISPATCH_SECRET` are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let location = std::env::var("RELAY_WORKER_LOCATION")
            .map_err(|_| ConfigError::MissingEnvVar("RELAY_WORKER_LOCATION".into()))?;

        let agent_command =
            env_command("RELAY_AGENT_COMMAND")?.unwrap_or(defaults.agent_command);

        let mut forwarder = ForwarderConfig::default();
        if let Some(interval) = env_secs("RELAY_LOG_FLUSH_SECS")? {
            forwarder.flush_interval = interval;
        }

        Ok(Self {
            location,
            bind_addr: env_or("RELAY_WORKER_ADDR", defaults.bind_addr),
            state_path: env_path("RELAY_STATE_PATH").unwrap_or(defaults.state_path),
            repos_root: env_path("RELAY_REPOS_ROOT").unwrap_or(defaults.repos_root),
            worktrees_dir: env_path("RELAY_WORKTREES_DIR").unwrap_or(defaults.worktrees_dir),
            logs_dir: env_path("RELAY_LOGS_DIR").unwrap_or(defaults.logs_dir),
            coordinator_url: env_or("RELAY_COORDINATOR_URL", defaults.coordinator_url),
            dispatch_secret: required_secret("RELAY_DISPATCH_SECRET")?,
            agent_command,
            credential_command: env_command("RELAY_CREDENTIAL_COMMAND")?,
            credential_ttl: env_secs("RELAY_CREDENTIAL_TTL_SECS")?
                .unwrap_or(defaults.credential_ttl),
            credential_timeout: env_secs("RELAY_CREDENTIAL_TIMEOUT_SECS")?
                .unwrap_or(defaults.credential_timeout),
            heartbeat_interval: env_secs("RELAY_HEARTBEAT_SECS")?
                .unwrap_or(defaults.heartbeat_interval),
            callback_timeout: defaults.callback_timeout,
            max_callback_attempts: defaults.max_callback_attempts,
            forwarder,
        })
    }
}

fn relay_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".task-relay")
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// A whitespace-separated program and arguments.
fn env_command(key: &str) -> Result<Option<Vec<String>>, ConfigError> {
    match std::env::var(key) {
        Ok(cmd) => {
            let parts: Vec<String> = cmd.split_whitespace().map(String::from).collect();
            if parts.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "empty command".into(),
                });
            }
            Ok(Some(parts))
        }
        Err(_) => Ok(None),
    }
}

fn required_secret(key: &str) -> Result<SecretString, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(SecretString::from(value)),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}
