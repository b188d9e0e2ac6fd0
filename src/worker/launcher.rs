//! Starting and stopping the coding-agent process.
//!
//! The agent itself is opaque: a program run inside the task's working
//! tree with the prompt on stdin and its output appended to the task log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WorkerError;

/// Environment variable the upstream credential is passed in, when one is configured.
pub const CREDENTIAL_ENV: &str = "RELAY_UPSTREAM_TOKEN";

/// What to run for a task.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub task_id: Uuid,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub log_path: PathBuf,
    pub env: Vec<(String, String)>,
}

/// How the agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub success: bool,
    pub code: Option<i32>,
    /// Set when the process was stopped through [`AgentLauncher::stop`].
    pub killed: bool,
}

/// A running agent.
#[derive(Debug)]
pub struct AgentSession {
    pub handle: String,
    /// Resolves once the process has exited.
    pub exit: oneshot::Receiver<AgentExit>,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<AgentSession, WorkerError>;

    /// Ask the session to stop. Returns `false` if it is not running.
    async fn stop(&self, handle: &str) -> Result<bool, WorkerError>;
}

/// Runs the agent as a child process.
pub struct ProcessLauncher {
    command: Vec<String>,
    running: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl ProcessLauncher {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<AgentSession, WorkerError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| WorkerError::Launch("empty agent command".into()))?;

        if let Some(parent) = spec.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkerError::Launch(format!("log dir: {e}")))?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|e| WorkerError::Launch(format!("log file: {e}")))?;
        let log_err = log
            .try_clone()
            .map_err(|e| WorkerError::Launch(format!("log file: {e}")))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Launch(format!("failed to start {program}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(spec.prompt.as_bytes()).await {
                warn!(task_id = %spec.task_id, error = %e, "Failed to write prompt to agent");
            }
        }

        let handle = match child.id() {
            Some(pid) => format!("agent-{}-{pid}", spec.task_id),
            None => format!("agent-{}", spec.task_id),
        };
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        self.running.lock().await.insert(handle.clone(), stop_tx);

        let running = Arc::clone(&self.running);
        let session_handle = handle.clone();
        let task_id = spec.task_id;
        tokio::spawn(async move {
            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut stop_rx => {
                    killed = true;
                    if let Err(e) = child.kill().await {
                        warn!(task_id = %task_id, error = %e, "Failed to kill agent");
                    }
                    child.wait().await
                }
            };
            running.lock().await.remove(&session_handle);

            let exit = match status {
                Ok(status) => AgentExit {
                    success: status.success() && !killed,
                    code: status.code(),
                    killed,
                },
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Lost track of agent process");
                    AgentExit {
                        success: false,
                        code: None,
                        killed,
                    }
                }
            };
            info!(task_id = %task_id, code = ?exit.code, killed, "Agent exited");
            let _ = exit_tx.send(exit);
        });

        Ok(AgentSession {
            handle,
            exit: exit_rx,
        })
    }

    async fn stop(&self, handle: &str) -> Result<bool, WorkerError> {
        match self.running.lock().await.remove(handle) {
            Some(stop_tx) => Ok(stop_tx.send(()).is_ok()),
            None => Ok(false),
        }
    }
}
