use std::sync::Arc;

use task_relay::config::{CoordinatorConfig, WorkerConfig};
use task_relay::coordinator::{
    CoordinatorDeps, HttpWorkerClient, TaskCoordinator, coordinator_routes, spawn_reconciler,
};
use task_relay::forwarder::{HttpLogSink, LogSink};
use task_relay::store::{LibSqlBackend, TaskStore};
use task_relay::worker::{
    CommandCredentialProvider, CredentialProvider, GitWorkingTrees, HttpNotifier,
    ProcessLauncher, WorkerDeps, WorkerRuntime, spawn_heartbeat, worker_routes,
};

const USAGE: &str = "usage: task-relay <coordinator|worker>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mode = std::env::args().nth(1).unwrap_or_default();
    eprintln!("📦 Task Relay v{}", env!("CARGO_PKG_VERSION"));

    match mode.as_str() {
        "coordinator" => run_coordinator().await,
        "worker" => run_worker().await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn run_coordinator() -> Result<(), Box<dyn std::error::Error>> {
    let config = CoordinatorConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export RELAY_DISPATCH_SECRET=... RELAY_WEBHOOK_SECRET=...");
        std::process::exit(1);
    });

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    eprintln!("   Mode: coordinator");
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Workers: {}",
        config
            .workers
            .iter()
            .map(|w| format!("{}={}", w.name, w.base_url))
            .collect::<Vec<_>>()
            .join(", ")
    );
    if config.workers.is_empty() {
        eprintln!("   Warning: RELAY_WORKERS is empty, every dispatch will fail");
    }

    let client = Arc::new(HttpWorkerClient::new(
        config.dispatch_secret.clone(),
        config.worker_call_timeout,
    )?);
    let bind_addr = config.bind_addr.clone();
    let reconcile_interval = config.reconcile_interval;
    let coordinator = Arc::new(TaskCoordinator::new(CoordinatorDeps {
        store,
        client,
        config,
    }));

    // ── Reconciler ───────────────────────────────────────────────────────
    let _reconciler = spawn_reconciler(Arc::clone(&coordinator), reconcile_interval);
    eprintln!(
        "   Reconciler: every {}s",
        reconcile_interval.as_secs()
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    eprintln!("   Listening: http://{bind_addr}\n");
    tracing::info!(addr = %bind_addr, "Coordinator started");

    axum::serve(listener, coordinator_routes(coordinator))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn run_worker() -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export RELAY_WORKER_LOCATION=... RELAY_DISPATCH_SECRET=...");
        std::process::exit(1);
    });

    eprintln!("   Mode: worker ({})", config.location);
    eprintln!("   State: {}", config.state_path.display());
    eprintln!("   Agent: {}", config.agent_command.join(" "));

    let log_sink: Arc<dyn LogSink> = Arc::new(HttpLogSink::new(
        &config.coordinator_url,
        config.dispatch_secret.clone(),
        config.callback_timeout,
    )?);
    let credentials = config.credential_command.clone().map(|command| {
        Arc::new(CommandCredentialProvider::new(command, config.credential_ttl))
            as Arc<dyn CredentialProvider>
    });
    eprintln!(
        "   Credentials: {}",
        if credentials.is_some() { "command" } else { "none" }
    );

    let bind_addr = config.bind_addr.clone();
    let dispatch_secret = config.dispatch_secret.clone();
    let heartbeat_interval = config.heartbeat_interval;
    let deps = WorkerDeps {
        launcher: Arc::new(ProcessLauncher::new(config.agent_command.clone())),
        trees: Arc::new(GitWorkingTrees),
        notifier: Arc::new(HttpNotifier::new(config.callback_timeout)?),
        log_sink,
        credentials,
        config,
    };
    let runtime = WorkerRuntime::start(deps).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to start worker: {e}");
        std::process::exit(1);
    });

    // ── Heartbeat ────────────────────────────────────────────────────────
    let _heartbeat = spawn_heartbeat(Arc::clone(&runtime), heartbeat_interval);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    eprintln!("   Listening: http://{bind_addr}\n");
    tracing::info!(addr = %bind_addr, location = %runtime.location(), "Worker started");

    axum::serve(listener, worker_routes(Arc::clone(&runtime), dispatch_secret))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
