//! The control-plane daemon.
//!
//! Wires every subsystem together, runs startup job recovery, spawns the
//! long-lived workers and the telemetry ingest endpoint, then waits for a
//! shutdown signal. Workers each hold a shutdown receiver and drain on the
//! next iteration; tracked qemu-nbd processes are stopped last.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Args;
use haven_core::Config;
use haven_db::{MigrationManager, Pool, PoolConfig};
use haven_flows::agent::{AgentClient, DataPlaneClient, TelemetryUpdate};
use haven_flows::{FlowOrchestrator, JobRecovery, LocalDataPlane, TelemetryIngest};
use haven_nbd::{NbdProcessManager, PortAllocator};
use haven_scheduler::stale::StaleConfig;
use haven_scheduler::{ExecutionMonitor, SchedulerConfig, SchedulerEngine, StaleJobDetector};
use haven_storage::copy::CopyEngineConfig;
use haven_storage::mount::SecretResolver;
use haven_storage::{
    ChainManager, CopyEngine, GracePeriodWorker, MountManager, Qcow2Tool, RepositoryManager,
    StorageError, StorageResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit code for invalid configuration.
const EXIT_CONFIG: i32 = 1;
/// Exit code for an unreachable database.
const EXIT_DATABASE: i32 = 2;
/// Exit code for a missing image tool.
const EXIT_IMAGE_TOOL: i32 = 3;

#[derive(Args)]
pub struct ServeArgs {
    /// Override the database DSN
    #[arg(long, env = "HAVEN_DB_DSN")]
    db_dsn: Option<String>,

    /// Override the API listen port
    #[arg(long)]
    port: Option<u16>,
}

/// Resolves `env:<NAME>` secret references from the process environment.
/// The variable holds `username:password`.
struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, secret_ref: &str) -> StorageResult<(String, String)> {
        let name = secret_ref.strip_prefix("env:").unwrap_or(secret_ref);
        let value = std::env::var(name).map_err(|_| {
            StorageError::Validation(format!("secret reference {} is not set", secret_ref))
        })?;

        let (username, password) = value.split_once(':').ok_or_else(|| {
            StorageError::Validation(format!(
                "secret reference {} must hold username:password",
                secret_ref
            ))
        })?;

        Ok((username.to_string(), password.to_string()))
    }
}

pub async fn execute(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };
    if let Some(db_dsn) = args.db_dsn {
        config.db_dsn = db_dsn;
    }
    if let Some(port) = args.port {
        config.api_port = port;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        std::process::exit(EXIT_CONFIG);
    }

    let qcow2 = Qcow2Tool::new(&config.image_tool_path);
    if !qcow2.is_available() {
        error!(path = %config.image_tool_path.display(), "image tool not found");
        std::process::exit(EXIT_IMAGE_TOOL);
    }

    let pool = match Pool::new(PoolConfig::for_url(&config.db_dsn)).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "database unreachable");
            std::process::exit(EXIT_DATABASE);
        }
    };
    if let Err(e) = MigrationManager::new(&pool).run().await {
        error!(error = %e, "schema migration failed");
        std::process::exit(EXIT_DATABASE);
    }

    // Storage subsystems.
    let secrets: Box<dyn SecretResolver> = Box::new(EnvSecretResolver);
    let mount = Arc::new(MountManager::new(Some(secrets)));
    let chains = Arc::new(ChainManager::new(pool.clone()));
    let repositories = Arc::new(RepositoryManager::new(
        pool.clone(),
        qcow2.clone(),
        mount.clone(),
        chains.clone(),
    ));
    let active = repositories.start().await?;
    info!(active, "repositories initialised");

    // NBD runtime state; the port table is rebuilt from live process
    // state through recovery, never persisted.
    let ports = Arc::new(PortAllocator::new(config.nbd_port_min, config.nbd_port_max));
    let nbd = Arc::new(NbdProcessManager::new(
        &config.nbd_tool_path,
        Some(ports.clone()),
    ));
    let local_plane = Arc::new(LocalDataPlane::new(
        pool.clone(),
        repositories.clone(),
        chains.clone(),
        ports.clone(),
        nbd.clone(),
    ));

    // Orchestration.
    let data_plane = DataPlaneClient::new(&config.data_plane_url)?;
    let agent = AgentClient::new(&config.agent_url)?;
    let orchestrator = Arc::new(FlowOrchestrator::new(pool.clone(), data_plane));
    let copies = Arc::new(CopyEngine::new(
        CopyEngineConfig {
            workers: config.copy_workers,
            tick: Duration::from_secs(config.copy_tick_secs),
        },
        pool.clone(),
        repositories.clone(),
    ));
    let telemetry = Arc::new(TelemetryIngest::new(
        pool.clone(),
        orchestrator.clone(),
        chains.clone(),
        Some(copies.clone()),
        Some(local_plane.clone()),
    ));

    // Reconcile what the previous process lifetime left behind before any
    // worker acts on stale state: first rebuild the port table from live
    // qemu-nbd processes, then reconcile job rows against the agent.
    let recovery = JobRecovery::new(pool.clone(), agent.clone(), config.max_job_age_secs);
    match recovery
        .adopt_surviving_exports(&config.nbd_tool_path, &ports)
        .await
    {
        Ok(adopted) => {
            if adopted > 0 {
                info!(adopted, "adopted surviving NBD exports into the port table");
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to adopt surviving exports");
        }
    }
    match recovery.run().await {
        Ok(report) => {
            info!(
                examined = report.examined,
                refreshed = report.refreshed,
                completed = report.completed,
                failed = report.failed,
                left = report.left,
                "startup job recovery finished"
            );
        }
        Err(e) => {
            warn!(error = %e, "startup job recovery failed");
        }
    }

    // Long-lived workers, all draining on one shutdown channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    workers.extend(copies.start(shutdown_rx.clone()));

    let stale = Arc::new(StaleJobDetector::new(
        StaleConfig {
            stale_threshold_secs: config.stale_threshold_secs,
            failed_threshold_secs: config.failed_threshold_secs,
            tick: Duration::from_secs(config.stale_tick_secs),
        },
        pool.clone(),
    ));
    workers.push(stale.start(shutdown_rx.clone()));

    let monitor = Arc::new(ExecutionMonitor::new(
        Duration::from_secs(config.monitor_tick_secs),
        pool.clone(),
        orchestrator.clone(),
    ));
    workers.push(monitor.start(shutdown_rx.clone()));

    let grace = Arc::new(GracePeriodWorker::new(
        Duration::from_secs(config.grace_tick_secs),
        pool.clone(),
        repositories.clone(),
    ));
    workers.push(grace.start(shutdown_rx.clone()));

    let scheduler = Arc::new(SchedulerEngine::new(
        SchedulerConfig {
            max_concurrent: config.schedule_max_concurrent,
            shutdown_wait: Duration::from_secs(60),
        },
        pool.clone(),
        orchestrator.clone(),
        agent.clone(),
    ));
    let registered = scheduler.load_schedules().await?;
    info!(registered, "schedules registered");
    workers.push(scheduler.start(shutdown_rx.clone()));

    // Hourly capacity snapshots.
    {
        let repositories = repositories.clone();
        let mut shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = repositories.refresh().await {
                            warn!(error = %e, "capacity refresh failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    // Telemetry ingest endpoint for agent pushes.
    let app = Router::new()
        .route("/api/v1/telemetry", post(ingest_telemetry))
        .route("/health", get(health))
        .with_state(telemetry.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port)).await?;
    info!(port = config.api_port, "telemetry ingest listening");
    {
        let mut shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            let served = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = served.await {
                error!(error = %e, "ingest endpoint failed");
            }
        }));
    }

    wait_for_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    // Stop any exports still being served.
    for process in nbd.get_all().await {
        if let Err(e) = nbd.stop(process.port).await {
            warn!(port = process.port, error = %e, "failed to stop export on shutdown");
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn ingest_telemetry(
    State(telemetry): State<Arc<TelemetryIngest>>,
    Json(update): Json<TelemetryUpdate>,
) -> (StatusCode, String) {
    match telemetry.ingest(update).await {
        Ok(()) => (StatusCode::ACCEPTED, String::new()),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
