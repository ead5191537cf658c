use std::sync::Arc;

use anyhow::Context;

use agent_runner::agent::{ExecutionAdapter, ProcessExecutor};
use agent_runner::config::RunnerConfig;
use agent_runner::dispatch::Scheduler;
use agent_runner::pool::{self, LocalProvisioner, WorkerPool};
use agent_runner::session::{AppState, SessionRegistry, router};
use agent_runner::tasks::{self, TaskQueue};
use agent_runner::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RunnerConfig::from_env().context("Invalid configuration")?;
    let _log_guard = telemetry::init(config.log_dir.as_deref());

    eprintln!("🤖 Agent Runner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Session WS: ws://{}:{}/ws",
        config.server.bind_addr, config.server.port
    );
    eprintln!(
        "   Workers: {}..{} (capacity {} each), max {} concurrent tasks",
        config.pool.min_workers,
        config.pool.max_workers,
        config.pool.per_worker_capacity,
        config.queue.max_concurrent
    );
    eprintln!("   Agent command: {}\n", config.executor.command);

    // ── Task queue ──────────────────────────────────────────────────────
    let (queue, queue_rx) = TaskQueue::new(config.queue.clone());
    match queue.load_snapshot().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(tasks = n, "Reloaded tasks from snapshot"),
        Err(e) => tracing::warn!(error = %e, "Failed to load task snapshot"),
    }
    let _sweeper = tasks::spawn_sweeper(Arc::clone(&queue));

    // ── Worker pool ─────────────────────────────────────────────────────
    let (pool, pool_rx) = WorkerPool::new(config.pool.clone(), Arc::new(LocalProvisioner::new()));
    if let Err(e) = pool.initialize().await {
        // Maintenance keeps retrying with backoff.
        tracing::warn!(error = %e, "Worker pool started below minimum size");
    }
    let _maintenance = pool::spawn_maintenance(Arc::clone(&pool));

    // ── Dispatch ────────────────────────────────────────────────────────
    let adapter = ExecutionAdapter::new(Arc::new(ProcessExecutor::new(config.executor.clone())));
    let scheduler = Scheduler::start(
        Arc::clone(&queue),
        queue_rx,
        Arc::clone(&pool),
        pool_rx,
        adapter,
        config.dispatch.clone(),
    );

    // ── Session server ──────────────────────────────────────────────────
    let app = router(AppState {
        scheduler: Arc::clone(&scheduler),
        registry: Arc::new(SessionRegistry::new()),
        config: config.server.clone(),
    });
    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "Session server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Session server failed")?;

    // ── Shutdown ────────────────────────────────────────────────────────
    tracing::info!("Shutting down");
    scheduler.shutdown().await;
    pool.shutdown().await;
    match queue.save_snapshot().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(tasks = n, "Saved task snapshot"),
        Err(e) => tracing::warn!(error = %e, "Failed to save task snapshot"),
    }

    Ok(())
}
