mod api;
mod router;
mod state;

use std::sync::Arc;

use tracing::info;

use dolmetscher_core::config;
use dolmetscher_pool::{HostProbe, HttpTranslator, WorkerPool};
use dolmetscher_scheduler::{loops, Scheduler};
use dolmetscher_store::TaskStore;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    config::load_dotenv();
    let config = dolmetscher_core::Config::from_env();
    config.log_summary();

    let store = TaskStore::open(&config.storage.db_path).await?;

    // Refuse to start without a reachable translation backend; otherwise
    // every admitted task would be doomed.
    let translator = Arc::new(HttpTranslator::new(config.translator.endpoint.clone()));
    translator.healthcheck().await.map_err(|e| {
        anyhow::anyhow!(
            "translator sidecar unreachable at {}: {e}",
            config.translator.endpoint
        )
    })?;

    let pool = Arc::new(WorkerPool::new(
        config.scheduler.gpu_workers,
        config.scheduler.cpu_workers,
        translator,
    ));
    let scheduler = Arc::new(Scheduler::new(
        store,
        pool.clone(),
        config.scheduler.clone(),
        config.translator.clone(),
    ));

    // Reclaim work interrupted by the previous run before accepting new work.
    scheduler.recover().await?;

    loops::spawn_all(
        scheduler.clone(),
        Arc::new(HostProbe::new()),
        config.storage.retention_hours,
    );

    let addr = config.server.bind_addr();
    let app = router::build_router(Arc::new(AppState { scheduler }));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;

    // Wait for in-flight jobs before the process goes away.
    pool.shutdown().await;

    Ok(())
}
