//! Service entry point: loads configuration, opens/migrates the embedded
//! store, constructs the `Core` aggregate, starts the scheduler, then
//! serves the control surface until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use dirsize_core::config::Config;
use dirsize_core::executor::{LiveScanRegistry, ScanExecutor};
use dirsize_core::logging::LoggingConfig;
use dirsize_core::scheduler::Scheduler;
use dirsize_core::shutdown::{GracefulShutdown, ShutdownCoordinator};
use dirsize_core::state::Core;
use dirsize_core::storage::HistoryStore;
use dirsize_core::{api, config};

const SERVER_HOST: &str = "0.0.0.0";
const SERVER_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = LoggingConfig::init_from_env() {
        eprintln!("failed to initialize logging: {e}");
    }

    let config_path = config::find_config_path()
        .unwrap_or_else(|| std::path::PathBuf::from("config.yaml"));
    let app_config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration load failed: {}", e);
            return Err(anyhow::anyhow!("invalid configuration: {e}"));
        }
    };
    info!(
        scans = app_config.scans.len(),
        path = %config_path.display(),
        "configuration loaded"
    );

    let store = HistoryStore::connect(&app_config.database_url, app_config.max_history)
        .await
        .map_err(|e| anyhow::anyhow!("failed to open history store: {e}"))?;
    info!("history store ready");

    let registry = Arc::new(LiveScanRegistry::new());
    let executor = Arc::new(ScanExecutor::new(
        registry,
        app_config.max_parallel_tasks,
    ));
    let scheduler = Arc::new(Scheduler::new(executor.clone()));
    scheduler.load(app_config.scans.clone()).await;

    let core = Core::new(
        app_config,
        config_path.clone(),
        store,
        executor,
        scheduler.clone(),
    );

    let shutdown_coordinator = ShutdownCoordinator::new();
    let graceful = GracefulShutdown::new(shutdown_coordinator.clone());

    let signal_coordinator = shutdown_coordinator.clone();
    tokio::spawn(async move {
        signal_coordinator.wait_for_signal().await;
    });

    let reload_config_path = config_path.clone();
    let reload_scheduler = scheduler.clone();
    scheduler
        .start(shutdown_coordinator.subscribe(), move || {
            let path = reload_config_path.clone();
            let scheduler = reload_scheduler.clone();
            async move {
                match Config::load(&path) {
                    Ok(cfg) => cfg.scans,
                    Err(e) => {
                        error!("config reload failed, keeping previous schedule: {}", e);
                        // Returning the current descriptors unchanged makes
                        // this reload tick a no-op instead of clearing jobs.
                        scheduler.descriptors().await
                    }
                }
            }
        })
        .await;
    info!("scheduler started");

    let app = api::router(core);

    let addr = format!("{SERVER_HOST}:{SERVER_PORT}");
    let listener = TcpListener::bind(&addr).await?;
    info!("dirsize-core listening on {}", addr);

    let shutdown_signal = graceful.signal();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("server stopped");
    Ok(())
}
