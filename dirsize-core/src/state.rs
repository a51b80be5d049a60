//! The `Core` aggregate: every shared subsystem handle the control surface
//! and the scheduler need, passed explicitly instead of living behind
//! module-level singletons. Process-wide state is reduced to the start
//! timestamp (tracked by `HealthChecker`, not here).

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::executor::ScanExecutor;
use crate::health::HealthChecker;
use crate::scheduler::Scheduler;
use crate::storage::HistoryStore;

/// `NasClientFactory` and `PollingEngine` from spec.md §9 are not separate
/// long-lived handles here: `ScanExecutor::run` constructs a `NasClient`
/// per descriptor and drives a `PollingEngine` per path internally, so
/// `executor` already carries both transitively.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<RwLock<Config>>,
    pub config_path: Arc<std::path::PathBuf>,
    pub store: Arc<HistoryStore>,
    pub executor: Arc<ScanExecutor>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthChecker>,
}

impl Core {
    pub fn new(
        config: Config,
        config_path: std::path::PathBuf,
        store: HistoryStore,
        executor: Arc<ScanExecutor>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path: Arc::new(config_path),
            store: Arc::new(store),
            executor,
            scheduler,
            health: Arc::new(HealthChecker::new(env!("CARGO_PKG_VERSION"))),
        }
    }
}
