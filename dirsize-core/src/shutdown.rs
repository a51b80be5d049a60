//! Graceful shutdown: a cooperative cancellation signal shared by the axum
//! server, the scheduler's dispatch loop, and any in-flight scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    is_shutting_down: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
            let mut sigquit =
                signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigquit.recv() => info!("received SIGQUIT"),
            }

            self.shutdown();
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to register ctrl-c handler");
            info!("received ctrl-c");
            self.shutdown();
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownCoordinator {
    fn clone(&self) -> Self {
        Self {
            shutdown_tx: self.shutdown_tx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
            is_shutting_down: self.is_shutting_down.clone(),
            timeout: self.timeout,
        }
    }
}

/// Drives the shutdown sequence: waits for the OS signal, then runs
/// `cleanup` bounded by the coordinator's timeout.
pub struct GracefulShutdown {
    coordinator: ShutdownCoordinator,
}

impl GracefulShutdown {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn run<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        self.coordinator.wait_for_signal().await;

        info!("starting shutdown sequence");
        let shutdown_timeout = self.coordinator.timeout();

        match timeout(shutdown_timeout, cleanup()).await {
            Ok(()) => info!("cleanup completed"),
            Err(_) => warn!(
                "cleanup did not complete within {:?}, forcing exit",
                shutdown_timeout
            ),
        }

        info!("shutdown complete");
    }

    /// Future suitable for `axum::serve(...).with_graceful_shutdown(...)`.
    pub fn signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.coordinator.subscribe();
        async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_sets_flag_and_notifies_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn signal_future_resolves_after_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let signal = GracefulShutdown::new(coordinator.clone()).signal();
        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("signal future should resolve promptly");
    }
}
