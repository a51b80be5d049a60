//! Expands a scan descriptor into a path list, runs per-path measurements
//! with bounded parallelism, aggregates progress, and produces a final
//! `ScanResult`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dirsize_common::{ScanDescriptor, ScanResult, ScanResultItem, ScanStatus};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::nas::NasClient;
use crate::path::normalize;
use crate::polling::{PollingEngine, PollProgress};

const GRACE_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_PARALLEL: usize = 3;
const MAX_PARALLEL_CAP: usize = 10;

/// Per-path intermediate progress, aggregated into `LiveScanState`.
#[derive(Debug, Clone, Default)]
pub struct PathProgress {
    pub num_dir: u64,
    pub num_file: u64,
    pub total_size: u64,
    pub waited: Duration,
    pub finished: bool,
}

/// In-memory per-scan progress, keyed by slug. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct LiveScanState {
    pub running: bool,
    pub finished_at: Option<chrono::DateTime<Utc>>,
    pub current_path: Option<String>,
    pub expected_paths: Vec<String>,
    pub per_path: HashMap<String, PathProgress>,
}

impl LiveScanState {
    /// True while actively running, or within the 5-second grace window
    /// after finishing — smooths UI transitions across a poll boundary.
    pub fn is_running(&self) -> bool {
        if self.running {
            return true;
        }
        match self.finished_at {
            Some(at) => (Utc::now() - at).num_milliseconds() < GRACE_WINDOW.as_millis() as i64,
            None => false,
        }
    }

    pub fn aggregate(&self) -> PathProgress {
        let mut agg = PathProgress::default();
        let mut max_waited = Duration::ZERO;
        for p in self.per_path.values() {
            agg.num_dir += p.num_dir;
            agg.num_file += p.num_file;
            agg.total_size += p.total_size;
            max_waited = max_waited.max(p.waited);
        }
        agg.waited = max_waited;
        agg.finished = !self.expected_paths.is_empty()
            && self
                .expected_paths
                .iter()
                .all(|p| self.per_path.get(p).map(|s| s.finished).unwrap_or(false));
        agg
    }
}

/// Registry of live scan states, shared between the executor and the
/// control surface (which snapshot-copies under the lock).
#[derive(Default)]
pub struct LiveScanRegistry {
    states: RwLock<HashMap<String, LiveScanState>>,
}

impl LiveScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_running(&self, slug: &str) -> bool {
        self.states
            .read()
            .await
            .get(slug)
            .map(|s| s.is_running())
            .unwrap_or(false)
    }

    pub async fn snapshot(&self, slug: &str) -> Option<LiveScanState> {
        self.states.read().await.get(slug).cloned()
    }

    async fn start(&self, slug: &str, expected_paths: Vec<String>) {
        let mut states = self.states.write().await;
        states.insert(
            slug.to_string(),
            LiveScanState {
                running: true,
                finished_at: None,
                current_path: None,
                expected_paths,
                per_path: HashMap::new(),
            },
        );
    }

    async fn update_path(&self, slug: &str, path: &str, progress: PathProgress) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(slug) {
            state.current_path = Some(path.to_string());
            state.per_path.insert(path.to_string(), progress);
        }
    }

    /// Marks one path's entry finished once its `PollingEngine::run` call
    /// has returned, whether it succeeded or failed — mirroring
    /// `scanner.py`'s per-path `finished: True` write on every terminal
    /// outcome. `final_metrics`, when given, replaces the last observed
    /// numbers with the authoritative final ones.
    async fn finish_path(
        &self,
        slug: &str,
        path: &str,
        final_metrics: Option<(u64, u64, u64, Duration)>,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(slug) {
            let entry = state.per_path.entry(path.to_string()).or_default();
            if let Some((num_dir, num_file, total_size, waited)) = final_metrics {
                entry.num_dir = num_dir;
                entry.num_file = num_file;
                entry.total_size = total_size;
                entry.waited = waited;
            }
            entry.finished = true;
        }
    }

    async fn finish(&self, slug: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(slug) {
            state.running = false;
            state.finished_at = Some(Utc::now());
        }
    }
}

/// Expands a descriptor's `paths`/`shares`/`folders` into the effective,
/// normalized, ordered path list: explicit paths first, then share[/folder]
/// combinations.
pub fn expand_paths(descriptor: &ScanDescriptor) -> Vec<String> {
    let mut out: Vec<String> = descriptor.paths.iter().map(|p| normalize(p)).collect();
    if descriptor.folders.is_empty() {
        for share in &descriptor.shares {
            out.push(normalize(share));
        }
    } else {
        for share in &descriptor.shares {
            for folder in &descriptor.folders {
                out.push(normalize(&format!("{share}/{folder}")));
            }
        }
    }
    out
}

/// Coordinates one execution of one `ScanDescriptor` against one NAS.
pub struct ScanExecutor {
    registry: Arc<LiveScanRegistry>,
    max_parallel: usize,
}

impl ScanExecutor {
    pub fn new(registry: Arc<LiveScanRegistry>, max_parallel: usize) -> Self {
        Self {
            registry,
            max_parallel: max_parallel.clamp(1, MAX_PARALLEL_CAP),
        }
    }

    pub fn with_default_parallelism(registry: Arc<LiveScanRegistry>) -> Self {
        Self::new(registry, DEFAULT_MAX_PARALLEL)
    }

    pub fn live_state(&self) -> Arc<LiveScanRegistry> {
        self.registry.clone()
    }

    /// Runs `descriptor` to completion. Returns a transient "running"
    /// result without starting work if another run for the same slug is
    /// already in-flight (or within its grace window).
    pub async fn run(
        &self,
        descriptor: &ScanDescriptor,
        cancel: watch::Receiver<bool>,
    ) -> ScanResult {
        if self.registry.is_running(&descriptor.slug).await {
            return ScanResult::running(&descriptor.slug, &descriptor.name);
        }

        let paths = expand_paths(descriptor);
        self.registry.start(&descriptor.slug, paths.clone()).await;

        if paths.is_empty() {
            self.registry.finish(&descriptor.slug).await;
            let mut result = ScanResult::running(&descriptor.slug, &descriptor.name);
            result.error = Some("no effective paths after expansion".to_string());
            result.status = ScanStatus::Failed;
            return result;
        }

        let client = match NasClient::new(descriptor.nas.clone()) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                self.registry.finish(&descriptor.slug).await;
                let mut result = ScanResult::running(&descriptor.slug, &descriptor.name);
                result.status = ScanStatus::Failed;
                result.error = Some(format!("failed to construct NAS client: {e}"));
                return result;
            }
        };

        if let Err(e) = client.login().await {
            self.registry.finish(&descriptor.slug).await;
            let mut result = ScanResult::running(&descriptor.slug, &descriptor.name);
            result.status = ScanStatus::Failed;
            result.error = Some(format!("login failed: {e}"));
            return result;
        }

        info!(slug = %descriptor.slug, paths = paths.len(), "scan started");

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut joins: JoinSet<(String, Result<ScanResultItem, String>)> = JoinSet::new();

        for path in paths.iter().cloned() {
            let semaphore = semaphore.clone();
            let client = client.clone();
            let cancel = cancel.clone();
            let registry = self.registry.clone();
            let slug = descriptor.slug.clone();
            joins.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let engine = PollingEngine::new(&client);
                let slug_for_cb = slug.clone();
                let path_for_cb = path.clone();
                let registry_for_cb = registry.clone();
                let outcome = engine
                    .run(&path, cancel, move |p: PollProgress| {
                        let registry = registry_for_cb.clone();
                        let slug_for_cb = slug_for_cb.clone();
                        let path_for_cb = path_for_cb.clone();
                        tokio::spawn(async move {
                            registry
                                .update_path(
                                    &slug_for_cb,
                                    &path_for_cb,
                                    PathProgress {
                                        num_dir: p.num_dir,
                                        num_file: p.num_file,
                                        total_size: p.total_size,
                                        waited: p.waited,
                                        finished: p.finished,
                                    },
                                )
                                .await;
                        });
                    })
                    .await;

                let final_metrics = outcome.as_ref().ok().map(|o| {
                    (
                        o.num_dir,
                        o.num_file,
                        o.total_size_bytes,
                        Duration::from_millis(o.elapsed_ms),
                    )
                });
                registry.finish_path(&slug, &path, final_metrics).await;

                match outcome {
                    Ok(o) => (
                        path.clone(),
                        Ok(ScanResultItem::success(
                            path,
                            o.num_dir,
                            o.num_file,
                            o.total_size_bytes,
                            o.elapsed_ms,
                        )),
                    ),
                    Err(e) => (path.clone(), Err(format!("{e}"))),
                }
            });
        }

        let mut by_path: HashMap<String, ScanResultItem> = HashMap::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok((path, Ok(item))) => {
                    by_path.insert(path, item);
                }
                Ok((path, Err(err))) => {
                    warn!(slug = %descriptor.slug, path = %path, error = %err, "path measurement failed");
                    by_path.insert(path.clone(), ScanResultItem::failure(path, err));
                }
                Err(join_err) => {
                    warn!(slug = %descriptor.slug, error = %join_err, "path task panicked");
                }
            }
        }

        // preserve path-expansion order
        let items: Vec<ScanResultItem> = paths
            .iter()
            .filter_map(|p| by_path.remove(p))
            .collect();

        let mut result = ScanResult {
            slug: descriptor.slug.clone(),
            scan_name: descriptor.name.clone(),
            timestamp: Utc::now(),
            status: ScanStatus::Running,
            items,
            error: None,
        };
        result.finalize();

        client.logout().await.ok();
        client.cleanup_active_tasks().await;

        self.registry.finish(&descriptor.slug).await;

        info!(
            slug = %descriptor.slug,
            status = %result.status,
            items = result.items.len(),
            "scan finished"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc as ChronoUtc;
    use dirsize_common::NasConfig;

    fn descriptor(shares: Vec<&str>, paths: Vec<&str>, folders: Vec<&str>) -> ScanDescriptor {
        ScanDescriptor {
            name: "Docs".into(),
            slug: "docs".into(),
            created_at: ChronoUtc::now(),
            enabled: true,
            nas: NasConfig {
                host: "nas".into(),
                port: 5001,
                username: "u".into(),
                secret: "s".into(),
                use_tls: true,
                verify_tls: true,
            },
            shares: shares.into_iter().map(String::from).collect(),
            paths: paths.into_iter().map(String::from).collect(),
            folders: folders.into_iter().map(String::from).collect(),
            interval: "1h".into(),
        }
    }

    #[test]
    fn expand_paths_puts_explicit_paths_first() {
        let d = descriptor(vec!["homes"], vec!["/data/archive"], vec![]);
        let paths = expand_paths(&d);
        assert_eq!(paths, vec!["/data/archive", "/homes"]);
    }

    #[test]
    fn expand_paths_cartesian_product_of_share_and_folder() {
        let d = descriptor(vec!["homes"], vec![], vec!["docs", "media"]);
        let paths = expand_paths(&d);
        assert_eq!(paths, vec!["/homes/docs", "/homes/media"]);
    }

    #[test]
    fn live_scan_state_grace_window() {
        let mut state = LiveScanState::default();
        state.running = false;
        state.finished_at = Some(Utc::now());
        assert!(state.is_running());
        state.finished_at = Some(Utc::now() - chrono::Duration::seconds(6));
        assert!(!state.is_running());
    }

    #[test]
    fn aggregate_finished_iff_all_expected_paths_finished() {
        let mut state = LiveScanState::default();
        state.expected_paths = vec!["/a".into(), "/b".into()];
        state.per_path.insert(
            "/a".into(),
            PathProgress {
                finished: true,
                ..Default::default()
            },
        );
        assert!(!state.aggregate().finished);
        state.per_path.insert(
            "/b".into(),
            PathProgress {
                finished: true,
                ..Default::default()
            },
        );
        assert!(state.aggregate().finished);
    }
}
