//! Owns the registry of configured scans, fires executions on cron or
//! interval triggers, coalesces overlapping runs, and periodically
//! diff-applies reloaded configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use dirsize_common::{ScanDescriptor, ScanResult};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::executor::ScanExecutor;

const MISFIRE_GRACE: chrono::Duration = chrono::Duration::seconds(3600);
const RELOAD_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DISPATCH_TICK: Duration = Duration::from_secs(1);
const MAX_HISTORY: usize = 200;

/// A parsed five-field cron expression (`minute hour day month weekday`).
/// Each field is `None` for `*`, otherwise the explicit set of accepted
/// values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Option<Vec<u32>>,
    hours: Option<Vec<u32>>,
    days: Option<Vec<u32>>,
    months: Option<Vec<u32>>,
    weekdays: Option<Vec<u32>>,
    source: String,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Option<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            weekdays: parse_field(fields[4], 0, 6)?,
            source: expr.to_string(),
        })
    }

    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        field_matches(&self.minutes, dt.minute())
            && field_matches(&self.hours, dt.hour())
            && field_matches(&self.days, dt.day())
            && field_matches(&self.months, dt.month())
            && field_matches(&self.weekdays, dt.weekday().num_days_from_sunday())
    }

    /// Linear minute-by-minute search, bounded to two years out.
    pub fn next_run_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (after + chrono::Duration::minutes(1))
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap();
        let limit = after + chrono::Duration::days(366 * 2);
        while candidate < limit {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }

    pub fn description(&self) -> String {
        format!("cron({})", self.source)
    }
}

fn field_matches(field: &Option<Vec<u32>>, value: u32) -> bool {
    match field {
        None => true,
        Some(values) => values.contains(&value),
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Option<Option<Vec<u32>>> {
    if field == "*" {
        return Some(None);
    }
    let mut values = Vec::new();
    for part in field.split(',') {
        if let Some((range_part, step_part)) = part.split_once('/') {
            let step: u32 = step_part.parse().ok()?;
            if step == 0 {
                return None;
            }
            let (lo, hi) = if range_part == "*" {
                (min, max)
            } else {
                let (l, h) = range_part.split_once('-')?;
                (l.parse().ok()?, h.parse().ok()?)
            };
            let mut v = lo;
            while v <= hi {
                values.push(v);
                v += step;
            }
        } else if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.parse().ok()?;
            let hi: u32 = hi.parse().ok()?;
            if lo > hi {
                return None;
            }
            values.extend(lo..=hi);
        } else {
            values.push(part.parse().ok()?);
        }
    }
    if values.iter().any(|v| *v < min || *v > max) {
        return None;
    }
    values.sort_unstable();
    values.dedup();
    Some(Some(values))
}

/// Accepts `N{s|m|h|d}`: a positive integer followed by one of the four
/// unit suffixes. Rejects bare numbers, unknown suffixes, and blank input.
pub fn parse_duration_literal(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let unit = s.chars().last()?;
    let (magnitude_str, multiplier) = match unit {
        's' => (&s[..s.len() - 1], 1u64),
        'm' => (&s[..s.len() - 1], 60),
        'h' => (&s[..s.len() - 1], 3600),
        'd' => (&s[..s.len() - 1], 86400),
        _ => return None,
    };
    if magnitude_str.is_empty() {
        return None;
    }
    let magnitude: u64 = magnitude_str.parse().ok()?;
    Some(Duration::from_secs(magnitude * multiplier))
}

#[derive(Debug, Clone)]
enum Trigger {
    Interval(Duration),
    Cron(CronSchedule),
}

impl Trigger {
    fn parse(interval: &str) -> Option<Self> {
        if let Some(d) = parse_duration_literal(interval) {
            return Some(Self::Interval(d));
        }
        CronSchedule::parse(interval).map(Self::Cron)
    }

    fn next_run_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Interval(d) => after + chrono::Duration::from_std(*d).unwrap_or_default(),
            Self::Cron(c) => c
                .next_run_after(after)
                .unwrap_or(after + chrono::Duration::days(365 * 2)),
        }
    }

    fn description(&self) -> String {
        match self {
            Self::Interval(d) => format!("every {}s", d.as_secs()),
            Self::Cron(c) => c.description(),
        }
    }
}

struct Job {
    descriptor: ScanDescriptor,
    trigger: Trigger,
    next_run: DateTime<Utc>,
    running: bool,
}

#[derive(Debug, Clone)]
pub struct JobHistoryEntry {
    pub slug: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: dirsize_common::ScanStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub slug: String,
    pub next_run: Option<DateTime<Utc>>,
    pub trigger_description: String,
    pub enabled: bool,
}

struct SchedulerState {
    jobs: HashMap<String, Job>,
    history: Vec<JobHistoryEntry>,
    duplicate_warnings: Vec<String>,
}

/// Dispatches scan executions for every enabled, registered `ScanDescriptor`
/// on its configured trigger, enforcing `coalesce` + `maxInstances=1`.
pub struct Scheduler {
    state: Arc<RwLock<SchedulerState>>,
    executor: Arc<ScanExecutor>,
    running: Arc<RwLock<bool>>,
}

impl Scheduler {
    pub fn new(executor: Arc<ScanExecutor>) -> Self {
        Self {
            state: Arc::new(RwLock::new(SchedulerState {
                jobs: HashMap::new(),
                history: Vec::new(),
                duplicate_warnings: Vec::new(),
            })),
            executor,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Loads an initial descriptor set, applying the duplicate-slug
    /// keep-oldest policy.
    pub async fn load(&self, descriptors: Vec<ScanDescriptor>) {
        let kept = dedupe_keep_oldest(descriptors);
        let mut state = self.state.write().await;
        state.duplicate_warnings = kept.dropped_warnings;
        for descriptor in kept.kept {
            self.insert_job(&mut state, descriptor);
        }
    }

    fn insert_job(&self, state: &mut SchedulerState, descriptor: ScanDescriptor) {
        if !descriptor.enabled {
            return;
        }
        let trigger = match Trigger::parse(&descriptor.interval) {
            Some(t) => t,
            None => {
                warn!(scan = %descriptor.name, interval = %descriptor.interval, "invalid trigger, scan skipped");
                return;
            }
        };
        let next_run = trigger.next_run_after(Utc::now());
        state.jobs.insert(
            descriptor.slug.clone(),
            Job {
                descriptor,
                trigger,
                next_run,
                running: false,
            },
        );
    }

    pub async fn get_job_info(&self, slug: &str) -> Option<JobInfo> {
        let state = self.state.read().await;
        state.jobs.get(slug).map(|j| JobInfo {
            slug: slug.to_string(),
            next_run: Some(j.next_run),
            trigger_description: j.trigger.description(),
            enabled: j.descriptor.enabled,
        })
    }

    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let state = self.state.read().await;
        state
            .jobs
            .values()
            .map(|j| JobInfo {
                slug: j.descriptor.slug.clone(),
                next_run: Some(j.next_run),
                trigger_description: j.trigger.description(),
                enabled: j.descriptor.enabled,
            })
            .collect()
    }

    pub async fn descriptors(&self) -> Vec<ScanDescriptor> {
        let state = self.state.read().await;
        state.jobs.values().map(|j| j.descriptor.clone()).collect()
    }

    pub async fn descriptor(&self, slug_or_name: &str) -> Option<ScanDescriptor> {
        let state = self.state.read().await;
        state
            .jobs
            .values()
            .find(|j| j.descriptor.slug == slug_or_name || j.descriptor.name == slug_or_name)
            .map(|j| j.descriptor.clone())
    }

    pub async fn duplicate_warnings(&self) -> Vec<String> {
        self.state.read().await.duplicate_warnings.clone()
    }

    pub async fn history(&self, limit: usize) -> Vec<JobHistoryEntry> {
        let state = self.state.read().await;
        state
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Idempotent: returns `false` (not triggered) if the scan is already
    /// running.
    pub async fn trigger_now(&self, slug: &str) -> Option<bool> {
        let descriptor = {
            let state = self.state.read().await;
            state.jobs.get(slug).map(|j| j.descriptor.clone())
        }?;
        if self.executor.live_state().is_running(slug).await {
            return Some(false);
        }
        let executor = self.executor.clone();
        let state = self.state.clone();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            run_and_record(executor, state, descriptor, rx).await;
        });
        Some(true)
    }

    /// Starts the dispatch loop and the periodic reload loop. No-op if
    /// already started. `reload_config` is called once per reload tick (and
    /// is expected to re-read and validate the configuration file).
    pub async fn start<F, Fut>(self: &Arc<Self>, shutdown: watch::Receiver<bool>, reload_config: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<ScanDescriptor>> + Send + 'static,
    {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let state = self.state.clone();
        let executor = self.executor.clone();
        let dispatch_shutdown = shutdown.clone();
        tokio::spawn(async move {
            dispatch_loop(state, executor, dispatch_shutdown).await;
        });

        let this = self.clone();
        let reload_shutdown = shutdown;
        tokio::spawn(async move {
            reload_loop(this, reload_config, reload_shutdown).await;
        });

        info!("scheduler started");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Recomputes the three-way diff (added/removed/updated) against the
    /// current registry and applies it. Returns the counts.
    pub async fn reload(&self, descriptors: Vec<ScanDescriptor>) -> ReloadDiff {
        let kept = dedupe_keep_oldest(descriptors);
        let mut state = self.state.write().await;
        state.duplicate_warnings = kept.dropped_warnings;

        let new_by_slug: HashMap<String, ScanDescriptor> = kept
            .kept
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| (d.slug.clone(), d))
            .collect();
        let old_slugs: HashSet<String> = state.jobs.keys().cloned().collect();
        let new_slugs: HashSet<String> = new_by_slug.keys().cloned().collect();

        let mut diff = ReloadDiff::default();

        for removed_slug in old_slugs.difference(&new_slugs) {
            state.jobs.remove(removed_slug);
            diff.removed += 1;
        }

        for slug in new_slugs.difference(&old_slugs) {
            let descriptor = new_by_slug[slug].clone();
            self.insert_job(&mut state, descriptor);
            diff.added += 1;
        }

        for slug in new_slugs.intersection(&old_slugs) {
            let new_descriptor = &new_by_slug[slug];
            let changed = {
                let existing = &state.jobs[slug].descriptor;
                existing.shares != new_descriptor.shares
                    || existing.folders != new_descriptor.folders
                    || existing.paths != new_descriptor.paths
                    || existing.interval != new_descriptor.interval
                    || existing.nas.host != new_descriptor.nas.host
                    || existing.nas.port != new_descriptor.nas.port
            };
            if changed {
                let descriptor = new_descriptor.clone();
                self.insert_job(&mut state, descriptor);
                diff.updated += 1;
            }
        }

        diff
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReloadDiff {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

impl ReloadDiff {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.updated == 0
    }
}

struct DedupeResult {
    kept: Vec<ScanDescriptor>,
    dropped_warnings: Vec<String>,
}

/// Keeps the oldest `createdAt` among duplicate slugs; ties broken by
/// stable order in the input.
fn dedupe_keep_oldest(descriptors: Vec<ScanDescriptor>) -> DedupeResult {
    let mut by_slug: HashMap<String, ScanDescriptor> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut warnings = Vec::new();

    for descriptor in descriptors {
        match by_slug.get(&descriptor.slug) {
            Some(existing) if existing.created_at <= descriptor.created_at => {
                warnings.push(format!(
                    "duplicate slug '{}': keeping scan '{}' (created {}), dropping '{}' (created {})",
                    descriptor.slug, existing.name, existing.created_at, descriptor.name, descriptor.created_at
                ));
            }
            Some(existing) => {
                warnings.push(format!(
                    "duplicate slug '{}': keeping scan '{}' (created {}), dropping '{}' (created {})",
                    descriptor.slug, descriptor.name, descriptor.created_at, existing.name, existing.created_at
                ));
                by_slug.insert(descriptor.slug.clone(), descriptor);
            }
            None => {
                order.push(descriptor.slug.clone());
                by_slug.insert(descriptor.slug.clone(), descriptor);
            }
        }
    }

    DedupeResult {
        kept: order.into_iter().filter_map(|s| by_slug.remove(&s)).collect(),
        dropped_warnings: warnings,
    }
}

async fn run_and_record(
    executor: Arc<ScanExecutor>,
    state: Arc<RwLock<SchedulerState>>,
    descriptor: ScanDescriptor,
    cancel: watch::Receiver<bool>,
) -> ScanResult {
    let started_at = Utc::now();
    let start = Instant::now();
    let result = executor.run(&descriptor, cancel).await;
    let entry = JobHistoryEntry {
        slug: descriptor.slug.clone(),
        started_at,
        duration_ms: start.elapsed().as_millis() as u64,
        status: result.status,
        error: result.error.clone(),
    };
    let mut state = state.write().await;
    state.history.push(entry);
    if state.history.len() > MAX_HISTORY {
        state.history.remove(0);
    }
    result
}

async fn dispatch_loop(
    state: Arc<RwLock<SchedulerState>>,
    executor: Arc<ScanExecutor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(DISPATCH_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler dispatch loop stopping on shutdown signal");
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }

        let now = Utc::now();
        let due: Vec<(String, ScanDescriptor)> = {
            let mut state = state.write().await;
            let mut due = Vec::new();
            for (slug, job) in state.jobs.iter_mut() {
                if job.running {
                    continue; // maxInstances = 1: drop the late firing
                }
                if job.descriptor.enabled && job.next_run <= now {
                    // misfireGraceSeconds: 3600 — a firing more than an hour
                    // late is coalesced into "now" rather than run at all.
                    let late_by = now - job.next_run;
                    if late_by <= MISFIRE_GRACE {
                        due.push((slug.clone(), job.descriptor.clone()));
                    }
                    job.next_run = job.trigger.next_run_after(now);
                    job.running = true;
                }
            }
            due
        };

        for (slug, descriptor) in due {
            let state = state.clone();
            let executor = executor.clone();
            let shutdown_rx = shutdown.clone();
            tokio::spawn(async move {
                run_and_record(executor, state.clone(), descriptor, shutdown_rx).await;
                let mut state = state.write().await;
                if let Some(job) = state.jobs.get_mut(&slug) {
                    job.running = false;
                }
            });
        }
    }
}

async fn reload_loop<F, Fut>(scheduler: Arc<Scheduler>, reload_config: F, mut shutdown: watch::Receiver<bool>)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Vec<ScanDescriptor>> + Send + 'static,
{
    let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it, startup already loaded
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }
        let descriptors = reload_config().await;
        let diff = scheduler.reload(descriptors).await;
        if diff.is_noop() {
            tracing::debug!("config reload: no changes");
        } else {
            info!(added = diff.added, removed = diff.removed, updated = diff.updated, "config reload applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_parse_simple() {
        let c = CronSchedule::parse("0 3 * * *").unwrap();
        assert_eq!(c.minutes, Some(vec![0]));
        assert_eq!(c.hours, Some(vec![3]));
        assert_eq!(c.days, None);
    }

    #[test]
    fn cron_parse_range() {
        let c = CronSchedule::parse("0-10 * * * *").unwrap();
        assert_eq!(c.minutes, Some((0..=10).collect::<Vec<_>>()));
    }

    #[test]
    fn cron_parse_step() {
        let c = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(c.minutes, Some(vec![0, 15, 30, 45]));
    }

    #[test]
    fn cron_parse_list() {
        let c = CronSchedule::parse("0,30 * * * *").unwrap();
        assert_eq!(c.minutes, Some(vec![0, 30]));
    }

    #[test]
    fn cron_rejects_wrong_field_count() {
        assert!(CronSchedule::parse("* * *").is_none());
    }

    #[test]
    fn cron_next_run_after_finds_matching_minute() {
        let c = CronSchedule::parse("*/15 * * * *").unwrap();
        let after = Utc::now();
        let next = c.next_run_after(after).unwrap();
        assert_eq!(next.minute() % 15, 0);
        assert!(next > after);
    }

    #[test]
    fn duration_literal_accepts_all_units() {
        assert_eq!(parse_duration_literal("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration_literal("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration_literal("10h"), Some(Duration::from_secs(36000)));
        assert_eq!(parse_duration_literal("10d"), Some(Duration::from_secs(864000)));
    }

    #[test]
    fn duration_literal_rejects_invalid_forms() {
        assert_eq!(parse_duration_literal("10"), None);
        assert_eq!(parse_duration_literal("10x"), None);
        assert_eq!(parse_duration_literal(""), None);
        assert_eq!(parse_duration_literal("   "), None);
    }

    #[test]
    fn dedupe_keeps_oldest_createdat() {
        let older = test_descriptor("a", "First", Utc::now() - chrono::Duration::days(1));
        let newer = test_descriptor("a", "Second", Utc::now());
        let result = dedupe_keep_oldest(vec![newer, older]);
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.kept[0].name, "First");
        assert_eq!(result.dropped_warnings.len(), 1);
    }

    fn test_descriptor(slug: &str, name: &str, created_at: DateTime<Utc>) -> ScanDescriptor {
        ScanDescriptor {
            name: name.to_string(),
            slug: slug.to_string(),
            created_at,
            enabled: true,
            nas: dirsize_common::NasConfig {
                host: "nas".into(),
                port: 5001,
                username: "u".into(),
                secret: "s".into(),
                use_tls: true,
                verify_tls: true,
            },
            shares: vec!["homes".into()],
            paths: vec![],
            folders: vec![],
            interval: "1h".into(),
        }
    }
}
