//! Adaptive, fault-tolerant polling state machine: drives one remote
//! dir-size task from `Starting` through `Polling` to a terminal state.

use std::time::Duration;

use dirsize_common::{Error, Result};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::nas::{is_finished, DirSizeStatus, NasClient};

const MIN_INTERVAL: Duration = Duration::from_secs(2);
const MAX_INTERVAL: Duration = Duration::from_secs(10);
const INITIAL_DELAY: Duration = Duration::from_secs(3);
const ERROR_599_SLEEP: Duration = Duration::from_secs(5);
const MAX_599: u32 = 3;
const MAX_FAILED_POLLS: u32 = 5;
const NO_PROGRESS_THRESHOLD: u32 = 3;
const INTERVAL_STEP: Duration = Duration::from_secs(2);
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);
const LOOKUP_599_PAUSE: Duration = Duration::from_secs(3);

/// Emitted on every successful, not-yet-finished poll. Must be consumed
/// quickly — it updates in-memory state only, never blocks on I/O.
#[derive(Debug, Clone)]
pub struct PollProgress {
    pub num_dir: u64,
    pub num_file: u64,
    pub total_size: u64,
    pub waited: Duration,
    pub finished: bool,
}

/// Successful terminal result of one path's polling run.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub num_dir: u64,
    pub num_file: u64,
    pub total_size_bytes: u64,
    pub elapsed_ms: u64,
}

struct TaskHandle {
    task_id: String,
    no_progress_polls: u32,
    error599_count: u32,
    failed_polls: u32,
    current_interval: Duration,
    last_progress: Option<f64>,
    last_size_bytes: u64,
    last_dirs: u64,
    last_files: u64,
    last_processed: u64,
}

impl TaskHandle {
    fn new(task_id: String) -> Self {
        Self {
            task_id,
            no_progress_polls: 0,
            error599_count: 0,
            failed_polls: 0,
            current_interval: MIN_INTERVAL,
            last_progress: None,
            last_size_bytes: 0,
            last_dirs: 0,
            last_files: 0,
            last_processed: 0,
        }
    }

    /// Rule 5: progress is detected if any tracked metric strictly
    /// increased since the previous poll.
    fn observe_progress(&mut self, status: &DirSizeStatus) -> bool {
        let progressed = status
            .progress
            .zip(self.last_progress)
            .map(|(now, prev)| now > prev)
            .unwrap_or(status.progress.is_some() && self.last_progress.is_none() && status.progress.unwrap_or(0.0) > 0.0)
            || status.total_size > self.last_size_bytes
            || status.num_dir > self.last_dirs
            || status.num_file > self.last_files
            || status.processed_num.unwrap_or(0) > self.last_processed;

        self.last_progress = status.progress.or(self.last_progress);
        self.last_size_bytes = status.total_size;
        self.last_dirs = status.num_dir;
        self.last_files = status.num_file;
        self.last_processed = status.processed_num.unwrap_or(self.last_processed);

        if progressed {
            self.current_interval = MIN_INTERVAL;
            self.no_progress_polls = 0;
        } else {
            self.no_progress_polls += 1;
            if self.no_progress_polls >= NO_PROGRESS_THRESHOLD {
                self.current_interval =
                    (self.current_interval + INTERVAL_STEP).min(MAX_INTERVAL);
            }
        }
        progressed
    }
}

pub struct PollingEngine<'a> {
    client: &'a NasClient,
    max_wait: Duration,
}

impl<'a> PollingEngine<'a> {
    pub fn new(client: &'a NasClient) -> Self {
        Self {
            client,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn with_max_wait(client: &'a NasClient, max_wait: Duration) -> Self {
        Self { client, max_wait }
    }

    fn cancelled(cancel: &watch::Receiver<bool>) -> bool {
        *cancel.borrow()
    }

    async fn stop_best_effort(&self, task_id: &str) {
        if let Err(e) = self.client.stop_task(task_id, true).await {
            debug!(task_id, error = %e, "best-effort StopTask failed during termination");
        }
    }

    fn outcome(status: &DirSizeStatus, start_time: Instant) -> PollOutcome {
        PollOutcome {
            num_dir: status.num_dir,
            num_file: status.num_file,
            total_size_bytes: status.total_size,
            elapsed_ms: start_time.elapsed().as_millis() as u64,
        }
    }

    /// Drives `StartDirSize -> poll -> finished|terminated` for one path.
    /// `on_progress` is called synchronously on each successful,
    /// not-yet-finished poll.
    pub async fn run(
        &self,
        path: &str,
        mut cancel: watch::Receiver<bool>,
        mut on_progress: impl FnMut(PollProgress),
    ) -> Result<PollOutcome> {
        let start_time = Instant::now();
        let task_id = self.client.start_dir_size(path).await?;
        let mut handle = TaskHandle::new(task_id.clone());

        if Self::cancelled(&cancel) {
            self.stop_best_effort(&task_id).await;
            return Err(Error::CancelledError);
        }
        sleep(INITIAL_DELAY).await;
        if Self::cancelled(&cancel) {
            self.stop_best_effort(&task_id).await;
            return Err(Error::CancelledError);
        }

        // InitialPoll
        match self.client.poll_dir_size(&task_id).await {
            Ok(status) if status.finished => return Ok(Self::outcome(&status, start_time)),
            Ok(status) => {
                handle.observe_progress(&status);
                on_progress(PollProgress {
                    num_dir: status.num_dir,
                    num_file: status.num_file,
                    total_size: status.total_size,
                    waited: start_time.elapsed(),
                    finished: false,
                });
            }
            Err(Error::ApiError { code: 160, .. }) => {
                sleep(Duration::from_secs(2)).await;
                return match self.client.poll_dir_size(&task_id).await {
                    Ok(status) if status.finished => Ok(Self::outcome(&status, start_time)),
                    _ => Err(Error::LostTaskError),
                };
            }
            Err(Error::ApiError { code: 599, .. }) => {
                handle.error599_count = 1;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "initial poll failed, treating as transient");
                handle.failed_polls = 1;
            }
        }

        loop {
            if Self::cancelled(&cancel) {
                self.stop_best_effort(&task_id).await;
                return Err(Error::CancelledError);
            }

            let sleep_for = if handle.error599_count > 0 {
                ERROR_599_SLEEP
            } else {
                handle.current_interval
            };
            sleep(sleep_for).await;

            if Self::cancelled(&cancel) {
                self.stop_best_effort(&task_id).await;
                return Err(Error::CancelledError);
            }

            let waited = start_time.elapsed();
            if waited >= self.max_wait {
                return match self.client.poll_dir_size(&task_id).await {
                    Ok(status) if status.finished => Ok(Self::outcome(&status, start_time)),
                    _ => Err(Error::TimeoutError),
                };
            }

            match self.client.poll_dir_size(&task_id).await {
                Ok(status) if status.finished => return Ok(Self::outcome(&status, start_time)),
                Ok(status) => {
                    handle.observe_progress(&status);
                    on_progress(PollProgress {
                        num_dir: status.num_dir,
                        num_file: status.num_file,
                        total_size: status.total_size,
                        waited: start_time.elapsed(),
                        finished: false,
                    });
                }
                Err(Error::ApiError { code: 160, .. }) => {
                    return Err(Error::LostTaskError);
                }
                Err(Error::ApiError { code: 599, .. }) => {
                    handle.error599_count += 1;
                    if handle.error599_count == 2 {
                        match self.client.list_background_tasks(None).await {
                            Ok(tasks) => {
                                if tasks.iter().any(|t| t.task_id == task_id) {
                                    handle.error599_count = 0;
                                    sleep(LOOKUP_599_PAUSE).await;
                                }
                            }
                            Err(e) => {
                                debug!(task_id = %task_id, error = %e, "ListBackgroundTasks failed during 599 lookup");
                            }
                        }
                    } else if handle.error599_count >= MAX_599 {
                        match self.client.list_background_tasks(None).await {
                            Ok(tasks) => match tasks.iter().find(|t| t.task_id == task_id) {
                                Some(t)
                                    if t.finished.as_ref().map(is_finished).unwrap_or(false) =>
                                {
                                    return match self.client.poll_dir_size(&task_id).await {
                                        Ok(status) => Ok(Self::outcome(&status, start_time)),
                                        Err(_) => Err(Error::LostTaskError),
                                    };
                                }
                                Some(_) => {
                                    handle.error599_count = 0;
                                }
                                None => {
                                    return match self.client.poll_dir_size(&task_id).await {
                                        Ok(status) if status.finished => {
                                            Ok(Self::outcome(&status, start_time))
                                        }
                                        _ => Err(Error::LostTaskError),
                                    };
                                }
                            },
                            Err(_) => return Err(Error::LostTaskError),
                        }
                    }
                }
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "poll failed, counting toward failedPolls budget");
                    handle.failed_polls += 1;
                    if handle.failed_polls >= MAX_FAILED_POLLS {
                        match self.client.list_background_tasks(None).await {
                            Ok(tasks) if tasks.iter().any(|t| t.task_id == task_id) => {
                                handle.failed_polls = 0;
                            }
                            _ => return Err(Error::LostTaskError),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(finished: bool, dir: u64, file: u64, size: u64) -> DirSizeStatus {
        DirSizeStatus {
            finished,
            num_dir: dir,
            num_file: file,
            total_size: size,
            progress: None,
            processed_num: None,
            total: None,
            processing_path: None,
        }
    }

    #[test]
    fn observe_progress_resets_interval_on_growth() {
        let mut h = TaskHandle::new("t1".into());
        h.current_interval = MAX_INTERVAL;
        h.no_progress_polls = 5;
        let progressed = h.observe_progress(&status(false, 2, 5, 100));
        assert!(progressed);
        assert_eq!(h.current_interval, MIN_INTERVAL);
        assert_eq!(h.no_progress_polls, 0);
    }

    #[test]
    fn observe_progress_backs_off_after_three_stalls() {
        let mut h = TaskHandle::new("t1".into());
        let same = status(false, 2, 5, 100);
        h.observe_progress(&same);
        assert!(!h.observe_progress(&same));
        assert!(!h.observe_progress(&same));
        assert_eq!(h.current_interval, MIN_INTERVAL);
        assert!(!h.observe_progress(&same));
        assert_eq!(h.current_interval, MIN_INTERVAL + INTERVAL_STEP);
    }

    #[test]
    fn observe_progress_never_exceeds_max_interval() {
        let mut h = TaskHandle::new("t1".into());
        let same = status(false, 2, 5, 100);
        for _ in 0..20 {
            h.observe_progress(&same);
        }
        assert!(h.current_interval <= MAX_INTERVAL);
    }

    #[test]
    fn finished_predicate_reused_from_nas_module() {
        assert!(is_finished(&json!(true)));
        assert!(!is_finished(&json!(false)));
    }

    #[test]
    fn observe_progress_detects_processed_num_growth_alone() {
        let mut h = TaskHandle::new("t1".into());
        let mut s = status(false, 2, 5, 100);
        s.processed_num = Some(10);
        h.observe_progress(&s); // baseline poll, establishes last_processed = 10

        h.current_interval = MAX_INTERVAL;
        h.no_progress_polls = 5;
        assert!(!h.observe_progress(&s), "no axis grew, should not count as progress");

        s.processed_num = Some(20);
        assert!(
            h.observe_progress(&s),
            "processed_num alone grew, should count as progress"
        );
        assert_eq!(h.current_interval, MIN_INTERVAL);
    }
}
