use std::collections::HashSet;
use std::time::Duration;

use dirsize_common::{Error, NasConfig, Result};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::rate_limit::{jittered, RateLimiter};
use super::is_finished;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_CALL_SPACING: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 2;
const RETRYABLE_STATUS: [u16; 2] = [429, 503];

/// Status of one in-flight or finished dir-size task, as reported by
/// `PollDirSize`. `finished` is normalized via [`is_finished`] from
/// whatever representation the NAS sent.
#[derive(Debug, Clone)]
pub struct DirSizeStatus {
    pub finished: bool,
    pub num_dir: u64,
    pub num_file: u64,
    pub total_size: u64,
    pub progress: Option<f64>,
    pub processed_num: Option<u64>,
    pub total: Option<u64>,
    pub processing_path: Option<String>,
}

impl DirSizeStatus {
    fn from_json(v: &Value) -> Self {
        let get_u64 = |key: &str| -> u64 {
            v.get(key).and_then(|x| x.as_u64()).unwrap_or(0)
        };
        Self {
            finished: v.get("finished").map(is_finished).unwrap_or(false),
            num_dir: get_u64("num_dir"),
            num_file: get_u64("num_file"),
            total_size: get_u64("total_size"),
            progress: v.get("progress").and_then(|x| x.as_f64()),
            processed_num: v.get("processed_num").and_then(|x| x.as_u64()),
            total: v.get("total").and_then(|x| x.as_u64()),
            processing_path: v
                .get("processing_path")
                .and_then(|x| x.as_str())
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundTask {
    pub task_id: String,
    #[serde(default)]
    pub finished: Option<Value>,
}

/// Authenticated, rate-limited client for one NAS. A session id obtained
/// from `login` is attached to every subsequent `call`.
pub struct NasClient {
    config: NasConfig,
    http: reqwest::Client,
    sid: RwLock<Option<String>>,
    rate_limiter: RateLimiter,
    active_tasks: RwLock<HashSet<String>>,
}

impl NasClient {
    pub fn new(config: NasConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| Error::TransportError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            http,
            sid: RwLock::new(None),
            rate_limiter: RateLimiter::new(MIN_CALL_SPACING),
            active_tasks: RwLock::new(HashSet::new()),
        })
    }

    /// Authenticates against the NAS, storing the returned session id for
    /// use by subsequent calls.
    pub async fn login(&self) -> Result<()> {
        let mut params = Vec::new();
        params.push(("account".to_string(), self.config.username.clone()));
        params.push(("passwd".to_string(), self.config.secret.clone()));
        params.push(("session".to_string(), "DirSize".to_string()));
        params.push(("format".to_string(), "sid".to_string()));

        let body = self
            .call("SYNO.API.Auth", "login", "6", &params)
            .await
            .map_err(|e| match e {
                Error::ApiError { code, message } => {
                    Error::AuthError(format!("login rejected (code {code}): {message}"))
                }
                other => Error::AuthError(format!("login failed: {other}")),
            })?;

        let sid = body
            .get("sid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::AuthError("login response missing sid".into()))?
            .to_string();

        *self.sid.write().await = Some(sid);
        Ok(())
    }

    /// Idempotent: a logout with no active session is a no-op.
    pub async fn logout(&self) -> Result<()> {
        if self.sid.read().await.is_none() {
            return Ok(());
        }
        let _ = self.call("SYNO.API.Auth", "logout", "6", &[]).await;
        *self.sid.write().await = None;
        Ok(())
    }

    /// Generic authenticated RPC call. Enforces rate-limit spacing;
    /// retries transient failures; surfaces {160, 599} without retrying
    /// them so the poller can classify them semantically.
    pub async fn call(
        &self,
        api: &str,
        method: &str,
        version: &str,
        params: &[(String, String)],
    ) -> Result<Value> {
        let sid = self.sid.read().await.clone();
        let mut query = format!(
            "api={}&method={}&version={}",
            urlencoding::encode(api),
            urlencoding::encode(method),
            urlencoding::encode(version),
        );
        for (k, v) in params {
            query.push('&');
            query.push_str(&urlencoding::encode(k));
            query.push('=');
            query.push_str(&urlencoding::encode(v));
        }
        if let Some(sid) = sid {
            query.push_str("&_sid=");
            query.push_str(&urlencoding::encode(&sid));
        }

        let url = format!(
            "{}://{}:{}/webapi/entry.cgi?{}",
            if self.config.use_tls { "https" } else { "http" },
            self.config.host,
            self.config.port,
            query,
        );

        let mut attempt: u32 = 0;
        loop {
            self.rate_limiter.acquire().await;
            let resp = self.http.get(&url).send().await;

            match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|h| h.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok());
                        let body: Value = resp.json().await.map_err(|e| {
                            Error::TransportError(format!("invalid JSON response: {e}"))
                        })?;

                        if body.get("success").and_then(|v| v.as_bool()) == Some(true) {
                            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
                        }

                        let code = body
                            .get("error")
                            .and_then(|e| e.get("code"))
                            .and_then(|c| c.as_i64())
                            .unwrap_or(-1);
                        let message = format!("NAS API returned failure for {api}.{method}");

                        if RETRYABLE_STATUS.contains(&(code as u16)) && attempt < MAX_RETRIES {
                            attempt += 1;
                            let delay = retry_after
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| jittered(Duration::from_millis(500)));
                            warn!(api, method, code, attempt, "retrying NAS call after delay");
                            tokio::time::sleep(delay).await;
                            continue;
                        }

                        return Err(Error::ApiError { code, message });
                    }

                    let code = status.as_u16() as i64;
                    if RETRYABLE_STATUS.contains(&(status.as_u16())) && attempt < MAX_RETRIES {
                        attempt += 1;
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|h| h.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok());
                        let delay = retry_after
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| jittered(Duration::from_millis(500)));
                        warn!(api, method, status = status.as_u16(), attempt, "retrying NAS call");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(Error::ApiError {
                        code,
                        message: format!("HTTP {status} from {api}.{method}"),
                    });
                }
                Err(e) => {
                    if e.is_timeout() && attempt < MAX_RETRIES {
                        attempt += 1;
                        let delay = jittered(Duration::from_millis(500));
                        warn!(api, method, attempt, "retrying NAS call after timeout");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(Error::TransportError(e.to_string()));
                }
            }
        }
    }

    /// Starts a dir-size task for `path`, which must be absolute.
    pub async fn start_dir_size(&self, path: &str) -> Result<String> {
        if !path.starts_with('/') {
            return Err(Error::ConfigError(format!(
                "path must begin with '/': {path}"
            )));
        }
        let normalized = crate::path::normalize(path);
        let params = vec![("path".to_string(), format!("[\"{normalized}\"]"))];
        let body = self
            .call("SYNO.FileStation.DirSize", "start", "2", &params)
            .await?;
        let task_id = body
            .get("taskid")
            .or_else(|| body.get("task_id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::TransportError("StartDirSize response missing taskid".into())
            })?
            .to_string();
        self.active_tasks.write().await.insert(task_id.clone());
        Ok(task_id)
    }

    pub async fn poll_dir_size(&self, task_id: &str) -> Result<DirSizeStatus> {
        let params = vec![("taskid".to_string(), task_id.to_string())];
        let body = self
            .call("SYNO.FileStation.DirSize", "status", "2", &params)
            .await?;
        Ok(DirSizeStatus::from_json(&body))
    }

    /// `ignore_missing` silences a 599 (task already gone) response.
    pub async fn stop_task(&self, task_id: &str, ignore_missing: bool) -> Result<()> {
        let params = vec![("taskid".to_string(), task_id.to_string())];
        let result = self
            .call("SYNO.FileStation.DirSize", "stop", "2", &params)
            .await;
        self.active_tasks.write().await.remove(task_id);
        match result {
            Ok(_) => Ok(()),
            Err(Error::ApiError { code: 599, .. }) if ignore_missing => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_background_tasks(&self, filter: Option<&str>) -> Result<Vec<BackgroundTask>> {
        let mut params = Vec::new();
        if let Some(filter) = filter {
            params.push(("filter".to_string(), filter.to_string()));
        }
        let body = self
            .call("SYNO.FileStation.BackgroundTask", "list", "3", &params)
            .await?;
        let tasks = body
            .get("tasks")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tasks)
            .map_err(|e| Error::TransportError(format!("invalid task list response: {e}")))
    }

    /// Best-effort cleanup of any task ids this client started that are
    /// still tracked as active, ignoring "already gone" failures.
    pub async fn cleanup_active_tasks(&self) {
        let ids: Vec<String> = self.active_tasks.read().await.iter().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_task(&id, true).await {
                debug!(task_id = %id, error = %e, "best-effort task cleanup failed");
            }
        }
    }

    pub fn active_task_count(&self) -> usize {
        // Snapshot length without awaiting; used only for diagnostics, so a
        // try_read best-effort is acceptable here.
        self.active_tasks
            .try_read()
            .map(|g| g.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dir_size_status_parses_bool_finished() {
        let v = json!({"finished": true, "num_dir": 3, "num_file": 7, "total_size": 30000});
        let s = DirSizeStatus::from_json(&v);
        assert!(s.finished);
        assert_eq!(s.num_dir, 3);
        assert_eq!(s.num_file, 7);
        assert_eq!(s.total_size, 30000);
    }

    #[test]
    fn dir_size_status_parses_string_finished() {
        let v = json!({"finished": "true", "num_dir": 0, "num_file": 0, "total_size": 0});
        assert!(DirSizeStatus::from_json(&v).finished);
    }

    #[test]
    fn dir_size_status_defaults_missing_fields_to_zero() {
        let v = json!({});
        let s = DirSizeStatus::from_json(&v);
        assert!(!s.finished);
        assert_eq!(s.num_dir, 0);
        assert_eq!(s.total_size, 0);
    }
}
