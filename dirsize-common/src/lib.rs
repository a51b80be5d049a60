//! Shared types and error taxonomy for the dirsize scan orchestration core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SENTINEL_FOLDER_PATH: &str = "__SCAN_STATUS_MARKER__";

/// Connection details for one NAS. `secret` is never serialized back out to
/// public-facing views; callers that need a redacted copy should construct
/// one explicitly rather than relying on a skip-on-serialize flag here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NasConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub secret: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

fn default_port() -> u16 {
    5001
}

fn default_true() -> bool {
    true
}

/// A NasConfig with credentials stripped, safe to hand to a REST caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NasConfigPublic {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub use_tls: bool,
    pub verify_tls: bool,
}

impl From<&NasConfig> for NasConfigPublic {
    fn from(n: &NasConfig) -> Self {
        Self {
            host: n.host.clone(),
            port: n.port,
            username: n.username.clone(),
            use_tls: n.use_tls,
            verify_tls: n.verify_tls,
        }
    }
}

/// Configured unit of work. See the trigger grammar accepted by the
/// scheduler: either a duration literal (`N{s|m|h|d}`) or a five-field cron
/// expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDescriptor {
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub nas: NasConfig,
    #[serde(default)]
    pub shares: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    pub interval: String,
}

impl ScanDescriptor {
    /// Validates the invariants from the data model: at least one of
    /// shares/paths, folders only valid with exactly one share, no empty
    /// lists where a list is given.
    pub fn validate(&self) -> Result<()> {
        if self.shares.is_empty() && self.paths.is_empty() {
            return Err(Error::ConfigError(format!(
                "scan '{}': at least one of shares or paths is required",
                self.name
            )));
        }
        if self.shares.iter().any(|s| s.trim().is_empty())
            || self.paths.iter().any(|p| p.trim().is_empty())
            || self.folders.iter().any(|f| f.trim().is_empty())
        {
            return Err(Error::ConfigError(format!(
                "scan '{}': shares/paths/folders may not contain empty entries",
                self.name
            )));
        }
        if !self.folders.is_empty() && self.shares.len() != 1 {
            return Err(Error::ConfigError(format!(
                "scan '{}': folders requires exactly one share, found {}",
                self.name,
                self.shares.len()
            )));
        }
        Ok(())
    }
}

/// Execution status of a scan, at either the live or historical level.
/// `Pending` only ever appears at the control-surface level for a scan that
/// has never run; it is never written to a `ScanResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Outcome for one path within one `ScanResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResultItem {
    pub folder_name: String,
    pub success: bool,
    #[serde(default)]
    pub num_dir: Option<u64>,
    #[serde(default)]
    pub num_file: Option<u64>,
    #[serde(default)]
    pub total_size_bytes: Option<u64>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ScanResultItem {
    pub fn success(folder_name: String, num_dir: u64, num_file: u64, total_size_bytes: u64, elapsed_ms: u64) -> Self {
        Self {
            folder_name,
            success: true,
            num_dir: Some(num_dir),
            num_file: Some(num_file),
            total_size_bytes: Some(total_size_bytes),
            elapsed_ms: Some(elapsed_ms),
            error: None,
        }
    }

    pub fn failure(folder_name: String, error: impl Into<String>) -> Self {
        Self {
            folder_name,
            success: false,
            num_dir: None,
            num_file: None,
            total_size_bytes: None,
            elapsed_ms: None,
            error: Some(error.into()),
        }
    }
}

/// One execution of one `ScanDescriptor`. Identity is `(slug, timestamp)`.
/// `Running` is never persisted to the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub slug: String,
    pub scan_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: ScanStatus,
    pub items: Vec<ScanResultItem>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ScanResult {
    pub fn running(slug: impl Into<String>, scan_name: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            scan_name: scan_name.into(),
            timestamp: Utc::now(),
            status: ScanStatus::Running,
            items: Vec::new(),
            error: None,
        }
    }

    /// Derives the scan-level status from its items: completed if any
    /// succeeded, failed if none did.
    pub fn finalize(&mut self) {
        self.status = if self.items.iter().any(|i| i.success) {
            ScanStatus::Completed
        } else {
            ScanStatus::Failed
        };
    }
}

/// Row persisted in the history store, keyed by physical location rather
/// than by scan identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub nas_host: String,
    pub folder_path: String,
    pub slug: String,
    pub scan_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: ScanStatus,
    pub success: bool,
    pub num_dir: Option<u64>,
    pub num_file: Option<u64>,
    pub total_size_bytes: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
    pub scan_error: Option<String>,
}

impl StoredRecord {
    /// Derives the compact, collision-resistant primary key from the
    /// physical identity of the record: first 16 hex chars of the SHA-256 of
    /// `nasHost::folderPath::timestamp` truncated to whole seconds.
    pub fn derive_id(nas_host: &str, folder_path: &str, timestamp: &DateTime<Utc>) -> String {
        use sha2::{Digest, Sha256};
        let ts = timestamp
            .with_nanosecond(0)
            .unwrap_or(*timestamp)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let material = format!("{nas_host}::{folder_path}::{ts}");
        let digest = Sha256::digest(material.as_bytes());
        hex::encode(digest)[..16].to_string()
    }
}

use chrono::Timelike;

/// Error taxonomy consumed throughout the core. The NAS client recovers
/// transient HTTP conditions internally; everything semantic bubbles up
/// through these variants for classification further up the stack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("NAS authentication failed: {0}")]
    AuthError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("NAS API error {code}: {message}")]
    ApiError { code: i64, message: String },

    #[error("task lost: no longer known to the NAS")]
    LostTaskError,

    #[error("task timed out waiting for completion")]
    TimeoutError,

    #[error("task cancelled")]
    CancelledError,

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Self::ApiError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_descriptor_requires_shares_or_paths() {
        let d = ScanDescriptor {
            name: "x".into(),
            slug: "x".into(),
            created_at: Utc::now(),
            enabled: true,
            nas: NasConfig {
                host: "nas".into(),
                port: 5001,
                username: "u".into(),
                secret: "s".into(),
                use_tls: true,
                verify_tls: true,
            },
            shares: vec![],
            paths: vec![],
            folders: vec![],
            interval: "1h".into(),
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn scan_descriptor_folders_require_single_share() {
        let mut d = ScanDescriptor {
            name: "x".into(),
            slug: "x".into(),
            created_at: Utc::now(),
            enabled: true,
            nas: NasConfig {
                host: "nas".into(),
                port: 5001,
                username: "u".into(),
                secret: "s".into(),
                use_tls: true,
                verify_tls: true,
            },
            shares: vec!["homes".into(), "data".into()],
            paths: vec![],
            folders: vec!["docs".into()],
            interval: "1h".into(),
        };
        assert!(d.validate().is_err());
        d.shares = vec!["homes".into()];
        assert!(d.validate().is_ok());
    }

    #[test]
    fn scan_result_finalize_completed_on_any_success() {
        let mut r = ScanResult::running("docs", "Docs");
        r.items.push(ScanResultItem::failure("/a".into(), "boom"));
        r.items.push(ScanResultItem::success("/b".into(), 1, 2, 3, 4));
        r.finalize();
        assert_eq!(r.status, ScanStatus::Completed);
    }

    #[test]
    fn scan_result_finalize_failed_on_zero_success() {
        let mut r = ScanResult::running("docs", "Docs");
        r.items.push(ScanResultItem::failure("/a".into(), "boom"));
        r.finalize();
        assert_eq!(r.status, ScanStatus::Failed);
    }

    #[test]
    fn derive_id_is_deterministic_and_16_hex_chars() {
        let ts = Utc::now();
        let a = StoredRecord::derive_id("nas1", "/homes/docs", &ts);
        let b = StoredRecord::derive_id("nas1", "/homes/docs", &ts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn derive_id_differs_on_any_component() {
        let ts = Utc::now();
        let a = StoredRecord::derive_id("nas1", "/homes/docs", &ts);
        let b = StoredRecord::derive_id("nas2", "/homes/docs", &ts);
        assert_ne!(a, b);
    }
}
