//! Configuration loading and validation.
//!
//! Settings come from three layers, highest priority last: built-in
//! defaults, the YAML config file, then environment variable overrides
//! (spec.md §6). Invalid scan descriptors are rejected with a field-level
//! error pointing at the offending scan rather than failing the whole load.

use std::path::{Path, PathBuf};

use chrono::Utc;
use dirsize_common::{Error, NasConfig, Result, ScanDescriptor};
use serde::{Deserialize, Serialize};

use crate::slug::generate_slug;

/// One scan entry as written in the YAML file. `slug`/`createdAt` are
/// optional on disk; `Config::load` fills them in deterministically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfigYaml {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub nas: NasConfigYaml,
    #[serde(default)]
    pub shares: Option<Vec<String>>,
    #[serde(default)]
    pub folders: Option<Vec<String>>,
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    pub interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NasConfigYaml {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub use_https: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfigYaml {
    pub db_path: Option<String>,
    pub storage_dir: Option<String>,
    pub max_history: Option<usize>,
    pub retention_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub scans: Vec<ScanConfigYaml>,
    #[serde(default)]
    pub storage: Option<StorageConfigYaml>,
}

/// Fully resolved, validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub scans: Vec<ScanDescriptor>,
    pub database_url: String,
    pub max_history: usize,
    pub retention_days: i64,
    pub max_parallel_tasks: usize,
    pub default_execution_mode: ExecutionMode,
    pub enable_logs: LogLevel,
    pub verify_tls_override: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Info,
    Debug,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "info" => Self::Info,
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Off,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

const DEFAULT_MAX_HISTORY: usize = 1000;
const DEFAULT_RETENTION_DAYS: i64 = 90;
const DEFAULT_MAX_PARALLEL: usize = 3;
const MAX_PARALLEL_CAP: usize = 10;

impl Config {
    /// Loads from `path`, applying scan validation and the duplicate-slug
    /// keep-oldest policy, then overlays environment variable overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read config file {}: {e}", path.display()))
        })?;
        let file: ConfigFile = serde_yaml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("failed to parse config file: {e}")))?;
        Self::from_file(file)
    }

    pub fn from_file(file: ConfigFile) -> Result<Self> {
        let mut descriptors = Vec::with_capacity(file.scans.len());
        for (idx, raw) in file.scans.into_iter().enumerate() {
            descriptors.push(resolve_scan(raw).map_err(|e| {
                Error::ConfigError(format!("scan at index {idx}: {e}"))
            })?);
        }

        for d in &descriptors {
            d.validate()?;
        }

        // Duplicate-slug resolution (keep-oldest) happens once the
        // descriptors reach the scheduler, not here.
        let storage = file.storage.unwrap_or_default();
        let database_url = resolve_database_url(&storage);

        let mut config = Self {
            scans: descriptors,
            database_url,
            max_history: storage.max_history.unwrap_or(DEFAULT_MAX_HISTORY),
            retention_days: storage.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
            max_parallel_tasks: DEFAULT_MAX_PARALLEL,
            default_execution_mode: ExecutionMode::Parallel,
            enable_logs: LogLevel::Off,
            verify_tls_override: None,
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENABLE_LOGS") {
            self.enable_logs = LogLevel::parse(&v);
        }
        if let Ok(v) = std::env::var("MAX_PARALLEL_TASKS") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_parallel_tasks = n.clamp(1, MAX_PARALLEL_CAP);
            }
        }
        if let Ok(v) = std::env::var("DEFAULT_EXECUTION_MODE") {
            self.default_execution_mode = match v.to_ascii_lowercase().as_str() {
                "sequential" => ExecutionMode::Sequential,
                _ => ExecutionMode::Parallel,
            };
        }
        if self.default_execution_mode == ExecutionMode::Sequential {
            self.max_parallel_tasks = 1;
        }
        if let Ok(v) = std::env::var("VERIFY_TLS") {
            if let Ok(b) = v.parse::<bool>() {
                self.verify_tls_override = Some(b);
            }
        }
        if let Some(override_value) = self.verify_tls_override {
            for scan in &mut self.scans {
                scan.nas.verify_tls = override_value;
            }
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            if self.database_url.starts_with("sqlite://") {
                let path = PathBuf::from(v).join("history.db");
                self.database_url = format!("sqlite://{}", path.display());
            }
        }
    }
}

fn resolve_database_url(storage: &StorageConfigYaml) -> String {
    if let Some(db_path) = &storage.db_path {
        return format!("sqlite://{db_path}");
    }
    let dir = storage
        .storage_dir
        .clone()
        .unwrap_or_else(|| "./data".to_string());
    format!("sqlite://{}/history.db", dir.trim_end_matches('/'))
}

fn resolve_scan(raw: ScanConfigYaml) -> Result<ScanDescriptor> {
    let slug = raw
        .slug
        .unwrap_or_else(|| generate_slug(&raw.name));
    let created_at = raw.created_at.unwrap_or_else(Utc::now);

    Ok(ScanDescriptor {
        name: raw.name,
        slug,
        created_at,
        enabled: raw.enabled,
        nas: NasConfig {
            host: raw.nas.host,
            port: raw.nas.port.unwrap_or(if raw.nas.use_https { 5001 } else { 5000 }),
            username: raw.nas.username,
            secret: raw.nas.password,
            use_tls: raw.nas.use_https,
            verify_tls: raw.nas.verify_ssl,
        },
        shares: raw.shares.unwrap_or_default(),
        paths: raw.paths.unwrap_or_default(),
        folders: raw.folders.unwrap_or_default(),
        interval: raw.interval,
    })
}

/// Resolves the config file path from `CONFIG_PATH`, then a small set of
/// conventional locations.
pub fn find_config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CONFIG_PATH") {
        return Some(PathBuf::from(p));
    }
    for candidate in ["./config.yaml", "./config.yml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_yaml(name: &str) -> ScanConfigYaml {
        ScanConfigYaml {
            name: name.to_string(),
            slug: None,
            created_at: None,
            enabled: true,
            nas: NasConfigYaml {
                host: "nas.local".into(),
                port: None,
                username: "u".into(),
                password: "p".into(),
                use_https: true,
                verify_ssl: true,
            },
            shares: Some(vec!["homes".into()]),
            folders: None,
            paths: None,
            interval: "1h".into(),
        }
    }

    #[test]
    fn resolve_scan_generates_slug_from_name_when_absent() {
        let d = resolve_scan(scan_yaml("Home Documents")).unwrap();
        assert_eq!(d.slug, "home-documents");
    }

    #[test]
    fn resolve_scan_defaults_port_from_https_flag() {
        let d = resolve_scan(scan_yaml("Docs")).unwrap();
        assert_eq!(d.nas.port, 5001);
    }

    #[test]
    fn from_file_rejects_scan_with_neither_shares_nor_paths() {
        let mut raw = scan_yaml("Broken");
        raw.shares = None;
        let file = ConfigFile {
            scans: vec![raw],
            storage: None,
        };
        assert!(Config::from_file(file).is_err());
    }

    #[test]
    fn from_file_leaves_duplicate_slugs_for_the_scheduler_to_resolve() {
        // Keep-oldest dedup happens in the scheduler, not at load time.
        let file = ConfigFile {
            scans: vec![scan_yaml("Docs"), scan_yaml("Docs")],
            storage: None,
        };
        let config = Config::from_file(file).unwrap();
        assert_eq!(config.scans[0].slug, "docs");
        assert_eq!(config.scans[1].slug, "docs");
    }

    #[test]
    fn verify_tls_env_override_applies_to_every_scan() {
        std::env::set_var("VERIFY_TLS", "false");
        let file = ConfigFile {
            scans: vec![scan_yaml("Docs")],
            storage: None,
        };
        let config = Config::from_file(file).unwrap();
        std::env::remove_var("VERIFY_TLS");
        assert!(!config.scans[0].nas.verify_tls);
    }

    #[test]
    fn database_url_prefers_db_path_over_storage_dir() {
        let storage = StorageConfigYaml {
            db_path: Some("/var/lib/dirsize/history.db".into()),
            storage_dir: Some("/ignored".into()),
            max_history: None,
            retention_days: None,
        };
        assert_eq!(
            resolve_database_url(&storage),
            "sqlite:///var/lib/dirsize/history.db"
        );
    }
}
