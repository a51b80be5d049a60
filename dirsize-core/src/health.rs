//! Health and readiness probes: database (HistoryStore), scheduler, NAS
//! reachability.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::storage::HistoryStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: i64,
    pub components: Vec<ComponentHealth>,
    pub config_warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub reason: Option<String>,
    pub timestamp: i64,
}

pub struct HealthChecker {
    start_time: Instant,
    version: String,
}

impl HealthChecker {
    pub fn new(version: &str) -> Self {
        Self {
            start_time: Instant::now(),
            version: version.to_string(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn liveness(&self) -> LivenessResponse {
        LivenessResponse {
            alive: true,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub async fn check_database(&self, store: &HistoryStore) -> ComponentHealth {
        let start = Instant::now();
        match store.health_check().await {
            Ok(_) => ComponentHealth {
                name: "database".to_string(),
                status: HealthStatus::Healthy,
                message: Some("connected".to_string()),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => ComponentHealth {
                name: "database".to_string(),
                status: HealthStatus::Unhealthy,
                message: Some(format!("connection failed: {e}")),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
        }
    }

    pub fn check_scheduler(&self, running: bool, job_count: usize) -> ComponentHealth {
        ComponentHealth {
            name: "scheduler".to_string(),
            status: if running {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: Some(format!("{job_count} job(s) registered, running: {running}")),
            latency_ms: Some(0),
        }
    }

    /// Reports degraded rather than unhealthy on NAS unreachability: a
    /// single misbehaving NAS host should not flip the whole service
    /// unready while other scans keep working.
    pub fn check_nas(&self, host: &str, reachable: bool, detail: Option<String>) -> ComponentHealth {
        ComponentHealth {
            name: format!("nas:{host}"),
            status: if reachable {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: detail,
            latency_ms: None,
        }
    }

    fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
        let mut has_unhealthy = false;
        let mut has_degraded = false;
        for c in components {
            match c.status {
                HealthStatus::Unhealthy => has_unhealthy = true,
                HealthStatus::Degraded => has_degraded = true,
                HealthStatus::Healthy => {}
            }
        }
        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn build_response(
        &self,
        components: Vec<ComponentHealth>,
        config_warnings: Vec<String>,
    ) -> HealthResponse {
        let status = Self::aggregate_status(&components);
        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            timestamp: chrono::Utc::now().timestamp(),
            components,
            config_warnings,
        }
    }

    /// Ready iff the database component is healthy; a degraded NAS or
    /// scheduler still allows the service to accept control-surface traffic.
    pub fn readiness(&self, components: &[ComponentHealth]) -> ReadinessResponse {
        let db_healthy = components
            .iter()
            .find(|c| c.name == "database")
            .map(|c| c.status == HealthStatus::Healthy)
            .unwrap_or(false);

        if db_healthy {
            ReadinessResponse {
                ready: true,
                reason: None,
                timestamp: chrono::Utc::now().timestamp(),
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some("database not ready".to_string()),
                timestamp: chrono::Utc::now().timestamp(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, status: HealthStatus) -> ComponentHealth {
        ComponentHealth {
            name: name.to_string(),
            status,
            message: None,
            latency_ms: Some(1),
        }
    }

    #[test]
    fn aggregate_status_is_healthy_when_all_components_healthy() {
        let components = vec![
            component("database", HealthStatus::Healthy),
            component("scheduler", HealthStatus::Healthy),
        ];
        assert_eq!(
            HealthChecker::aggregate_status(&components),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn aggregate_status_degrades_on_any_degraded_component() {
        let components = vec![
            component("database", HealthStatus::Healthy),
            component("nas:nas1", HealthStatus::Degraded),
        ];
        assert_eq!(
            HealthChecker::aggregate_status(&components),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn aggregate_status_is_unhealthy_if_any_component_unhealthy() {
        let components = vec![
            component("database", HealthStatus::Unhealthy),
            component("scheduler", HealthStatus::Healthy),
        ];
        assert_eq!(
            HealthChecker::aggregate_status(&components),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn readiness_requires_healthy_database() {
        let checker = HealthChecker::new("0.1.0");
        let components = vec![component("database", HealthStatus::Degraded)];
        let resp = checker.readiness(&components);
        assert!(!resp.ready);
        assert!(resp.reason.is_some());
    }

    #[test]
    fn liveness_always_reports_alive() {
        let checker = HealthChecker::new("0.1.0");
        assert!(checker.liveness().alive);
    }
}
