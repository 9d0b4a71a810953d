use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use quorum_core::WorkerUnit;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuorumSettings {
    pub server: ServerSettings,
    pub pool: PoolSettings,
    pub router: RouterSettings,
    pub session: SessionSettings,
    pub transport: TransportSettings,
    pub logging: LoggingSettings,
}

impl QuorumSettings {
    /// Reject combinations the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SettingsError::InvalidValue("server.port must be non-zero".into()));
        }
        if !(1..=3).contains(&self.router.max_attempts) {
            return Err(SettingsError::InvalidValue(format!(
                "router.maxAttempts must be between 1 and 3, got {}",
                self.router.max_attempts
            )));
        }
        if self.session.max_parties < 2 {
            return Err(SettingsError::InvalidValue(format!(
                "session.maxParties must be at least 2, got {}",
                self.session.max_parties
            )));
        }
        let mut names = HashSet::new();
        for unit in &self.pool.workers {
            if !names.insert(unit.name.as_str()) {
                return Err(SettingsError::InvalidValue(format!(
                    "duplicate worker name in pool.workers: {}",
                    unit.name
                )));
            }
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound on one HTTP request, including a whole session run.
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_ms: 120_000,
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Worker pool and provisioning settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// How long `allocate` waits for enough idle units.
    pub allocate_timeout_ms: u64,
    /// Ask the provisioner for more units when capacity runs short.
    pub auto_provision: bool,
    /// Units to create at startup if fewer are running.
    pub min_idle: usize,
    /// Static roster of running workers.
    pub workers: Vec<WorkerUnit>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            allocate_timeout_ms: 5_000,
            auto_provision: false,
            min_idle: 0,
            workers: (1..=5)
                .map(|i| WorkerUnit::new(format!("party-{i}"), format!("127.0.0.1:{}", 9100 + i)))
                .collect(),
        }
    }
}

impl PoolSettings {
    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_millis(self.allocate_timeout_ms)
    }
}

/// Delivery retry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    /// Total attempts per delivery, including the first.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 50,
            call_timeout_ms: 5_000,
        }
    }
}

/// Per-session limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub timeout_ms: u64,
    /// How long a completed party keeps flushing its last messages.
    pub flush_timeout_ms: u64,
    pub max_parties: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            flush_timeout_ms: 2_000,
            max_parties: 16,
        }
    }
}

/// How envelopes reach their recipients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Every party runs inside this process.
    #[default]
    Local,
    /// Parties are remote workers reached over HTTP.
    Http,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    pub mode: TransportMode,
    pub scheme: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            mode: TransportMode::Local,
            scheme: "http".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"quorum_coordinator": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            modules: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = QuorumSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.router.max_attempts, 3);
        assert!(!settings.pool.auto_provision);
        assert_eq!(settings.pool.workers.len(), 5);
        assert_eq!(settings.transport.mode, TransportMode::Local);
    }

    #[test]
    fn zero_port_rejected() {
        let mut settings = QuorumSettings::default();
        settings.server.port = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn attempts_out_of_range_rejected() {
        let mut settings = QuorumSettings::default();
        settings.router.max_attempts = 4;
        assert!(settings.validate().is_err());
        settings.router.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn max_parties_below_two_rejected() {
        let mut settings = QuorumSettings::default();
        settings.session.max_parties = 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn duplicate_worker_names_rejected() {
        let mut settings = QuorumSettings::default();
        settings.pool.workers = vec![
            WorkerUnit::new("w1", "10.0.0.1:9000"),
            WorkerUnit::new("w1", "10.0.0.2:9000"),
        ];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("w1"), "got: {err}");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(QuorumSettings::default()).unwrap();
        assert_eq!(json["pool"]["allocateTimeoutMs"], 5_000);
        assert_eq!(json["router"]["maxAttempts"], 3);
        assert_eq!(json["transport"]["mode"], "local");
    }
}
