//! TaskingConfig - タイミングとキュー名の設定
//!
//! TOML から読み込み、欠けているキーはデフォルト値で埋めます。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskingConfig {
    /// Heartbeat TTL. Also the TTL of leader leases.
    pub worker_ttl_ms: u64,
    /// Worker heartbeat period and leader tick.
    pub heartbeat_interval_ms: u64,
    pub reaper_interval_ms: u64,
    /// Delay between two reservation attempts for the same task.
    pub acquire_backoff_ms: u64,
    pub intake_queue: String,
    pub dispatcher_lease: String,
    /// Job name that runs inside the dispatcher with no reservation live.
    pub maintenance_job: String,
    pub worker_prefix: String,
    pub dispatcher_prefix: String,
}

impl Default for TaskingConfig {
    fn default() -> Self {
        Self {
            worker_ttl_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            reaper_interval_ms: 10_000,
            acquire_backoff_ms: 250,
            intake_queue: "resource_manager".to_string(),
            dispatcher_lease: "dispatcher".to_string(),
            maintenance_job: "tether.maintenance.cleanup".to_string(),
            worker_prefix: "worker".to_string(),
            dispatcher_prefix: "dispatcher".to_string(),
        }
    }
}

impl TaskingConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timings = [
            ("worker_ttl_ms", self.worker_ttl_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reaper_interval_ms", self.reaper_interval_ms),
            ("acquire_backoff_ms", self.acquire_backoff_ms),
        ];
        for (key, value) in timings {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
            }
        }
        if self.heartbeat_interval_ms >= self.worker_ttl_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms ({}) must be shorter than worker_ttl_ms ({})",
                self.heartbeat_interval_ms, self.worker_ttl_ms
            )));
        }
        let names = [
            ("intake_queue", &self.intake_queue),
            ("dispatcher_lease", &self.dispatcher_lease),
            ("maintenance_job", &self.maintenance_job),
            ("worker_prefix", &self.worker_prefix),
            ("dispatcher_prefix", &self.dispatcher_prefix),
        ];
        for (key, value) in names {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{key} must not be empty")));
            }
        }
        if self.worker_prefix == self.dispatcher_prefix {
            return Err(ConfigError::Invalid(
                "worker_prefix and dispatcher_prefix must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn worker_ttl(&self) -> Duration {
        Duration::from_millis(self.worker_ttl_ms)
    }

    /// Same TTL as `worker_ttl`, for timestamp arithmetic.
    pub fn worker_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.worker_ttl_ms.min(i64::MAX as u64) as i64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_document_yields_defaults() {
        let config = TaskingConfig::from_toml_str("").unwrap();
        assert_eq!(config, TaskingConfig::default());
        assert_eq!(config.worker_ttl(), Duration::from_secs(30));
        assert_eq!(config.intake_queue, "resource_manager");
    }

    #[test]
    fn partial_document_overrides_only_given_keys() {
        let config = TaskingConfig::from_toml_str(
            r#"
            worker_ttl_ms = 1000
            heartbeat_interval_ms = 100
            worker_prefix = "reserved-resource-worker"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_ttl_ms, 1000);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(100));
        assert_eq!(config.worker_prefix, "reserved-resource-worker");
        assert_eq!(config.acquire_backoff_ms, 250);
    }

    #[rstest]
    #[case("worker_ttl_ms = 0")]
    #[case("acquire_backoff_ms = 0")]
    #[case("heartbeat_interval_ms = 30000")]
    #[case("intake_queue = \"\"")]
    #[case("dispatcher_prefix = \"worker\"")]
    fn invalid_values_are_rejected(#[case] doc: &str) {
        assert!(matches!(
            TaskingConfig::from_toml_str(doc),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            TaskingConfig::from_toml_str("worker_tll_ms = 10"),
            Err(ConfigError::Parse(_))
        ));
    }
}
