use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine settings, usually read from `toba.toml`. Every field has a default so
/// an empty file (or no file at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory containing `adb` and `fastboot`.
    pub tools_dir: Option<PathBuf>,
    /// Upper bound for any single non-write device command.
    pub command_timeout_secs: u64,
    /// Upper bound for a single partition write.
    pub write_timeout_secs: u64,
    pub transition: TransitionConfig,
    pub retry: RetryPolicy,
    pub executor: ExecutorOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tools_dir: None,
            command_timeout_secs: 120,
            write_timeout_secs: 600,
            transition: TransitionConfig::default(),
            retry: RetryPolicy::default(),
            executor: ExecutorOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransitionConfig {
    /// How long to wait for the target mode to show up after a reboot command.
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Grace period after issuing the reboot before the first poll; the device
    /// usually still reports its old mode for a moment.
    pub settle_ms: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            poll_interval_ms: 1000,
            settle_ms: 3000,
        }
    }
}

impl TransitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Retry policy for transient transport errors. Only idempotent commands
/// (status and variable queries, partition reads) are ever retried; writes,
/// erases, slot switches and reboots run exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorOptions {
    /// Keep going after a failed `WAIT` or `VERIFY` read. Checksum mismatches
    /// and destructive failures always halt the plan.
    pub continue_on_nondestructive_failure: bool,
    /// Skip a `FLASH` whose following `VERIFY` already matches the device.
    pub skip_verified_partitions: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            continue_on_nondestructive_failure: true,
            skip_verified_partitions: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.transition.timeout(), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_config() {
        let config = EngineConfig::from_toml_str(
            r#"
            tools_dir = "C:/tools/platform-tools"
            command_timeout_secs = 30

            [transition]
            timeout_secs = 90

            [executor]
            skip_verified_partitions = true
            "#,
        )
        .unwrap();
        assert_eq!(config.tools_dir, Some(PathBuf::from("C:/tools/platform-tools")));
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.transition.timeout_secs, 90);
        assert_eq!(config.transition.poll_interval_ms, 1000);
        assert!(config.executor.skip_verified_partitions);
        assert!(config.executor.continue_on_nondestructive_failure);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(EngineConfig::from_toml_str("retries = 4").is_err());
    }
}
