//! The device transport seam.
//!
//! The engine never talks USB or TCP itself. Everything it needs from a device
//! goes through [`Transport`]: a typed command in, raw reply bytes out, plus a
//! mode poll. [`crate::tools::PlatformTools`] implements it on top of the adb and
//! fastboot executables, [`crate::sim::SimulatedDevice`] in memory.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{EngineConfig, RetryPolicy};
use crate::device::{DeviceMode, Slot};
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootTarget {
    System,
    Bootloader,
    Fastbootd,
    Sideload,
}

impl RebootTarget {
    /// Mode the device should come up in after this reboot.
    pub fn resulting_mode(self) -> DeviceMode {
        match self {
            RebootTarget::System => DeviceMode::Adb,
            RebootTarget::Bootloader => DeviceMode::Bootloader,
            RebootTarget::Fastbootd => DeviceMode::Fastbootd,
            RebootTarget::Sideload => DeviceMode::Sideload,
        }
    }
}

/// Reply encoding per command: `GetVar` answers with the UTF-8 value,
/// `ReadPartition` with the raw partition bytes, `PartitionTable` with one
/// `name size` pair per line. Everything else answers with the tool output,
/// which callers treat as informational.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    Reboot(RebootTarget),
    GetVar(String),
    Flash {
        partition: String,
        data: Arc<[u8]>,
        disable_verity: bool,
    },
    ReadPartition(String),
    Erase(String),
    SetActive(Slot),
    CreateLogical { name: String, size: u64 },
    DeleteLogical(String),
    PartitionTable,
}

impl DeviceCommand {
    /// Safe to repeat after a transient failure.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            DeviceCommand::GetVar(_) | DeviceCommand::ReadPartition(_) | DeviceCommand::PartitionTable
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(self, DeviceCommand::Flash { .. })
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::Reboot(target) => write!(f, "reboot {:?}", target),
            DeviceCommand::GetVar(name) => write!(f, "getvar {}", name),
            DeviceCommand::Flash {
                partition, data, ..
            } => write!(f, "flash {} ({} bytes)", partition, data.len()),
            DeviceCommand::ReadPartition(name) => write!(f, "read {}", name),
            DeviceCommand::Erase(name) => write!(f, "erase {}", name),
            DeviceCommand::SetActive(slot) => write!(f, "set_active {}", slot),
            DeviceCommand::CreateLogical { name, size } => {
                write!(f, "create-logical-partition {} {}", name, size)
            }
            DeviceCommand::DeleteLogical(name) => write!(f, "delete-logical-partition {}", name),
            DeviceCommand::PartitionTable => f.write_str("partition table"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, command: DeviceCommand) -> Result<Vec<u8>, TransportError>;

    /// Current mode of the device. Ambiguous or missing answers map to
    /// [`DeviceMode::Unknown`]; this never errors.
    async fn poll_status(&self) -> DeviceMode;
}

/// Wraps another transport with per-command timeouts and the retry policy.
pub struct GuardedTransport {
    inner: Arc<dyn Transport>,
    command_timeout: Duration,
    write_timeout: Duration,
    retry: RetryPolicy,
}

impl GuardedTransport {
    pub fn new(inner: Arc<dyn Transport>, command_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            inner,
            command_timeout,
            write_timeout: command_timeout,
            retry,
        }
    }

    pub fn from_config(inner: Arc<dyn Transport>, config: &EngineConfig) -> Self {
        Self {
            inner,
            command_timeout: config.command_timeout(),
            write_timeout: config.write_timeout(),
            retry: config.retry,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for GuardedTransport {
    async fn send(&self, command: DeviceCommand) -> Result<Vec<u8>, TransportError> {
        let attempts = if command.is_idempotent() {
            self.retry.max_attempts.max(1)
        } else {
            1
        };
        let limit = if command.is_write() {
            self.write_timeout
        } else {
            self.command_timeout
        };

        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(limit, self.inner.send(command.clone())).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(limit)),
            };
            match result {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(command = %command, attempt, error = %e, "transient transport error, retrying");
                    tokio::time::sleep(self.retry.backoff()).await;
                    attempt += 1;
                }
                other => {
                    if let Err(e) = &other {
                        debug!(command = %command, error = %e, "command failed");
                    }
                    return other;
                }
            }
        }
    }

    async fn poll_status(&self) -> DeviceMode {
        tokio::time::timeout(self.command_timeout, self.inner.poll_status())
            .await
            .unwrap_or(DeviceMode::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;

    #[tokio::test]
    async fn test_idempotent_commands_are_retried() {
        let sim = Arc::new(SimulatedDevice::new("lisa", DeviceMode::Bootloader));
        sim.fail_transiently(2);
        let guarded = GuardedTransport::new(
            sim.clone(),
            Duration::from_secs(1),
            RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1,
            },
        );
        let reply = guarded.send(DeviceCommand::GetVar("product".into())).await.unwrap();
        assert_eq!(reply, b"lisa");
    }

    #[tokio::test]
    async fn test_writes_are_never_retried() {
        let sim = Arc::new(SimulatedDevice::new("lisa", DeviceMode::Bootloader).with_partition("boot", 64));
        sim.fail_transiently(1);
        let guarded = GuardedTransport::new(
            sim.clone(),
            Duration::from_secs(1),
            RetryPolicy {
                max_attempts: 5,
                backoff_ms: 1,
            },
        );
        let result = guarded
            .send(DeviceCommand::Flash {
                partition: "boot".into(),
                data: Arc::from(vec![1u8; 8]),
                disable_verity: false,
            })
            .await;
        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert_eq!(sim.write_count("boot"), 0);
    }

    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn send(&self, _command: DeviceCommand) -> Result<Vec<u8>, TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn poll_status(&self) -> DeviceMode {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            DeviceMode::Bootloader
        }
    }

    #[tokio::test]
    async fn test_stalled_device_times_out() {
        let guarded = GuardedTransport::new(Arc::new(Stalled), Duration::from_millis(20), RetryPolicy::none());
        let result = guarded.send(DeviceCommand::Erase("cache".into())).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(guarded.poll_status().await, DeviceMode::Unknown);
    }
}
