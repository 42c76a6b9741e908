//! [`Transport`] on top of the Android platform tools.
//!
//! Mode detection asks adb first (`device`, `sideload`), then fastboot, where
//! `getvar is-userspace` tells fastbootd apart from the bootloader. Images are
//! handed to fastboot through temporary files that are removed again however
//! the command ends.

use async_trait::async_trait;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::adb::AdbClient;
use crate::config::EngineConfig;
use crate::constants::DEFAULT_TOOLS_DIR;
use crate::device::{ConnectedDevice, DeviceMode};
use crate::error::TransportError;
use crate::fastboot::FastbootClient;
use crate::registry::{Connector, DeviceLister, guarded_connector};
use crate::transport::{DeviceCommand, RebootTarget, Transport};

pub fn tool_path(tools_dir: &Path, name: &str) -> PathBuf {
    if cfg!(target_os = "windows") {
        tools_dir.join(format!("{}.exe", name))
    } else {
        tools_dir.join(name)
    }
}

/// The configured directory if given, else `platform-tools` under the working
/// directory, else `platform-tools` next to the executable.
pub fn resolve_tools_dir(configured: Option<&Path>) -> Result<PathBuf, TransportError> {
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }
    let mut base_path = env::current_dir()?;
    base_path.push(DEFAULT_TOOLS_DIR);

    if !base_path.exists()
        && let Ok(mut exe_path) = env::current_exe()
    {
        exe_path.pop();
        exe_path.push(DEFAULT_TOOLS_DIR);
        if exe_path.exists() {
            base_path = exe_path;
        }
    }
    Ok(base_path)
}

/// Maps tool stderr to a transport error. Lost devices are `Disconnected`
/// so idempotent queries get retried; anything else is the device's answer.
pub fn classify_failure(stderr: &str) -> TransportError {
    let message = stderr.trim();
    let lower = message.to_ascii_lowercase();
    let lost = [
        "no devices",
        "device not found",
        "device offline",
        "no such device",
        "protocol fault",
        "transport error",
    ];
    if lost.iter().any(|needle| lower.contains(needle)) {
        TransportError::Disconnected
    } else {
        TransportError::Rejected(message.lines().last().unwrap_or(message).to_string())
    }
}

#[derive(Clone, Debug)]
pub struct PlatformTools {
    adb: AdbClient,
    fastboot: FastbootClient,
    temp_dir: PathBuf,
}

impl PlatformTools {
    pub fn new(tools_dir: &Path) -> Result<Self, TransportError> {
        Ok(Self {
            adb: AdbClient::new(tools_dir)?,
            fastboot: FastbootClient::new(tools_dir)?,
            temp_dir: env::temp_dir(),
        })
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// A copy whose commands target `serial`.
    pub fn for_device(&self, serial: &str) -> Self {
        let mut tools = self.clone();
        tools.adb.set_serial(Some(serial.to_string()));
        tools.fastboot.set_serial(Some(serial.to_string()));
        tools
    }

    pub fn serial(&self) -> Option<&str> {
        self.adb.get_serial()
    }

    /// Session factory for [`crate::registry::SessionRegistry`]. Transports
    /// carry the timeouts and retries from `config`.
    pub fn connector(&self, config: &EngineConfig) -> Connector {
        let tools = self.clone();
        let raw: Connector = Arc::new(move |serial: &str| -> Result<Arc<dyn Transport>, TransportError> {
            Ok(Arc::new(tools.for_device(serial)))
        });
        guarded_connector(raw, config)
    }

    fn temp_file(&self, tag: &str) -> PathBuf {
        self.temp_dir
            .join(format!("toba_{}_{}.img", tag, uuid::Uuid::new_v4().simple()))
    }

    async fn reboot(&self, target: RebootTarget) -> Result<Vec<u8>, TransportError> {
        let mode = self.poll_status().await;
        let output = if mode.is_fastboot() {
            match target {
                RebootTarget::System => self.fastboot.reboot(None).await?,
                RebootTarget::Bootloader => self.fastboot.reboot_bootloader().await?,
                RebootTarget::Fastbootd => self.fastboot.reboot(Some("fastboot")).await?,
                RebootTarget::Sideload => {
                    return Err(TransportError::Unsupported("reboot to sideload from fastboot".into()));
                }
            }
        } else if mode == DeviceMode::Unknown {
            return Err(TransportError::Disconnected);
        } else {
            match target {
                RebootTarget::System => self.adb.reboot(None).await?,
                RebootTarget::Bootloader => self.adb.reboot(Some("bootloader")).await?,
                RebootTarget::Fastbootd => self.adb.reboot(Some("fastboot")).await?,
                RebootTarget::Sideload => self.adb.reboot(Some("sideload")).await?,
            }
        };
        Ok(output.into_bytes())
    }

    async fn get_var(&self, name: &str) -> Result<Vec<u8>, TransportError> {
        if self.poll_status().await == DeviceMode::Adb {
            let prop = match name {
                "product" => "ro.product.device",
                "current-slot" => "ro.boot.slot_suffix",
                other => return Err(TransportError::Unsupported(format!("getvar {} over adb", other))),
            };
            let value = self.adb.get_prop(prop).await?;
            if value.is_empty() {
                return Err(TransportError::Rejected(format!("{} is not set", prop)));
            }
            return Ok(value.trim_start_matches('_').as_bytes().to_vec());
        }
        Ok(self.fastboot.get_var(name).await?.into_bytes())
    }

    async fn flash(&self, partition: &str, data: &[u8], disable_verity: bool) -> Result<Vec<u8>, TransportError> {
        let path = self.temp_file(partition);
        tokio::fs::write(&path, data).await?;
        let _cleanup = scopeguard::guard(path.clone(), |p| {
            if let Err(e) = std::fs::remove_file(&p) {
                debug!(path = %p.display(), error = %e, "temp image not removed");
            }
        });
        let output = self
            .fastboot
            .flash(partition, &path.to_string_lossy(), disable_verity)
            .await?;
        Ok(output.into_bytes())
    }

    async fn read_partition(&self, partition: &str) -> Result<Vec<u8>, TransportError> {
        match self.poll_status().await {
            DeviceMode::Fastbootd => {
                let path = self.temp_file(partition);
                let _cleanup = scopeguard::guard(path.clone(), |p| {
                    let _ = std::fs::remove_file(p);
                });
                self.fastboot.fetch(partition, &path.to_string_lossy()).await?;
                Ok(tokio::fs::read(&path).await?)
            }
            DeviceMode::Adb => self.adb.read_partition(partition).await,
            mode => Err(TransportError::Unsupported(format!("partition read in {} mode", mode))),
        }
    }

    async fn partition_table(&self) -> Result<Vec<u8>, TransportError> {
        let table = self.fastboot.partition_sizes().await?;
        Ok(table
            .iter()
            .map(|(name, size)| format!("{} {}\n", name, size))
            .collect::<String>()
            .into_bytes())
    }
}

#[async_trait]
impl Transport for PlatformTools {
    async fn send(&self, command: DeviceCommand) -> Result<Vec<u8>, TransportError> {
        if self.serial().is_none() {
            return Err(TransportError::Unsupported("no device selected".into()));
        }
        match command {
            DeviceCommand::Reboot(target) => self.reboot(target).await,
            DeviceCommand::GetVar(name) => self.get_var(&name).await,
            DeviceCommand::Flash {
                partition,
                data,
                disable_verity,
            } => self.flash(&partition, &data, disable_verity).await,
            DeviceCommand::ReadPartition(name) => self.read_partition(&name).await,
            DeviceCommand::Erase(name) => Ok(self.fastboot.erase(&name).await?.into_bytes()),
            DeviceCommand::SetActive(slot) => Ok(self.fastboot.set_active(slot.suffix()).await?.into_bytes()),
            DeviceCommand::CreateLogical { name, size } => Ok(self.fastboot.create_logical(&name, size).await?.into_bytes()),
            DeviceCommand::DeleteLogical(name) => Ok(self.fastboot.delete_logical(&name).await?.into_bytes()),
            DeviceCommand::PartitionTable => self.partition_table().await,
        }
    }

    async fn poll_status(&self) -> DeviceMode {
        let Some(serial) = self.serial() else {
            return DeviceMode::Unknown;
        };
        if let Ok(devices) = self.adb.list_devices().await
            && let Some(device) = devices.iter().find(|d| d.serial == serial)
        {
            return device.mode;
        }
        match self.fastboot.list_devices().await {
            Ok(devices) if devices.iter().any(|d| d.serial == serial) => {
                if self.fastboot.is_userspace().await {
                    DeviceMode::Fastbootd
                } else {
                    DeviceMode::Bootloader
                }
            }
            _ => DeviceMode::Unknown,
        }
    }
}

#[async_trait]
impl DeviceLister for PlatformTools {
    async fn list_devices(&self) -> Result<Vec<ConnectedDevice>, TransportError> {
        let mut devices = self.adb.list_devices().await?;
        for mut device in self.fastboot.list_devices().await? {
            if self.for_device(&device.serial).fastboot.is_userspace().await {
                device.mode = DeviceMode::Fastbootd;
                device.status = "fastbootd".into();
            }
            devices.push(device);
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_tools() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for tool in ["adb", "fastboot"] {
            std::fs::write(tool_path(dir.path(), tool), b"").unwrap();
        }
        dir
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("error: device 'abc' not found\n"),
            TransportError::Disconnected
        ));
        match classify_failure("Sending 'x'\nFAILED (remote: 'could not find partition')\n") {
            TransportError::Rejected(msg) => assert_eq!(msg, "FAILED (remote: 'could not find partition')"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolve_tools_dir_prefers_configured() {
        let dir = Path::new("/opt/platform-tools");
        assert_eq!(resolve_tools_dir(Some(dir)).unwrap(), dir);
    }

    #[test]
    fn test_platform_tools_from_directory() {
        let dir = fake_tools();
        let tools = PlatformTools::new(dir.path()).unwrap();
        assert_eq!(tools.serial(), None);
        let bound = tools.for_device("abc123");
        assert_eq!(bound.serial(), Some("abc123"));
        assert!(bound.temp_file("boot").starts_with(env::temp_dir()));
    }

    #[tokio::test]
    async fn test_unbound_tools_refuse_commands() {
        let dir = fake_tools();
        let tools = PlatformTools::new(dir.path()).unwrap();
        assert!(matches!(
            tools.send(DeviceCommand::Erase("cache".into())).await,
            Err(TransportError::Unsupported(_))
        ));
        assert_eq!(tools.poll_status().await, DeviceMode::Unknown);
    }
}
