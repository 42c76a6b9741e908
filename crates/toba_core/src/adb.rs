use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::device::{ConnectedDevice, DeviceMode};
use crate::error::TransportError;
use crate::tools::{classify_failure, tool_path};

#[derive(Clone, Debug)]
pub struct AdbClient {
    adb_path: PathBuf,
    pub selected_serial: Option<String>,
}

impl AdbClient {
    pub fn new(tools_dir: &Path) -> Result<Self, TransportError> {
        let adb_path = tool_path(tools_dir, "adb");
        if !adb_path.exists() {
            return Err(TransportError::ToolNotFound(adb_path.to_string_lossy().to_string()));
        }
        Ok(Self {
            adb_path,
            selected_serial: None,
        })
    }

    pub fn set_serial(&mut self, serial: Option<String>) {
        self.selected_serial = serial;
    }

    pub fn get_serial(&self) -> Option<&str> {
        self.selected_serial.as_deref()
    }

    fn build_args(&self, args: &[&str]) -> Vec<String> {
        let mut cmd_args = Vec::new();
        if let Some(ref serial) = self.selected_serial {
            cmd_args.push("-s".to_string());
            cmd_args.push(serial.clone());
        }
        for arg in args {
            cmd_args.push(arg.to_string());
        }
        cmd_args
    }

    /// Runs adb and returns raw stdout. A non-zero exit becomes a transport error.
    pub async fn capture_bytes(&self, args: &[&str]) -> Result<Vec<u8>, TransportError> {
        let cmd_args = self.build_args(args);
        debug!(tool = "adb", args = ?cmd_args, "exec");
        let output = Command::new(&self.adb_path).args(&cmd_args).output().await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    pub async fn capture(&self, args: &[&str]) -> Result<String, TransportError> {
        let stdout = self.capture_bytes(args).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    pub async fn list_devices(&self) -> Result<Vec<ConnectedDevice>, TransportError> {
        let output = self.capture(&["devices"]).await?;
        Ok(parse_adb_devices(&output))
    }

    pub async fn shell(&self, command: &str) -> Result<String, TransportError> {
        self.capture(&["shell", command]).await
    }

    pub async fn get_prop(&self, prop: &str) -> Result<String, TransportError> {
        self.capture(&["shell", "getprop", prop]).await
    }

    pub async fn reboot(&self, target: Option<&str>) -> Result<String, TransportError> {
        let mut args = vec!["reboot"];
        if let Some(t) = target {
            args.push(t);
        }
        self.capture(&args).await
    }

    /// Raw partition contents through a root shell.
    pub async fn read_partition(&self, partition: &str) -> Result<Vec<u8>, TransportError> {
        if !is_safe_partition_name(partition) {
            return Err(TransportError::Rejected(format!("invalid partition name `{}`", partition)));
        }
        let dd = format!("dd if=/dev/block/by-name/{} 2>/dev/null", partition);
        let data = self.capture_bytes(&["exec-out", "su", "-c", &dd]).await?;
        if data.is_empty() {
            return Err(TransportError::Rejected(format!(
                "no data read from {} (partition missing or root denied)",
                partition
            )));
        }
        Ok(data)
    }
}

/// Parses `adb devices` output. Unauthorized and offline devices are kept
/// with mode `Unknown`.
pub fn parse_adb_devices(output: &str) -> Vec<ConnectedDevice> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                Some(ConnectedDevice {
                    serial: parts[0].to_string(),
                    mode: DeviceMode::from(parts[1]),
                    status: parts[1].to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

fn is_safe_partition_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adb_devices() {
        let output = "List of devices attached\n\
                      * daemon started successfully\n\
                      abc123\tdevice\n\
                      def456\tunauthorized\n\
                      ghi789\tsideload\n";
        let devices = parse_adb_devices(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].mode, DeviceMode::Adb);
        assert_eq!(devices[1].mode, DeviceMode::Unknown);
        assert_eq!(devices[1].status, "unauthorized");
        assert_eq!(devices[2].mode, DeviceMode::Sideload);
        assert!(parse_adb_devices("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_partition_name_validation() {
        assert!(is_safe_partition_name("modemst1"));
        assert!(is_safe_partition_name("modem_a"));
        assert!(!is_safe_partition_name("modem; reboot"));
        assert!(!is_safe_partition_name("../sda"));
        assert!(!is_safe_partition_name(""));
    }

    #[test]
    fn test_missing_tool() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(AdbClient::new(dir.path()), Err(TransportError::ToolNotFound(_))));
    }
}
