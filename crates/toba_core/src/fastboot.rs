use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::debug;

use crate::device::{ConnectedDevice, DeviceMode};
use crate::error::TransportError;
use crate::tools::{classify_failure, tool_path};

#[derive(Clone, Debug)]
pub struct FastbootClient {
    fastboot_path: PathBuf,
    pub selected_serial: Option<String>,
}

impl FastbootClient {
    pub fn new(tools_dir: &Path) -> Result<Self, TransportError> {
        let fastboot_path = tool_path(tools_dir, "fastboot");
        if !fastboot_path.exists() {
            return Err(TransportError::ToolNotFound(fastboot_path.to_string_lossy().to_string()));
        }
        Ok(Self {
            fastboot_path,
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

    /// Runs fastboot and returns stdout and stderr combined; fastboot reports
    /// most of its answers on stderr.
    pub async fn capture(&self, args: &[&str]) -> Result<String, TransportError> {
        let cmd_args = self.build_args(args);
        debug!(tool = "fastboot", args = ?cmd_args, "exec");
        let output = Command::new(&self.fastboot_path).args(&cmd_args).output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            Ok(format!("{}{}", stdout, stderr).trim().to_string())
        } else {
            Err(classify_failure(&stderr))
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<ConnectedDevice>, TransportError> {
        let output = self.capture(&["devices"]).await?;
        Ok(parse_fastboot_devices(&output))
    }

    pub async fn get_var(&self, var: &str) -> Result<String, TransportError> {
        let output = self.capture(&["getvar", var]).await?;
        parse_getvar(&output, var).ok_or_else(|| TransportError::Rejected(format!("variable {} not reported", var)))
    }

    /// Fastbootd answers `is-userspace` with `yes`; the bootloader says `no`
    /// or does not know the variable.
    pub async fn is_userspace(&self) -> bool {
        matches!(self.get_var("is-userspace").await.as_deref(), Ok("yes"))
    }

    pub async fn partition_sizes(&self) -> Result<BTreeMap<String, u64>, TransportError> {
        let output = self.capture(&["getvar", "all"]).await?;
        Ok(parse_partition_sizes(&output))
    }

    pub async fn reboot(&self, target: Option<&str>) -> Result<String, TransportError> {
        let mut args = vec!["reboot"];
        if let Some(t) = target {
            args.push(t);
        }
        self.capture(&args).await
    }

    pub async fn reboot_bootloader(&self) -> Result<String, TransportError> {
        self.capture(&["reboot-bootloader"]).await
    }

    pub async fn set_active(&self, slot: &str) -> Result<String, TransportError> {
        self.capture(&["set_active", slot]).await
    }

    pub async fn erase(&self, partition: &str) -> Result<String, TransportError> {
        self.capture(&["erase", partition]).await
    }

    pub async fn flash(&self, partition: &str, image_path: &str, disable_verity: bool) -> Result<String, TransportError> {
        if disable_verity {
            self.capture(&[
                "flash",
                partition,
                "--disable-verity",
                "--disable-verification",
                image_path,
            ])
            .await
        } else {
            self.capture(&["flash", partition, image_path]).await
        }
    }

    pub async fn fetch(&self, partition: &str, output_path: &str) -> Result<String, TransportError> {
        self.capture(&["fetch", partition, output_path]).await
    }

    pub async fn create_logical(&self, name: &str, size: u64) -> Result<String, TransportError> {
        self.capture(&["create-logical-partition", name, &size.to_string()]).await
    }

    pub async fn delete_logical(&self, name: &str) -> Result<String, TransportError> {
        self.capture(&["delete-logical-partition", name]).await
    }
}

pub fn parse_fastboot_devices(output: &str) -> Vec<ConnectedDevice> {
    output
        .lines()
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

/// Value of `var` in `fastboot getvar` output (`var: value`, possibly
/// prefixed with `(bootloader)`).
pub fn parse_getvar(output: &str, var: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim().trim_start_matches("(bootloader)").trim();
        let value = line.strip_prefix(var)?.strip_prefix(':')?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn partition_size_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"partition-size:([A-Za-z0-9_.\-]+):\s*(0x[0-9a-fA-F]+|\d+)").ok())
        .as_ref()
}

/// Partition sizes from `fastboot getvar all`.
pub fn parse_partition_sizes(output: &str) -> BTreeMap<String, u64> {
    let Some(re) = partition_size_re() else {
        return BTreeMap::new();
    };
    re.captures_iter(output)
        .filter_map(|caps| {
            let raw = caps.get(2)?.as_str();
            let size = match raw.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok()?,
                None => raw.parse().ok()?,
            };
            Some((caps.get(1)?.as_str().to_string(), size))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_getvar() {
        assert_eq!(parse_getvar("product: lisa\nFinished. Total time: 0.001s", "product").as_deref(), Some("lisa"));
        assert_eq!(parse_getvar("(bootloader) current-slot: b", "current-slot").as_deref(), Some("b"));
        assert_eq!(parse_getvar("is-userspace: yes", "is-userspace").as_deref(), Some("yes"));
        assert_eq!(parse_getvar("product-name: x", "product"), None);
        assert_eq!(parse_getvar("", "product"), None);
    }

    #[test]
    fn test_parse_partition_sizes() {
        let output = "(bootloader) partition-size:boot_a: 0x6000000\n\
                      (bootloader) partition-type:boot_a:raw\n\
                      (bootloader) partition-size:modemst1: 0x200000\n\
                      (bootloader) is-logical:system_a:yes\n";
        let sizes = parse_partition_sizes(output);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes["boot_a"], 0x6000000);
        assert_eq!(sizes["modemst1"], 0x200000);
    }

    #[test]
    fn test_parse_fastboot_devices() {
        let devices = parse_fastboot_devices("abc123\tfastboot\n\n");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mode, DeviceMode::Bootloader);
    }
}
