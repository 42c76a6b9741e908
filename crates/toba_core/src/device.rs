use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Unknown,
    Bootloader,
    Fastbootd,
    Adb,
    Sideload,
}

impl DeviceMode {
    pub const ALL: [DeviceMode; 5] = [
        DeviceMode::Unknown,
        DeviceMode::Bootloader,
        DeviceMode::Fastbootd,
        DeviceMode::Adb,
        DeviceMode::Sideload,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMode::Unknown => "unknown",
            DeviceMode::Bootloader => "bootloader",
            DeviceMode::Fastbootd => "fastbootd",
            DeviceMode::Adb => "adb",
            DeviceMode::Sideload => "sideload",
        }
    }

    /// Strict lookup used by the script grammar. Unlike `From<&str>` this
    /// never falls back to `Unknown`.
    pub fn from_script(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bootloader" | "fastboot" => Some(DeviceMode::Bootloader),
            "fastbootd" => Some(DeviceMode::Fastbootd),
            "adb" | "system" => Some(DeviceMode::Adb),
            "sideload" => Some(DeviceMode::Sideload),
            _ => None,
        }
    }

    /// Modes that speak the fastboot protocol.
    pub fn is_fastboot(self) -> bool {
        matches!(self, DeviceMode::Bootloader | DeviceMode::Fastbootd)
    }

    /// Modes in which a partition can be written.
    pub fn accepts_flash(self) -> bool {
        self.is_fastboot()
    }

    /// Modes in which raw partition contents can be read back
    /// (`fastboot fetch` in fastbootd, a root `dd` over adb).
    pub fn exposes_raw_read(self) -> bool {
        matches!(self, DeviceMode::Fastbootd | DeviceMode::Adb)
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps the state column printed by `adb devices` / `fastboot devices`.
impl From<&str> for DeviceMode {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "fastboot" | "bootloader" => DeviceMode::Bootloader,
            "fastbootd" => DeviceMode::Fastbootd,
            "device" => DeviceMode::Adb,
            "sideload" => DeviceMode::Sideload,
            _ => DeviceMode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn suffix(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }

    /// Accepts `a`, `b`, `_a`, `_b` in any case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('_').to_ascii_lowercase().as_str() {
            "a" => Some(Slot::A),
            "b" => Some(Slot::B),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Which slot(s) of an A/B partition a flash targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotTarget {
    Single(Slot),
    Both,
}

impl SlotTarget {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ab" | "all" | "both" => Some(SlotTarget::Both),
            other => Slot::parse(other).map(SlotTarget::Single),
        }
    }

    /// Concrete partition names this target expands to for `base`.
    pub fn partitions(self, base: &str) -> Vec<String> {
        match self {
            SlotTarget::Single(slot) => vec![format!("{}_{}", base, slot)],
            SlotTarget::Both => vec![format!("{}_a", base), format!("{}_b", base)],
        }
    }
}

impl fmt::Display for SlotTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotTarget::Single(slot) => write!(f, "{}", slot),
            SlotTarget::Both => f.write_str("ab"),
        }
    }
}

/// Partition names a (base, slot) pair resolves to on the device.
pub fn slot_partitions(base: &str, slot: Option<SlotTarget>) -> Vec<String> {
    match slot {
        Some(target) => target.partitions(base),
        None => vec![base.to_string()],
    }
}

/// One line of a device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedDevice {
    pub serial: String,
    pub mode: DeviceMode,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_listing_state() {
        assert_eq!(DeviceMode::from("device"), DeviceMode::Adb);
        assert_eq!(DeviceMode::from("fastboot"), DeviceMode::Bootloader);
        assert_eq!(DeviceMode::from("sideload"), DeviceMode::Sideload);
        assert_eq!(DeviceMode::from("unauthorized"), DeviceMode::Unknown);
    }

    #[test]
    fn test_mode_from_script_is_strict() {
        assert_eq!(DeviceMode::from_script("FastbootD"), Some(DeviceMode::Fastbootd));
        assert_eq!(DeviceMode::from_script("system"), Some(DeviceMode::Adb));
        assert_eq!(DeviceMode::from_script("unknown"), None);
        assert_eq!(DeviceMode::from_script("edl"), None);
    }

    #[test]
    fn test_slot_target_partitions() {
        assert_eq!(SlotTarget::parse("ab").unwrap().partitions("boot"), vec!["boot_a", "boot_b"]);
        assert_eq!(SlotTarget::parse("_b").unwrap().partitions("dtbo"), vec!["dtbo_b"]);
        assert_eq!(slot_partitions("modem", None), vec!["modem"]);
        assert!(SlotTarget::parse("c").is_none());
    }
}
