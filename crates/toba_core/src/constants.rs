pub const APP_NAME: &str = "TobaFlash";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Directory holding `adb` and `fastboot`, looked up next to the working
/// directory and then next to the executable.
pub const DEFAULT_TOOLS_DIR: &str = "platform-tools";

/// Radio/modem partitions handled by the baseband backup. Slot suffixes are
/// stripped before matching.
pub const BASEBAND_PARTITIONS: &[&str] = &[
    "modem",
    "modemst1",
    "modemst2",
    "fsg",
    "fsc",
    "nvdata",
    "nvram",
    "nvcfg",
    "persist",
    "md1img",
    "md1dsp",
    "efs",
    "sec_efs",
];

/// Partitions cleared by the `WIPE` step.
pub const WIPE_PARTITIONS: &[&str] = &["userdata", "metadata"];

/// Fastboot variable holding the device model tag.
pub const PRODUCT_VAR: &str = "product";
pub const CURRENT_SLOT_VAR: &str = "current-slot";

pub fn is_baseband_partition(name: &str) -> bool {
    let base = name
        .strip_suffix("_a")
        .or_else(|| name.strip_suffix("_b"))
        .unwrap_or(name);
    BASEBAND_PARTITIONS.contains(&base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseband_partition_names() {
        assert!(is_baseband_partition("modem"));
        assert!(is_baseband_partition("modem_b"));
        assert!(is_baseband_partition("modemst1"));
        assert!(!is_baseband_partition("boot_a"));
    }
}
