use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::device::SlotTarget;

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Extracts the digest from a checksum file. Accepts a bare hex digest or
/// `sha256sum` output (`<digest>  <file>`); only the first line is used.
pub fn parse_checksum_file(contents: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(contents).ok()?;
    let token = text.trim_start_matches('\u{feff}').split_whitespace().next()?;
    let digest = token.trim_start_matches('*');
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

/// Parses `4096`, `0x1000`, `4K`, `1M`, `2G` (binary multiples).
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    let (digits, multiplier) = match s.chars().last()?.to_ascii_uppercase() {
        'K' => (&s[..s.len() - 1], 1u64 << 10),
        'M' => (&s[..s.len() - 1], 1u64 << 20),
        'G' => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Parses `500ms`, `5s`, `2m`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim().to_ascii_lowercase();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs);
    }
    None
}

/// Splits a `_a`/`_b`/`_ab` suffix off a partition name.
pub fn split_slot_suffix(name: &str) -> (&str, Option<SlotTarget>) {
    if let Some(base) = name.strip_suffix("_ab") {
        return (base, Some(SlotTarget::Both));
    }
    for (suffix, target) in [("_a", "a"), ("_b", "b")] {
        if let Some(base) = name.strip_suffix(suffix)
            && !base.is_empty()
        {
            return (base, SlotTarget::parse(target));
        }
    }
    (name, None)
}

/// Parses a `PartitionTable` reply (`name size` per line). Sizes may be decimal or `0x` hex.
pub fn parse_partition_table(reply: &[u8]) -> BTreeMap<String, u64> {
    String::from_utf8_lossy(reply)
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let size = parse_size(parts.next()?)?;
            Some((name.to_string(), size))
        })
        .collect()
}

/// Digest of the first `len` bytes of `data`, or of all of it when `len` is `None`.
/// A read-back shorter than `len` hashes whatever came back, which then fails to match.
pub fn prefix_digest(data: &[u8], len: Option<usize>) -> String {
    let end = len.map_or(data.len(), |l| l.min(data.len()));
    sha256_hex(&data[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Slot;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_parse_checksum_file_formats() {
        let digest = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";
        assert_eq!(parse_checksum_file(digest.as_bytes()).unwrap(), digest.to_ascii_lowercase());
        let sum = format!("{}  boot.img\n", digest.to_ascii_lowercase());
        assert!(parse_checksum_file(sum.as_bytes()).is_some());
        assert!(parse_checksum_file(b"not a digest").is_none());
        assert!(parse_checksum_file(b"").is_none());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("1M"), Some(1 << 20));
        assert_eq!(parse_size("4k"), Some(4096));
        assert_eq!(parse_size("0x4000000"), Some(0x4000000));
        assert_eq!(parse_size("big"), None);
        assert_eq!(parse_size("M"), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_split_slot_suffix() {
        assert_eq!(split_slot_suffix("boot_ab"), ("boot", Some(SlotTarget::Both)));
        assert_eq!(split_slot_suffix("dtbo_b"), ("dtbo", Some(SlotTarget::Single(Slot::B))));
        assert_eq!(split_slot_suffix("super"), ("super", None));
        assert_eq!(split_slot_suffix("_a"), ("_a", None));
    }

    #[test]
    fn test_parse_partition_table() {
        let table = parse_partition_table(b"boot_a 67108864\nmodem 0x8000000\ngarbage\n");
        assert_eq!(table.get("boot_a"), Some(&67108864));
        assert_eq!(table.get("modem"), Some(&0x8000000));
        assert_eq!(table.len(), 2);
    }
}
