use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::device::{DeviceMode, Slot, SlotTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitCondition {
    Duration {
        #[serde(with = "millis")]
        duration: Duration,
    },
    Mode { mode: DeviceMode },
    Device,
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Duration { duration } => write!(f, "{:?}", duration),
            WaitCondition::Mode { mode } => write!(f, "mode {}", mode),
            WaitCondition::Device => f.write_str("device"),
        }
    }
}

/// One typed instruction of a plan. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum FlashStep {
    SwitchMode {
        target: DeviceMode,
    },
    FlashPartition {
        partition: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none", serialize_with = "slot_target")]
        slot: Option<SlotTarget>,
        disable_verity: bool,
    },
    ErasePartition {
        partition: String,
    },
    WipeData,
    CreateLogical {
        name: String,
        size: u64,
    },
    DeleteLogical {
        name: String,
    },
    SetActiveSlot {
        slot: Slot,
    },
    Wait {
        condition: WaitCondition,
    },
    Verify {
        partition: String,
        #[serde(skip_serializing_if = "Option::is_none", serialize_with = "slot_target")]
        slot: Option<SlotTarget>,
        checksum: String,
    },
}

const FASTBOOT_MODES: &[DeviceMode] = &[DeviceMode::Bootloader, DeviceMode::Fastbootd];
const USERSPACE_FASTBOOT: &[DeviceMode] = &[DeviceMode::Fastbootd];
const RAW_READ_MODES: &[DeviceMode] = &[DeviceMode::Fastbootd, DeviceMode::Adb];
const ANY_MODE: &[DeviceMode] = &[
    DeviceMode::Bootloader,
    DeviceMode::Fastbootd,
    DeviceMode::Adb,
    DeviceMode::Sideload,
];

impl FlashStep {
    pub fn keyword(&self) -> &'static str {
        match self {
            FlashStep::SwitchMode { .. } => "MODE",
            FlashStep::FlashPartition { .. } => "FLASH",
            FlashStep::ErasePartition { .. } => "ERASE",
            FlashStep::WipeData => "WIPE",
            FlashStep::CreateLogical { .. } | FlashStep::DeleteLogical { .. } => "LOGICAL",
            FlashStep::SetActiveSlot { .. } => "SLOT",
            FlashStep::Wait { .. } => "WAIT",
            FlashStep::Verify { .. } => "VERIFY",
        }
    }

    /// Steps whose failure can leave the device in a worse state than before.
    pub fn is_destructive(&self) -> bool {
        !matches!(
            self,
            FlashStep::Wait { .. } | FlashStep::Verify { .. } | FlashStep::SwitchMode { .. }
        )
    }

    /// Steps the plan may skip past when they fail. A failed mode switch
    /// leaves the device state unknown, so it always halts.
    pub fn may_continue_after_failure(&self) -> bool {
        matches!(self, FlashStep::Wait { .. } | FlashStep::Verify { .. })
    }

    /// Modes the step may run in. `SwitchMode` starts anywhere the permission
    /// table allows and is checked separately.
    pub fn allowed_modes(&self) -> &'static [DeviceMode] {
        match self {
            FlashStep::FlashPartition { .. }
            | FlashStep::ErasePartition { .. }
            | FlashStep::WipeData
            | FlashStep::SetActiveSlot { .. } => FASTBOOT_MODES,
            FlashStep::CreateLogical { .. } | FlashStep::DeleteLogical { .. } => USERSPACE_FASTBOOT,
            FlashStep::Verify { .. } => RAW_READ_MODES,
            FlashStep::SwitchMode { .. } | FlashStep::Wait { .. } => ANY_MODE,
        }
    }

    /// Mode the device is in after the step, given the mode it ran in.
    pub fn resulting_mode(&self, current: DeviceMode) -> DeviceMode {
        match self {
            FlashStep::SwitchMode { target } => *target,
            FlashStep::Wait {
                condition: WaitCondition::Mode { mode },
            } => *mode,
            _ => current,
        }
    }
}

impl fmt::Display for FlashStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashStep::SwitchMode { target } => write!(f, "switch to {}", target),
            FlashStep::FlashPartition {
                partition,
                source,
                slot,
                ..
            } => match slot {
                Some(slot) => write!(f, "flash {} ({}) <- {}", partition, slot, source),
                None => write!(f, "flash {} <- {}", partition, source),
            },
            FlashStep::ErasePartition { partition } => write!(f, "erase {}", partition),
            FlashStep::WipeData => f.write_str("wipe user data"),
            FlashStep::CreateLogical { name, size } => write!(f, "create logical {} ({} bytes)", name, size),
            FlashStep::DeleteLogical { name } => write!(f, "delete logical {}", name),
            FlashStep::SetActiveSlot { slot } => write!(f, "set active slot {}", slot),
            FlashStep::Wait { condition } => write!(f, "wait for {}", condition),
            FlashStep::Verify {
                partition, checksum, ..
            } => write!(f, "verify {} against {}", partition, checksum),
        }
    }
}

/// A step together with where it came from and the mode it runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    /// 1-indexed script line.
    pub line: usize,
    pub mode: DeviceMode,
    pub step: FlashStep,
}

/// A validated plan. Only the script interpreter builds one, so every plan in
/// circulation has passed the reachability checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashPlan {
    start_mode: DeviceMode,
    devices: Vec<String>,
    steps: Vec<PlannedStep>,
}

impl FlashPlan {
    pub(crate) fn new(start_mode: DeviceMode, devices: Vec<String>, steps: Vec<PlannedStep>) -> Self {
        Self {
            start_mode,
            devices,
            steps,
        }
    }

    pub fn start_mode(&self) -> DeviceMode {
        self.start_mode
    }

    /// Device models the plan is written for. Empty means any.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn accepts_model(&self, model: &str) -> bool {
        self.devices.is_empty() || self.devices.iter().any(|d| d.eq_ignore_ascii_case(model.trim()))
    }
}

fn slot_target<S: serde::Serializer>(slot: &Option<SlotTarget>, serializer: S) -> Result<S::Ok, S::Error> {
    match slot {
        Some(target) => serializer.collect_str(target),
        None => serializer.serialize_none(),
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_locks() {
        let logical = FlashStep::CreateLogical {
            name: "product_a".into(),
            size: 1024,
        };
        assert_eq!(logical.allowed_modes(), &[DeviceMode::Fastbootd]);
        assert!(logical.is_destructive());

        let verify = FlashStep::Verify {
            partition: "boot".into(),
            slot: None,
            checksum: "boot.sha256".into(),
        };
        assert!(!verify.is_destructive());
        assert!(!verify.allowed_modes().contains(&DeviceMode::Bootloader));
        assert!(verify.may_continue_after_failure());

        let switch = FlashStep::SwitchMode {
            target: DeviceMode::Fastbootd,
        };
        assert!(!switch.is_destructive());
        assert!(!switch.may_continue_after_failure());
        assert!(!logical.may_continue_after_failure());
    }

    #[test]
    fn test_accepts_model_ignores_case() {
        let plan = FlashPlan::new(DeviceMode::Bootloader, vec!["Lisa".into()], Vec::new());
        assert!(plan.accepts_model("lisa"));
        assert!(!plan.accepts_model("lisa_pro"));
        assert!(FlashPlan::new(DeviceMode::Bootloader, Vec::new(), Vec::new()).accepts_model("anything"));
    }

    #[test]
    fn test_step_serializes_tagged() {
        let step = FlashStep::FlashPartition {
            partition: "boot".into(),
            source: "boot.img".into(),
            slot: Some(SlotTarget::Both),
            disable_verity: false,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["step"], "flash_partition");
        assert_eq!(json["slot"], "ab");
    }
}
