//! In-memory device emulator.
//!
//! Behaves like a phone on the other end of the cable closely enough to drive
//! the executor and the backup manager without hardware: it tracks its mode,
//! reboots into the requested mode after a configurable number of polls,
//! enforces which commands each mode accepts, and stores partition contents.
//! Faults (interrupted writes, corrupted reads, a device that never comes
//! back, transient disconnects) can be injected for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::device::{DeviceMode, Slot};
use crate::error::TransportError;
use crate::transport::{DeviceCommand, RebootTarget, Transport};

#[derive(Debug, Clone, Default)]
struct SimPartition {
    size: u64,
    /// Written prefix; the unwritten tail is not materialised.
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_write: Option<(String, u64)>,
    corrupt_reads: BTreeSet<String>,
    ignore_reboots: bool,
    transient_failures: u32,
    create_missing: bool,
}

#[derive(Debug)]
struct SimState {
    mode: DeviceMode,
    model: String,
    slot: Option<Slot>,
    partitions: BTreeMap<String, SimPartition>,
    pending: Option<(DeviceMode, u32)>,
    reboot_polls: u32,
    faults: Faults,
    writes: BTreeMap<String, u32>,
    history: Vec<String>,
}

pub struct SimulatedDevice {
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(model: impl Into<String>, mode: DeviceMode) -> Self {
        Self {
            state: Mutex::new(SimState {
                mode,
                model: model.into(),
                slot: None,
                partitions: BTreeMap::new(),
                pending: None,
                reboot_polls: 0,
                faults: Faults::default(),
                writes: BTreeMap::new(),
                history: Vec::new(),
            }),
        }
    }

    pub fn with_partition(self, name: &str, size: u64) -> Self {
        self.lock().partitions.insert(
            name.to_string(),
            SimPartition {
                size,
                data: Vec::new(),
            },
        );
        self
    }

    pub fn with_partition_data(self, name: &str, data: &[u8]) -> Self {
        self.lock().partitions.insert(
            name.to_string(),
            SimPartition {
                size: data.len() as u64,
                data: data.to_vec(),
            },
        );
        self
    }

    /// Declares an A/B device with `slot` active.
    pub fn with_slot(self, slot: Slot) -> Self {
        self.lock().slot = Some(slot);
        self
    }

    /// Number of status polls during which a rebooting device reports `Unknown`.
    pub fn with_reboot_delay(self, polls: u32) -> Self {
        self.lock().reboot_polls = polls;
        self
    }

    /// Flashing to a partition the device does not know creates it instead of
    /// failing. Used by dry runs where the partition layout is not known up front.
    pub fn permissive(self) -> Self {
        self.lock().faults.create_missing = true;
        self
    }

    /// The next write to `partition` stops after `offset` bytes.
    pub fn fail_write(&self, partition: &str, offset: u64) {
        self.lock().faults.fail_write = Some((partition.to_string(), offset));
    }

    /// Reads of `partition` return flipped bytes.
    pub fn corrupt_reads(&self, partition: &str) {
        self.lock().faults.corrupt_reads.insert(partition.to_string());
    }

    /// Reboot commands are acknowledged but the device stays where it is.
    pub fn ignore_reboots(&self) {
        self.lock().faults.ignore_reboots = true;
    }

    /// The next `count` commands fail with a disconnect.
    pub fn fail_transiently(&self, count: u32) {
        self.lock().faults.transient_failures = count;
    }

    pub fn set_model(&self, model: &str) {
        self.lock().model = model.to_string();
    }

    pub fn set_mode(&self, mode: DeviceMode) {
        let mut state = self.lock();
        state.mode = mode;
        state.pending = None;
    }

    pub fn mode(&self) -> DeviceMode {
        self.lock().mode
    }

    pub fn active_slot(&self) -> Option<Slot> {
        self.lock().slot
    }

    pub fn partition(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().partitions.get(name).map(|p| p.data.clone())
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.lock().partitions.contains_key(name)
    }

    pub fn write_count(&self, partition: &str) -> u32 {
        self.lock().writes.get(partition).copied().unwrap_or(0)
    }

    /// Every command received, in order.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SimState {
    fn require(&self, accepted: bool, command: &DeviceCommand) -> Result<(), TransportError> {
        if accepted {
            Ok(())
        } else {
            Err(TransportError::Unsupported(format!("{} in {} mode", command, self.mode)))
        }
    }

    fn partition_mut(&mut self, name: &str) -> Result<&mut SimPartition, TransportError> {
        if self.faults.create_missing && !self.partitions.contains_key(name) {
            self.partitions.insert(name.to_string(), SimPartition::default());
        }
        self.partitions
            .get_mut(name)
            .ok_or_else(|| TransportError::Rejected(format!("partition {} not found", name)))
    }

    fn execute(&mut self, command: &DeviceCommand) -> Result<Vec<u8>, TransportError> {
        if self.mode == DeviceMode::Unknown {
            return Err(TransportError::Disconnected);
        }
        match command {
            DeviceCommand::Reboot(target) => {
                if *target == RebootTarget::Sideload {
                    self.require(!self.mode.is_fastboot(), command)?;
                }
                if !self.faults.ignore_reboots {
                    let next = target.resulting_mode();
                    if self.reboot_polls == 0 {
                        self.mode = next;
                    } else {
                        self.mode = DeviceMode::Unknown;
                        self.pending = Some((next, self.reboot_polls));
                    }
                }
                Ok(Vec::new())
            }
            DeviceCommand::GetVar(name) => match name.as_str() {
                "product" => Ok(self.model.clone().into_bytes()),
                "current-slot" => self
                    .slot
                    .map(|s| s.suffix().as_bytes().to_vec())
                    .ok_or_else(|| TransportError::Rejected("current-slot: not an A/B device".into())),
                "is-userspace" => Ok(if self.mode == DeviceMode::Fastbootd { b"yes".to_vec() } else { b"no".to_vec() }),
                other => Err(TransportError::Rejected(format!("unknown variable {}", other))),
            },
            DeviceCommand::Flash {
                partition, data, ..
            } => {
                self.require(self.mode.accepts_flash(), command)?;
                let fail_at = match &self.faults.fail_write {
                    Some((name, offset)) if name == partition => Some(*offset),
                    _ => None,
                };
                let create_missing = self.faults.create_missing;
                let target = self.partition_mut(partition)?;
                if create_missing && target.size < data.len() as u64 {
                    target.size = data.len() as u64;
                }
                if data.len() as u64 > target.size {
                    return Err(TransportError::Rejected(format!(
                        "image of {} bytes does not fit {} ({} bytes)",
                        data.len(),
                        partition,
                        target.size
                    )));
                }
                if let Some(offset) = fail_at {
                    let written = offset.min(data.len() as u64);
                    overwrite_prefix(&mut target.data, &data[..written as usize]);
                    self.faults.fail_write = None;
                    return Err(TransportError::Interrupted {
                        written,
                        reason: "simulated write failure".into(),
                    });
                }
                overwrite_prefix(&mut target.data, data);
                *self.writes.entry(partition.clone()).or_default() += 1;
                Ok(b"OKAY".to_vec())
            }
            DeviceCommand::ReadPartition(name) => {
                self.require(self.mode.exposes_raw_read(), command)?;
                let corrupt = self.faults.corrupt_reads.contains(name);
                let part = self
                    .partitions
                    .get(name)
                    .ok_or_else(|| TransportError::Rejected(format!("partition {} not found", name)))?;
                let mut data = part.data.clone();
                if corrupt {
                    data.iter_mut().for_each(|b| *b = !*b);
                }
                Ok(data)
            }
            DeviceCommand::Erase(name) => {
                self.require(self.mode.is_fastboot(), command)?;
                self.partition_mut(name)?.data.clear();
                Ok(b"OKAY".to_vec())
            }
            DeviceCommand::SetActive(slot) => {
                self.require(self.mode.is_fastboot(), command)?;
                if self.slot.is_none() {
                    return Err(TransportError::Rejected("device has no A/B slots".into()));
                }
                self.slot = Some(*slot);
                Ok(b"OKAY".to_vec())
            }
            DeviceCommand::CreateLogical { name, size } => {
                self.require(self.mode == DeviceMode::Fastbootd, command)?;
                if self.partitions.contains_key(name) {
                    return Err(TransportError::Rejected(format!("partition {} already exists", name)));
                }
                self.partitions.insert(
                    name.clone(),
                    SimPartition {
                        size: *size,
                        data: Vec::new(),
                    },
                );
                Ok(b"OKAY".to_vec())
            }
            DeviceCommand::DeleteLogical(name) => {
                self.require(self.mode == DeviceMode::Fastbootd, command)?;
                self.partitions
                    .remove(name)
                    .map(|_| b"OKAY".to_vec())
                    .ok_or_else(|| TransportError::Rejected(format!("could not find partition {}", name)))
            }
            DeviceCommand::PartitionTable => {
                self.require(self.mode.is_fastboot(), command)?;
                let table = self
                    .partitions
                    .iter()
                    .map(|(name, p)| format!("{} {}\n", name, p.size))
                    .collect::<String>();
                Ok(table.into_bytes())
            }
        }
    }
}

fn overwrite_prefix(target: &mut Vec<u8>, data: &[u8]) {
    if target.len() < data.len() {
        target.resize(data.len(), 0);
    }
    target[..data.len()].copy_from_slice(data);
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn send(&self, command: DeviceCommand) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        state.history.push(command.to_string());
        if state.faults.transient_failures > 0 {
            state.faults.transient_failures -= 1;
            debug!(command = %command, "simulated disconnect");
            return Err(TransportError::Disconnected);
        }
        state.execute(&command)
    }

    async fn poll_status(&self) -> DeviceMode {
        let mut state = self.lock();
        if let Some((target, remaining)) = state.pending {
            if remaining <= 1 {
                state.mode = target;
                state.pending = None;
            } else {
                state.pending = Some((target, remaining - 1));
            }
        }
        state.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn flash(partition: &str, data: &[u8]) -> DeviceCommand {
        DeviceCommand::Flash {
            partition: partition.into(),
            data: Arc::from(data.to_vec()),
            disable_verity: false,
        }
    }

    #[tokio::test]
    async fn test_reboot_takes_configured_polls() {
        let sim = SimulatedDevice::new("lisa", DeviceMode::Bootloader).with_reboot_delay(2);
        sim.send(DeviceCommand::Reboot(RebootTarget::Fastbootd)).await.unwrap();
        assert_eq!(sim.mode(), DeviceMode::Unknown);
        assert_eq!(sim.poll_status().await, DeviceMode::Unknown);
        assert_eq!(sim.poll_status().await, DeviceMode::Fastbootd);
    }

    #[tokio::test]
    async fn test_flash_rejected_outside_fastboot() {
        let sim = SimulatedDevice::new("lisa", DeviceMode::Adb).with_partition("boot", 16);
        let result = sim.send(flash("boot", b"abc")).await;
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_interrupted_write_reports_offset() {
        let sim = SimulatedDevice::new("lisa", DeviceMode::Bootloader).with_partition("boot", 16);
        sim.fail_write("boot", 4);
        let err = sim.send(flash("boot", b"0123456789")).await.unwrap_err();
        assert_eq!(err.written(), Some(4));
        assert_eq!(sim.partition("boot").unwrap(), b"0123");
        assert_eq!(sim.write_count("boot"), 0);
    }

    #[tokio::test]
    async fn test_logical_partitions_need_fastbootd() {
        let sim = SimulatedDevice::new("lisa", DeviceMode::Bootloader);
        let create = DeviceCommand::CreateLogical {
            name: "my_product".into(),
            size: 1024,
        };
        assert!(sim.send(create.clone()).await.is_err());
        sim.set_mode(DeviceMode::Fastbootd);
        sim.send(create).await.unwrap();
        assert!(sim.has_partition("my_product"));
    }
}
