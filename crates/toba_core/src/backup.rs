//! Baseband partition backup and restore.
//!
//! A backup is the raw partition content plus its SHA-256 and the model tag of
//! the device it came from. Restores re-check both before anything is written:
//! a backup that rotted at rest, or one from a different model, never reaches
//! the modem partitions.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::constants::{BASEBAND_PARTITIONS, is_baseband_partition};
use crate::device::DeviceMode;
use crate::error::{BackupError, RestoreError, StoreError, TransportError};
use crate::events::{EventSink, ExecutionEvent, LogLevel};
use crate::session::DeviceSession;
use crate::transport::DeviceCommand;
use crate::utils::{prefix_digest, sha256_hex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasebandBackup {
    pub partition: String,
    /// Captured bytes. Stores keep these next to the metadata, not inside it.
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Lowercase SHA-256 of `data`; also the key the backup is stored under.
    pub checksum: String,
    pub device_model: String,
    pub size: u64,
    pub created_at_unix: u64,
}

impl BasebandBackup {
    pub fn new(partition: impl Into<String>, data: Vec<u8>, device_model: impl Into<String>) -> Self {
        let created_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            partition: partition.into(),
            checksum: sha256_hex(&data),
            size: data.len() as u64,
            data,
            device_model: device_model.into(),
            created_at_unix,
        }
    }

    /// Whether `data` still hashes to the recorded checksum.
    pub fn is_intact(&self) -> bool {
        sha256_hex(&self.data) == self.checksum
    }
}

/// Persistence for backups, keyed by checksum. `list` may return entries
/// without their data.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn put(&self, backup: &BasebandBackup) -> Result<(), StoreError>;

    async fn get(&self, checksum: &str) -> Result<Option<BasebandBackup>, StoreError>;

    async fn list(&self) -> Result<Vec<BasebandBackup>, StoreError>;
}

#[derive(Default)]
pub struct MemoryBackupStore {
    backups: DashMap<String, BasebandBackup>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn put(&self, backup: &BasebandBackup) -> Result<(), StoreError> {
        self.backups.insert(backup.checksum.clone(), backup.clone());
        Ok(())
    }

    async fn get(&self, checksum: &str) -> Result<Option<BasebandBackup>, StoreError> {
        Ok(self.backups.get(&checksum.to_ascii_lowercase()).map(|b| b.value().clone()))
    }

    async fn list(&self) -> Result<Vec<BasebandBackup>, StoreError> {
        let mut all: Vec<BasebandBackup> = self.backups.iter().map(|b| b.value().clone()).collect();
        all.sort_by(|a, b| (a.created_at_unix, &a.partition).cmp(&(b.created_at_unix, &b.partition)));
        Ok(all)
    }
}

pub struct BackupManager {
    store: Arc<dyn BackupStore>,
    sink: Arc<dyn EventSink>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn BackupStore>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &Arc<dyn BackupStore> {
        &self.store
    }

    /// Reads `partition`, stores the result and returns it.
    pub async fn backup(&self, session: &DeviceSession, partition: &str) -> Result<BasebandBackup, BackupError> {
        let _guard = session.acquire()?;
        self.require_raw_read(session).await?;
        let table = session.partition_table();
        if !table.is_empty() && !table.contains_key(partition) {
            return Err(BackupError::UnknownPartition(partition.to_string()));
        }
        let model = session.resolve_model().await.ok_or(BackupError::UnknownModel)?;
        let backup = self.capture(session, partition, &model).await?;
        self.store.put(&backup).await?;
        Ok(backup)
    }

    /// Backs up every baseband partition the device has.
    pub async fn backup_baseband(&self, session: &DeviceSession) -> Result<Vec<BasebandBackup>, BackupError> {
        let _guard = session.acquire()?;
        let mode = self.require_raw_read(session).await?;
        if mode.is_fastboot()
            && let Err(e) = session.refresh_partition_table().await
        {
            debug!(serial = %session.serial(), error = %e, "partition table unavailable");
        }
        let model = session.resolve_model().await.ok_or(BackupError::UnknownModel)?;

        let table = session.partition_table();
        // Without a table, try the well-known names in both slots and skip the ones the device lacks.
        let (candidates, guessing): (Vec<String>, bool) = if table.is_empty() {
            (
                BASEBAND_PARTITIONS
                    .iter()
                    .flat_map(|p| [p.to_string(), format!("{}_a", p), format!("{}_b", p)])
                    .collect(),
                true,
            )
        } else {
            (
                table.keys().filter(|name| is_baseband_partition(name)).cloned().collect(),
                false,
            )
        };

        let mut backups = Vec::new();
        for partition in candidates {
            match self.capture(session, &partition, &model).await {
                Ok(backup) => {
                    self.store.put(&backup).await?;
                    backups.push(backup);
                }
                Err(BackupError::Read {
                    source: TransportError::Rejected(reason),
                    ..
                }) if guessing => {
                    debug!(%partition, %reason, "baseband partition not present");
                }
                Err(e) => return Err(e),
            }
        }
        if backups.is_empty() {
            return Err(BackupError::Empty("baseband partitions".into()));
        }
        info!(serial = %session.serial(), count = backups.len(), "baseband backup complete");
        Ok(backups)
    }

    /// Writes `backup` back to the device after checking it is intact and
    /// belongs to this device model. Nothing is written if a check fails.
    pub async fn restore(&self, session: &DeviceSession, backup: &BasebandBackup) -> Result<(), RestoreError> {
        let _guard = session.acquire()?;

        let actual = sha256_hex(&backup.data);
        if actual != backup.checksum {
            return Err(RestoreError::Corrupted {
                partition: backup.partition.clone(),
                expected: backup.checksum.clone(),
                actual,
            });
        }

        let model = session.resolve_model().await.unwrap_or_default();
        if !model.eq_ignore_ascii_case(&backup.device_model) {
            return Err(RestoreError::ModelMismatch {
                expected: backup.device_model.clone(),
                actual: model,
            });
        }

        let mode = session.detect_mode().await?;
        if !mode.accepts_flash() {
            return Err(RestoreError::WrongMode { mode });
        }

        let partition = backup.partition.clone();
        let total = backup.data.len() as u64;
        self.progress(&partition, 0, total);
        session
            .send(DeviceCommand::Flash {
                partition: partition.clone(),
                data: Arc::from(backup.data.as_slice()),
                disable_verity: false,
            })
            .await
            .map_err(|source| RestoreError::Write {
                partition: partition.clone(),
                offset: source.written(),
                source,
            })?;
        self.progress(&partition, total, total);

        if mode.exposes_raw_read() {
            let actual = match session.send(DeviceCommand::ReadPartition(partition.clone())).await {
                Ok(data) => prefix_digest(&data, Some(backup.data.len())),
                Err(e) => format!("unreadable ({})", e),
            };
            if actual != backup.checksum {
                return Err(RestoreError::VerifyFailed {
                    partition,
                    expected: backup.checksum.clone(),
                    actual,
                });
            }
        } else {
            self.log(LogLevel::Warn, format!("{} restored, read-back not possible in {} mode", partition, mode));
        }
        self.log(LogLevel::Info, format!("restored {} from backup {}", partition, backup.checksum));
        Ok(())
    }

    pub async fn restore_by_checksum(&self, session: &DeviceSession, checksum: &str) -> Result<BasebandBackup, RestoreError> {
        let backup = self
            .store
            .get(checksum)
            .await?
            .ok_or_else(|| RestoreError::NotFound(checksum.to_string()))?;
        self.restore(session, &backup).await?;
        Ok(backup)
    }

    async fn require_raw_read(&self, session: &DeviceSession) -> Result<DeviceMode, BackupError> {
        let mode = session.detect_mode().await?;
        if mode.exposes_raw_read() {
            Ok(mode)
        } else {
            Err(BackupError::WrongMode { mode })
        }
    }

    async fn capture(&self, session: &DeviceSession, partition: &str, model: &str) -> Result<BasebandBackup, BackupError> {
        let data = session
            .send(DeviceCommand::ReadPartition(partition.to_string()))
            .await
            .map_err(|source| BackupError::Read {
                partition: partition.to_string(),
                source,
            })?;
        if data.is_empty() {
            return Err(BackupError::Empty(partition.to_string()));
        }
        let backup = BasebandBackup::new(partition, data, model);
        self.progress(partition, backup.size, backup.size);
        self.log(
            LogLevel::Info,
            format!("backed up {} ({} bytes, sha256 {})", partition, backup.size, backup.checksum),
        );
        Ok(backup)
    }

    fn progress(&self, partition: &str, done: u64, total: u64) {
        self.sink.publish(ExecutionEvent::Progress {
            index: 0,
            partition: partition.to_string(),
            done,
            total,
        });
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
        }
        self.sink.publish(ExecutionEvent::Log { level, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::events::NullSink;
    use crate::sim::SimulatedDevice;

    const MODEM: &[u8] = b"QCOM modem firmware blob";

    fn manager() -> BackupManager {
        BackupManager::new(Arc::new(MemoryBackupStore::new()), Arc::new(NullSink))
    }

    fn device(mode: DeviceMode) -> Arc<SimulatedDevice> {
        Arc::new(
            SimulatedDevice::new("lisa", mode)
                .with_partition_data("modem_a", MODEM)
                .with_partition_data("modemst1", b"nv items")
                .with_partition_data("boot_a", b"kernel"),
        )
    }

    async fn session(sim: &Arc<SimulatedDevice>) -> DeviceSession {
        DeviceSession::attach("abc123", sim.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn test_backup_then_restore_leaves_partition_unchanged() {
        let sim = device(DeviceMode::Fastbootd);
        let session = session(&sim).await;
        let manager = manager();

        let backup = manager.backup(&session, "modem_a").await.unwrap();
        assert_eq!(backup.checksum, sha256_hex(MODEM));
        assert_eq!(backup.device_model, "lisa");
        assert!(manager.store().get(&backup.checksum).await.unwrap().is_some());

        manager.restore(&session, &backup).await.unwrap();
        assert_eq!(sim.partition("modem_a").unwrap(), MODEM);
        assert_eq!(sim.write_count("modem_a"), 1);
        assert_eq!(sha256_hex(&sim.partition("modem_a").unwrap()), backup.checksum);
    }

    #[tokio::test]
    async fn test_backup_needs_raw_read_mode() {
        let sim = device(DeviceMode::Bootloader);
        let session = session(&sim).await;
        let err = manager().backup(&session, "modem_a").await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::WrongMode {
                mode: DeviceMode::Bootloader
            }
        ));
    }

    #[tokio::test]
    async fn test_restore_refuses_other_model_before_writing() {
        let sim = device(DeviceMode::Fastbootd);
        let session = session(&sim).await;
        let backup = BasebandBackup::new("modem_a", b"other radio".to_vec(), "X");

        sim.set_model("Y");
        session.refresh_model().await.unwrap();
        let err = manager().restore(&session, &backup).await.unwrap_err();
        assert!(matches!(
            err,
            RestoreError::ModelMismatch { ref expected, ref actual } if expected == "X" && actual == "Y"
        ));
        assert_eq!(sim.write_count("modem_a"), 0);
        assert_eq!(sim.partition("modem_a").unwrap(), MODEM);
    }

    #[tokio::test]
    async fn test_corrupted_backup_is_rejected() {
        let sim = device(DeviceMode::Fastbootd);
        let session = session(&sim).await;
        let manager = manager();
        let mut backup = manager.backup(&session, "modem_a").await.unwrap();
        backup.data[0] ^= 0xff;

        assert!(!backup.is_intact());
        let err = manager.restore(&session, &backup).await.unwrap_err();
        assert!(matches!(err, RestoreError::Corrupted { .. }));
        assert_eq!(sim.write_count("modem_a"), 0);
    }

    #[tokio::test]
    async fn test_restore_needs_flash_mode() {
        let sim = device(DeviceMode::Adb);
        let session = session(&sim).await;
        let manager = manager();
        let backup = manager.backup(&session, "modem_a").await.unwrap();
        let err = manager.restore(&session, &backup).await.unwrap_err();
        assert!(matches!(err, RestoreError::WrongMode { mode: DeviceMode::Adb }));
    }

    #[tokio::test]
    async fn test_restore_detects_bad_read_back() {
        let sim = device(DeviceMode::Fastbootd);
        let session = session(&sim).await;
        let manager = manager();
        let backup = manager.backup(&session, "modem_a").await.unwrap();

        sim.corrupt_reads("modem_a");
        let err = manager.restore_by_checksum(&session, &backup.checksum).await.unwrap_err();
        assert!(matches!(err, RestoreError::VerifyFailed { .. }));
        assert!(matches!(
            manager.restore_by_checksum(&session, "00").await,
            Err(RestoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_backup_baseband_from_partition_table() {
        let sim = device(DeviceMode::Fastbootd);
        let session = session(&sim).await;
        let manager = manager();

        let backups = manager.backup_baseband(&session).await.unwrap();
        let names: Vec<&str> = backups.iter().map(|b| b.partition.as_str()).collect();
        assert_eq!(names, vec!["modem_a", "modemst1"]);
        assert_eq!(manager.store().list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_backup_baseband_over_adb_tries_slot_names() {
        let sim = Arc::new(
            SimulatedDevice::new("lisa", DeviceMode::Adb)
                .with_partition_data("modem_a", MODEM)
                .with_partition_data("modem_b", MODEM)
                .with_partition_data("modemst1", b"nv items"),
        );
        let session = session(&sim).await;
        let backups = manager().backup_baseband(&session).await.unwrap();
        let names: Vec<&str> = backups.iter().map(|b| b.partition.as_str()).collect();
        assert_eq!(names, vec!["modem_a", "modem_b", "modemst1"]);
    }

    #[tokio::test]
    async fn test_backup_while_busy() {
        let sim = device(DeviceMode::Fastbootd);
        let session = session(&sim).await;
        let _guard = session.acquire().unwrap();
        let err = manager().backup(&session, "modem_a").await.unwrap_err();
        assert!(matches!(err, BackupError::Session(SessionError::Busy { .. })));
    }
}
