//! Filesystem-backed image lookup and backup storage.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use toba_core::backup::{BackupStore, BasebandBackup};
use toba_core::error::StoreError;
use toba_core::source::{SourceError, SourceResolver};

/// Resolves script references against an image directory. A reference that
/// does not exist verbatim is matched case-insensitively by file name.
pub struct FsSources {
    root: PathBuf,
}

impl FsSources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn locate(&self, reference: &str) -> Option<PathBuf> {
        let direct = self.root.join(reference);
        if direct.is_file() {
            return Some(direct);
        }
        let wanted = reference.to_lowercase();
        fs::read_dir(&self.root)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .find(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .is_some_and(|name| name.to_string_lossy().to_lowercase() == wanted)
            })
    }
}

#[async_trait]
impl SourceResolver for FsSources {
    fn exists(&self, reference: &str) -> bool {
        self.locate(reference).is_some()
    }

    async fn load(&self, reference: &str) -> Result<Vec<u8>, SourceError> {
        let path = self
            .locate(reference)
            .ok_or_else(|| SourceError::NotFound(reference.to_string()))?;
        Ok(tokio::fs::read(path).await?)
    }
}

/// Keeps each backup as `<checksum>.img` plus `<checksum>.json` metadata.
pub struct FsBackupStore {
    dir: PathBuf,
}

impl FsBackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, checksum: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}.img", checksum)),
            self.dir.join(format!("{}.json", checksum)),
        )
    }

    async fn read_meta(path: &Path) -> Result<BasebandBackup, StoreError> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Backend(format!("{}: {}", path.display(), e)))
    }
}

fn is_checksum_key(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl BackupStore for FsBackupStore {
    async fn put(&self, backup: &BasebandBackup) -> Result<(), StoreError> {
        if !is_checksum_key(&backup.checksum) {
            return Err(StoreError::Backend(format!("invalid checksum `{}`", backup.checksum)));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let (img, meta) = self.paths(&backup.checksum);
        let json = serde_json::to_vec_pretty(backup).map_err(|e| StoreError::Backend(e.to_string()))?;
        tokio::fs::write(&img, &backup.data).await?;
        tokio::fs::write(&meta, json).await?;
        Ok(())
    }

    async fn get(&self, checksum: &str) -> Result<Option<BasebandBackup>, StoreError> {
        let checksum = checksum.to_ascii_lowercase();
        if !is_checksum_key(&checksum) {
            return Ok(None);
        }
        let (img, meta) = self.paths(&checksum);
        if !meta.is_file() {
            return Ok(None);
        }
        let mut backup = Self::read_meta(&meta).await?;
        backup.data = tokio::fs::read(&img).await?;
        Ok(Some(backup))
    }

    async fn list(&self) -> Result<Vec<BasebandBackup>, StoreError> {
        let mut backups = Vec::new();
        if !self.dir.is_dir() {
            return Ok(backups);
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                backups.push(Self::read_meta(&path).await?);
            }
        }
        backups.sort_by(|a, b| (a.created_at_unix, &a.partition).cmp(&(b.created_at_unix, &b.partition)));
        Ok(backups)
    }
}
