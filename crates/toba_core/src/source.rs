//! Image and checksum file lookup.
//!
//! Scripts name their files by reference; the surrounding application decides
//! where references live. The core only asks whether one exists (at parse
//! time) and loads its bytes (at execution time).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("`{0}` not found")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    fn exists(&self, reference: &str) -> bool;

    async fn load(&self, reference: &str) -> Result<Vec<u8>, SourceError>;
}

/// Sources held in memory, keyed by exact reference.
#[derive(Default)]
pub struct MemorySources {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, reference: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(reference, data);
        self
    }

    pub fn insert(&self, reference: &str, data: impl Into<Vec<u8>>) {
        if let Ok(mut files) = self.files.write() {
            files.insert(reference.to_string(), data.into());
        }
    }
}

#[async_trait]
impl SourceResolver for MemorySources {
    fn exists(&self, reference: &str) -> bool {
        self.files.read().map(|f| f.contains_key(reference)).unwrap_or(false)
    }

    async fn load(&self, reference: &str) -> Result<Vec<u8>, SourceError> {
        self.files
            .read()
            .ok()
            .and_then(|f| f.get(reference).cloned())
            .ok_or_else(|| SourceError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sources() {
        let sources = MemorySources::new().with("boot.img", b"kernel".to_vec());
        assert!(sources.exists("boot.img"));
        assert!(!sources.exists("BOOT.IMG"));
        assert_eq!(sources.load("boot.img").await.unwrap(), b"kernel");
        assert!(matches!(sources.load("dtbo.img").await, Err(SourceError::NotFound(_))));
    }
}
