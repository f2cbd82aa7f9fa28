// File destination - Staged output committed atomically on close

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::domain::errors::*;
use crate::ports::DestinationSink;

/// Writes into a temporary file next to the target and renames it into
/// place on `close`. `abort` deletes the temporary file, so a cancelled or
/// failed job never leaves a partial output behind.
pub struct FileDestination {
    target: PathBuf,
    staging: Option<NamedTempFile>,
    overwrite: bool,
    bytes_written: u64,
}

impl FileDestination {
    /// Stage output for `target`; fails if it exists and `overwrite` is off
    pub fn create(target: &Path, overwrite: bool) -> Result<Self, DomainError> {
        if target.exists() && !overwrite {
            return Err(DomainError::BadArgs(format!(
                "Output file already exists: {} (use --overwrite)",
                target.display()
            )));
        }
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        // Keep the extension so format-guessing muxers pick the right container
        let suffix = target
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let staging = tempfile::Builder::new()
            .prefix(".transcodex-")
            .suffix(&suffix)
            .tempfile_in(&dir)
            .map_err(|e| DomainError::Io(format!("Failed to create staging file in {}: {}", dir.display(), e)))?;
        debug!("Staging output at {}", staging.path().display());
        Ok(Self {
            target: target.to_path_buf(),
            staging: Some(staging),
            overwrite,
            bytes_written: 0,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn staging_mut(&mut self) -> Result<&mut NamedTempFile, DomainError> {
        self.staging
            .as_mut()
            .ok_or_else(|| DomainError::Io("Destination already closed".to_string()))
    }
}

#[async_trait]
impl DestinationSink for FileDestination {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), DomainError> {
        self.staging_mut()?.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DomainError> {
        let mut staging = self
            .staging
            .take()
            .ok_or_else(|| DomainError::Io("Destination already closed".to_string()))?;
        staging.flush()?;
        staging.as_file().sync_all()?;
        let persisted = if self.overwrite {
            staging.persist(&self.target)
        } else {
            staging.persist_noclobber(&self.target)
        };
        persisted.map_err(|e| DomainError::Io(format!("Failed to write {}: {}", self.target.display(), e.error)))?;
        info!("Wrote {}", self.target.display());
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), DomainError> {
        if let Some(staging) = self.staging.take() {
            debug!("Discarding staged output {}", staging.path().display());
            staging.close()?;
        }
        Ok(())
    }

    fn staging_path(&self) -> Option<&Path> {
        self.staging.as_ref().map(NamedTempFile::path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_persists_output() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.mp4");
        let mut dest = FileDestination::create(&target, false).unwrap();
        let staging = dest.staging_path().unwrap().to_path_buf();
        assert_eq!(staging.extension().unwrap(), "mp4");

        dest.write(b"hello ").await.unwrap();
        dest.write(b"world").await.unwrap();
        assert!(!target.exists());
        dest.close().await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
        assert!(!staging.exists());
        assert_eq!(dest.bytes_written(), 11);
        assert!(dest.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_abort_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.webm");
        let mut dest = FileDestination::create(&target, false).unwrap();
        let staging = dest.staging_path().unwrap().to_path_buf();
        dest.write(b"partial").await.unwrap();
        dest.abort().await.unwrap();
        assert!(!staging.exists());
        assert!(!target.exists());
        assert!(dest.abort().await.is_ok());
    }

    #[test]
    fn test_refuses_existing_target_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("exists.mp4");
        std::fs::write(&target, b"x").unwrap();
        assert!(matches!(
            FileDestination::create(&target, false),
            Err(DomainError::BadArgs(_))
        ));
        assert!(FileDestination::create(&target, true).is_ok());
    }
}
