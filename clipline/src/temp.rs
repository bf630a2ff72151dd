//! Per-run scratch file management.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{io_error, Result};

/// Owns the `temp/` directory of a single run.
///
/// Scratch files for every stage land here; the whole directory is removed
/// on normal completion and optionally retained on failure for inspection.
#[derive(Debug, Clone)]
pub struct TempFileManager {
    dir: PathBuf,
    retain_on_failure: bool,
}

impl TempFileManager {
    pub fn new(dir: impl Into<PathBuf>, retain_on_failure: bool) -> Self {
        Self {
            dir: dir.into(),
            retain_on_failure,
        }
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("creating temp directory", &self.dir, e))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scratch path for one stage, e.g. `temp/transcribe/`.
    pub async fn stage_dir(&self, stage: &str) -> Result<PathBuf> {
        let dir = self.dir.join(stage);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("creating stage temp directory", &dir, e))?;
        Ok(dir)
    }

    /// Remove scratch files after a successful run.
    pub async fn cleanup_on_success(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove temp directory");
            }
        } else {
            debug!(dir = %self.dir.display(), "temp directory removed");
        }
    }

    /// Remove scratch files after a failed run unless configured to retain.
    pub async fn cleanup_on_failure(&self) {
        if self.retain_on_failure {
            debug!(dir = %self.dir.display(), "retaining temp directory for inspection");
            return;
        }
        self.cleanup_on_success().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_dir_created_under_root() {
        let root = tempfile::tempdir().unwrap();
        let temp = TempFileManager::new(root.path().join("temp"), false);
        temp.ensure().await.unwrap();
        let dir = temp.stage_dir("transcribe").await.unwrap();
        assert!(dir.starts_with(temp.dir()));
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_retain_on_failure() {
        let root = tempfile::tempdir().unwrap();
        let temp = TempFileManager::new(root.path().join("temp"), true);
        temp.ensure().await.unwrap();
        temp.cleanup_on_failure().await;
        assert!(temp.dir().is_dir());

        temp.cleanup_on_success().await;
        assert!(!temp.dir().is_dir());
    }
}
