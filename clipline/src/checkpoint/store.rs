//! Durable checkpoint store.
//!
//! One directory per run under the state root:
//!
//! ```text
//! <state_root>/<run_id>/
//!   checkpoint.json     atomic rewrite (write-to-temp, fsync, rename)
//!   lock                presence indicates a live owner
//!   temp/               per-stage scratch files
//! ```

use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::Checkpoint;
use crate::error::{io_error, ErrorKind, PipelineError, Result};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const LOCK_FILE: &str = "lock";
const TEMP_DIR: &str = "temp";

/// File-backed checkpoint store keyed by run id.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    state_root: PathBuf,
    /// Store-wide expiration; `None` keeps checkpoints forever.
    expire_after: Option<ChronoDuration>,
}

impl CheckpointStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            expire_after: None,
        }
    }

    pub fn with_expiration_hours(mut self, hours: Option<u64>) -> Self {
        self.expire_after = hours.map(|h| ChronoDuration::hours(h as i64));
        self
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.state_root.join(run_id)
    }

    /// Open a run for exclusive ownership.
    ///
    /// Refuses with an `already locked` error when another live process owns
    /// the run. The returned handle removes the lock on drop.
    pub async fn open(&self, run_id: &str) -> Result<RunHandle> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(dir.join(TEMP_DIR))
            .await
            .map_err(|e| io_error("creating run directory", &dir, e))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path);
        match lock {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(&lock_path).unwrap_or_default();
                return Err(PipelineError::new(
                    ErrorKind::CorruptState,
                    format!(
                        "run {run_id} is already locked by process {}",
                        owner.trim()
                    ),
                ));
            }
            Err(e) => return Err(io_error("creating lock file", &lock_path, e)),
        }

        debug!(run_id = %run_id, dir = %dir.display(), "opened run");
        Ok(RunHandle {
            run_id: run_id.to_string(),
            dir,
            last_saved_stage: Mutex::new(None),
            deleted: Mutex::new(false),
        })
    }

    /// Read a checkpoint without taking ownership.
    pub async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.run_dir(run_id).join(CHECKPOINT_FILE);
        load_checkpoint_file(&path).await
    }

    /// Remove all persisted state for a run.
    pub async fn delete(&self, run_id: &str) -> Result<()> {
        let dir = self.run_dir(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("removing run directory", &dir, e)),
        }
    }

    /// All non-terminal, non-expired checkpoints under the state root.
    pub async fn list_incomplete(&self) -> Result<Vec<Checkpoint>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.state_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(io_error("reading state root", &self.state_root, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("reading state root", &self.state_root, e))?
        {
            let path = entry.path().join(CHECKPOINT_FILE);
            let checkpoint = match load_checkpoint_file(&path).await {
                Ok(Some(cp)) => cp,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            };
            if checkpoint.is_terminal() || self.is_expired(&checkpoint) {
                continue;
            }
            found.push(checkpoint);
        }

        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    pub fn is_expired(&self, checkpoint: &Checkpoint) -> bool {
        match self.expire_after {
            Some(age) => Utc::now() - checkpoint.updated_at > age,
            None => false,
        }
    }
}

async fn load_checkpoint_file(path: &Path) -> Result<Option<Checkpoint>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error("reading checkpoint", path, e)),
    };
    let checkpoint = serde_json::from_str(&raw).map_err(|e| {
        PipelineError::new(
            ErrorKind::CorruptState,
            format!("unreadable checkpoint {}: {e}", path.display()),
        )
    })?;
    Ok(Some(checkpoint))
}

/// Exclusive handle on one run's persisted state.
///
/// Saves are file-level atomic and the stage cursor is not allowed to move
/// backwards through this handle.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    dir: PathBuf,
    last_saved_stage: Mutex<Option<u8>>,
    deleted: Mutex<bool>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.join(TEMP_DIR)
    }

    /// Persist a checkpoint snapshot atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        {
            let mut last = self.last_saved_stage.lock();
            let index = checkpoint.stage.index();
            if let Some(prev) = *last {
                if index < prev {
                    return Err(PipelineError::new(
                        ErrorKind::CorruptState,
                        format!(
                            "stage cursor would move backwards ({} -> {})",
                            prev, index
                        ),
                    ));
                }
            }
            *last = Some(index);
        }

        let path = self.dir.join(CHECKPOINT_FILE);
        let tmp = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        let payload = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error("creating checkpoint temp file", &tmp, e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| io_error("writing checkpoint", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("syncing checkpoint", &tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("publishing checkpoint", &path, e))?;
        debug!(run_id = %self.run_id, stage = %checkpoint.stage, "checkpoint saved");
        Ok(())
    }

    /// Load the latest persisted snapshot for this run.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        load_checkpoint_file(&self.dir.join(CHECKPOINT_FILE)).await
    }

    /// Write an auxiliary JSON document (stage artifacts) into the run dir.
    pub async fn save_document<T: serde::Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let payload = serde_json::to_vec_pretty(value)?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error("creating document temp file", &tmp, e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| io_error("writing document", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("syncing document", &tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("publishing document", &path, e))
    }

    /// Load an auxiliary JSON document, if present.
    pub async fn load_document<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>> {
        let path = self.dir.join(name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("reading document", &path, e)),
        };
        let value = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::new(
                ErrorKind::CorruptState,
                format!("unreadable document {}: {e}", path.display()),
            )
        })?;
        Ok(Some(value))
    }

    /// Delete the whole run directory (used after successful completion).
    pub async fn delete(&self) -> Result<()> {
        *self.deleted.lock() = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("removing run directory", &self.dir, e)),
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if *self.deleted.lock() {
            return;
        }
        let lock_path = self.dir.join(LOCK_FILE);
        if let Err(e) = std::fs::remove_file(&lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %lock_path.display(), error = %e, "failed to release run lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Stage;
    use crate::config::AppConfig;

    fn checkpoint(run_id: &str) -> Checkpoint {
        Checkpoint::new(run_id, "https://example.test/v", AppConfig::default())
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(root.path());
        let handle = store.open("run-a").await.unwrap();

        let mut cp = checkpoint("run-a");
        cp.advance_to(Stage::Translate);
        cp.complete_item("1");
        cp.complete_item("2");
        handle.save(&cp).await.unwrap();

        let loaded = handle.load().await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Translate);
        assert_eq!(loaded.completed_items, cp.completed_items);
        assert_eq!(loaded.source_url, cp.source_url);
    }

    #[tokio::test]
    async fn test_open_refuses_second_owner() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(root.path());
        let _first = store.open("run-b").await.unwrap();

        let second = store.open("run-b").await;
        let err = second.err().expect("second open must fail");
        assert_eq!(err.kind, ErrorKind::CorruptState);
        assert!(err.message.contains("locked"));
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(root.path());
        drop(store.open("run-c").await.unwrap());
        assert!(store.open("run-c").await.is_ok());
    }

    #[tokio::test]
    async fn test_stage_cursor_never_regresses() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(root.path());
        let handle = store.open("run-d").await.unwrap();

        let mut cp = checkpoint("run-d");
        cp.advance_to(Stage::Analyze);
        handle.save(&cp).await.unwrap();

        cp.stage = Stage::Fetch;
        let err = handle.save(&cp).await.err().expect("regression must fail");
        assert_eq!(err.kind, ErrorKind::CorruptState);
    }

    #[tokio::test]
    async fn test_list_incomplete_skips_terminal() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(root.path());

        let live = store.open("run-live").await.unwrap();
        let mut cp = checkpoint("run-live");
        cp.advance_to(Stage::Translate);
        live.save(&cp).await.unwrap();

        let done = store.open("run-done").await.unwrap();
        let mut cp = checkpoint("run-done");
        cp.advance_to(Stage::Completed);
        done.save(&cp).await.unwrap();

        let incomplete = store.list_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].run_id, "run-live");
    }

    #[tokio::test]
    async fn test_delete_removes_run() {
        let root = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(root.path());
        let handle = store.open("run-e").await.unwrap();
        handle.save(&checkpoint("run-e")).await.unwrap();
        handle.delete().await.unwrap();
        assert!(store.load("run-e").await.unwrap().is_none());
    }
}
