//! Local file-based state storage backend.
//!
//! Each environment gets its own directory under the base directory:
//!
//! ```text
//! .groundwork/
//!   dev/state.json
//!   dev/state.lock
//!   prod/state.json
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{GroundworkError, Result, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::StateDocument;

/// Default state directory name.
pub const STATE_DIR: &str = ".groundwork";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Base directory holding one subdirectory per environment.
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Base directory of this store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the state document for `environment`.
    #[must_use]
    pub fn state_path(&self, environment: &str) -> PathBuf {
        self.base_dir.join(environment).join(STATE_FILE)
    }

    fn lock_path(&self, environment: &str) -> PathBuf {
        self.base_dir.join(environment).join(LOCK_FILE)
    }

    /// Ensures the environment directory exists.
    async fn ensure_dir(&self, environment: &str) -> Result<()> {
        let dir = self.base_dir.join(environment);
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(&dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self, environment: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(environment);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        LockInfo::from_json(&content).map(Some)
    }

    /// Creates the lock file, failing if one already exists.
    async fn create_lock_file(&self, environment: &str, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir(environment).await?;
        let content = lock_info.to_json()?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(environment))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StateError::LockFailed {
                        message: String::from("Lock was taken concurrently"),
                    }
                } else {
                    StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }
                }
            })?;

        file.write_all(content.as_bytes()).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;

        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self, environment: &str) -> Result<()> {
        let path = self.lock_path(environment);
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, environment: &str) -> Result<Option<StateDocument>> {
        let path = self.state_path(environment);
        if !path.exists() {
            debug!("State file does not exist: {}", path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", path.display());

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read state file: {e}")))?;

        let state = StateDocument::from_json(&content)?;
        if state.environment != environment {
            return Err(StateError::corrupted(format!(
                "State file for '{environment}' belongs to environment '{}'",
                state.environment
            ))
            .into());
        }

        Ok(Some(state))
    }

    async fn save(&self, environment: &str, state: &StateDocument) -> Result<()> {
        self.ensure_dir(environment).await?;

        let path = self.state_path(environment);
        debug!("Saving state to: {} (serial {})", path.display(), state.serial);

        let content = state.to_json()?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::backend(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    async fn delete(&self, environment: &str) -> Result<()> {
        let path = self.state_path(environment);
        if path.exists() {
            info!("Deleting state file: {}", path.display());
            fs::remove_file(&path)
                .await
                .map_err(|e| StateError::backend(format!("Failed to delete state file: {e}")))?;
        }

        self.delete_lock_file(environment).await
    }

    async fn exists(&self, environment: &str) -> Result<bool> {
        Ok(self.state_path(environment).exists())
    }

    async fn acquire_lock(&self, environment: &str, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file(environment).await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
            self.delete_lock_file(environment).await?;
        }

        let lock_info = LockInfo::new(environment, holder);
        self.create_lock_file(environment, &lock_info).await?;

        info!(
            "Acquired state lock for {environment}: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock_info.lock_id
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, environment: &str, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file(environment).await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file(environment).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self, environment: &str) -> Result<Option<LockInfo>> {
        self.read_lock_file(environment).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
