//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Each environment has its own document and its own lock.

use async_trait::async_trait;

use crate::error::{Result, StateError};
use super::lock::LockInfo;
use super::types::{RecordStatus, StateDocument};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state document of an environment.
    ///
    /// Returns `None` if no state exists yet. Unparseable content is a
    /// [`StateError::Corrupted`] error, never an empty state.
    async fn load(&self, environment: &str) -> Result<Option<StateDocument>>;

    /// Atomically replaces the state document of an environment.
    async fn save(&self, environment: &str, state: &StateDocument) -> Result<()>;

    /// Deletes the state document of an environment.
    async fn delete(&self, environment: &str) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self, environment: &str) -> Result<bool>;

    /// Acquires a lock on the state of an environment.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, environment: &str, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, environment: &str, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self, environment: &str) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self, environment: &str) -> Result<bool> {
        Ok(self
            .get_lock_info(environment)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Updates the status of a single record and persists the document.
    async fn record_status(
        &self,
        environment: &str,
        logical_id: &str,
        status: RecordStatus,
    ) -> Result<()> {
        let mut state = self.load(environment).await?.ok_or_else(|| StateError::RecordNotFound {
            logical_id: logical_id.to_string(),
        })?;

        if !state.record_status(logical_id, status) {
            return Err(StateError::RecordNotFound {
                logical_id: logical_id.to_string(),
            }
            .into());
        }

        self.save(environment, &state).await
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self, environment: &str) -> Result<Option<StateDocument>> {
        (**self).load(environment).await
    }

    async fn save(&self, environment: &str, state: &StateDocument) -> Result<()> {
        (**self).save(environment, state).await
    }

    async fn delete(&self, environment: &str) -> Result<()> {
        (**self).delete(environment).await
    }

    async fn exists(&self, environment: &str) -> Result<bool> {
        (**self).exists(environment).await
    }

    async fn acquire_lock(&self, environment: &str, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(environment, holder).await
    }

    async fn release_lock(&self, environment: &str, lock_id: &str) -> Result<()> {
        (**self).release_lock(environment, lock_id).await
    }

    async fn get_lock_info(&self, environment: &str) -> Result<Option<LockInfo>> {
        (**self).get_lock_info(environment).await
    }

    async fn is_locked(&self, environment: &str) -> Result<bool> {
        (**self).is_locked(environment).await
    }

    async fn record_status(
        &self,
        environment: &str,
        logical_id: &str,
        status: RecordStatus,
    ) -> Result<()> {
        (**self).record_status(environment, logical_id, status).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
