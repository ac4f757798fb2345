//! S3-based state storage backend.
//!
//! Remote state for teams and CI: documents live at
//! `s3://<bucket>/<prefix><environment>/state.json`. A PUT replaces the
//! object atomically, so readers never observe a partial document.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::StateDocument;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key of a file belonging to `environment`.
    fn key(&self, environment: &str, file: &str) -> String {
        object_key(&self.prefix, environment, file)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }
}

/// Normalizes a key prefix to either empty or `segment/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

fn object_key(prefix: &str, environment: &str, file: &str) -> String {
    format!("{prefix}{environment}/{file}")
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, environment: &str) -> Result<Option<StateDocument>> {
        let key = self.key(environment, STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3 for {environment}");
            return Ok(None);
        };

        let state = StateDocument::from_json(&json)?;
        info!(
            "Loaded state for {}/{} (serial {})",
            state.project, state.environment, state.serial
        );
        Ok(Some(state))
    }

    async fn save(&self, environment: &str, state: &StateDocument) -> Result<()> {
        let key = self.key(environment, STATE_KEY);
        debug!("Saving state to s3://{}/{key}", self.bucket);

        let content = state.to_json()?;
        self.put_object(&key, &content).await
    }

    async fn delete(&self, environment: &str) -> Result<()> {
        let state_key = self.key(environment, STATE_KEY);
        let lock_key = self.key(environment, LOCK_KEY);

        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&lock_key).await
    }

    async fn exists(&self, environment: &str) -> Result<bool> {
        self.object_exists(&self.key(environment, STATE_KEY)).await
    }

    async fn acquire_lock(&self, environment: &str, holder: &str) -> Result<LockInfo> {
        let key = self.key(environment, LOCK_KEY);

        if let Some(existing) = self.get_lock_info(environment).await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
        }

        let lock_info = LockInfo::new(environment, holder);
        self.put_object(&key, &lock_info.to_json()?).await?;

        info!(
            "Acquired state lock for {environment}: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock_info.lock_id
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, environment: &str, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info(environment).await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(environment, LOCK_KEY)).await?;
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
        match self.get_object(&self.key(environment, LOCK_KEY)).await? {
            Some(content) => LockInfo::from_json(&content).map(Some),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("teams/infra/")), "teams/infra/");
        assert_eq!(normalize_prefix(Some("/groundwork")), "groundwork/");
    }

    #[test]
    fn test_keys_are_environment_scoped() {
        assert_eq!(object_key("", "dev", STATE_KEY), "dev/state.json");
        assert_eq!(
            object_key("groundwork/", "prod", LOCK_KEY),
            "groundwork/prod/state.lock"
        );
    }
}
