//! Local filesystem sandbox provider.
//!
//! Every resource is a JSON file at `<root>/<type>/<physical id>.json`.
//! Lets the CLI run a full plan/apply/destroy cycle without a cloud account.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::config::SchemaConfig;
use crate::error::ProviderError;
use crate::graph::{Attributes, Value, ID_ATTRIBUTE};

use super::{Provider, ProviderResult, ResourceSchema};

/// Default sandbox directory, relative to the specification file.
pub const SANDBOX_DIR: &str = ".groundwork/sandbox";

/// Filesystem-backed provider.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
    schemas: BTreeMap<String, ResourceSchema>,
}

impl LocalProvider {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            schemas: BTreeMap::new(),
        }
    }

    /// Uses the schema section of a specification document.
    #[must_use]
    pub fn with_schemas(mut self, schemas: &BTreeMap<String, SchemaConfig>) -> Self {
        self.schemas = schemas
            .iter()
            .map(|(resource_type, config)| {
                (
                    resource_type.clone(),
                    ResourceSchema::with_immutable(config.immutable.iter().cloned()),
                )
            })
            .collect();
        self
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_path(&self, resource_type: &str, physical_id: &str) -> PathBuf {
        self.root
            .join(resource_type)
            .join(format!("{physical_id}.json"))
    }

    async fn write(&self, path: &Path, attributes: &Attributes) -> ProviderResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let content = serde_json::to_string_pretty(attributes)
            .map_err(|e| ProviderError::permanent(format!("Cannot encode attributes: {e}")))?;
        fs::write(path, content).await.map_err(io_error)
    }

    async fn load(&self, resource_type: &str, physical_id: &str) -> ProviderResult<Attributes> {
        let path = self.resource_path(resource_type, physical_id);
        let content = fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ProviderError::not_found(physical_id)
            } else {
                io_error(e)
            }
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ProviderError::permanent(format!("Corrupted sandbox file {}: {e}", path.display()))
        })
    }
}

/// Filesystem errors other than a missing file may go away on retry.
fn io_error(error: std::io::Error) -> ProviderError {
    match error.kind() {
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            ProviderError::permanent(error.to_string())
        }
        _ => ProviderError::transient(error.to_string()),
    }
}

fn with_id(physical_id: &str, mut attributes: Attributes) -> Attributes {
    attributes.insert(ID_ATTRIBUTE.to_string(), Value::from(physical_id));
    attributes
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn schema(&self, resource_type: &str) -> ResourceSchema {
        self.schemas.get(resource_type).cloned().unwrap_or_default()
    }

    async fn create(&self, resource_type: &str, attributes: &Attributes) -> ProviderResult<String> {
        let kind = resource_type
            .split_once('.')
            .map_or(resource_type, |(_, kind)| kind);
        let uuid = Uuid::new_v4().simple().to_string();
        let physical_id = format!("{kind}-{}", &uuid[..12]);

        let path = self.resource_path(resource_type, &physical_id);
        self.write(&path, attributes).await?;
        debug!("Created {resource_type} at {}", path.display());
        Ok(physical_id)
    }

    async fn read(&self, resource_type: &str, physical_id: &str) -> ProviderResult<Attributes> {
        let attributes = self.load(resource_type, physical_id).await?;
        Ok(with_id(physical_id, attributes))
    }

    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        let path = self.resource_path(resource_type, physical_id);
        if !path.exists() {
            return Err(ProviderError::not_found(physical_id));
        }
        self.write(&path, attributes).await?;
        Ok(with_id(physical_id, attributes.clone()))
    }

    async fn delete(&self, resource_type: &str, physical_id: &str) -> ProviderResult<()> {
        let path = self.resource_path(resource_type, physical_id);
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ProviderError::not_found(physical_id)
            } else {
                io_error(e)
            }
        })
    }
}
