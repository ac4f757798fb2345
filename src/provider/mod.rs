//! Provider plugin interface.
//!
//! A provider performs the real-world side of a resource operation for one
//! cloud or resource family. The engine never talks to an API directly; it
//! resolves a provider through the [`ProviderRegistry`] and dispatches its
//! retry policy on the [`ProviderError`] classification returned here.

mod local;
mod memory;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{ProviderError, SpecificationError};
use crate::graph::{Attributes, DependencyGraph};

pub use local::{LocalProvider, SANDBOX_DIR};
pub use memory::{Fault, MemoryProvider, ProviderCall, ProviderOperation};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Static description of a resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Attributes that cannot change in place; changing one forces a replace.
    pub immutable: BTreeSet<String>,
}

impl ResourceSchema {
    /// Creates a schema with the given immutable attributes.
    #[must_use]
    pub fn with_immutable<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            immutable: attributes.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if changing `attribute` requires a replacement.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.contains(attribute)
    }
}

/// Capability contract implemented per cloud or resource family.
///
/// Attributes passed to `create` and `update` have every reference resolved.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &'static str;

    /// Schema of a resource type. Must be local and side-effect free.
    fn schema(&self, resource_type: &str) -> ResourceSchema {
        let _ = resource_type;
        ResourceSchema::default()
    }

    /// Creates a resource and returns its physical id.
    async fn create(&self, resource_type: &str, attributes: &Attributes) -> ProviderResult<String>;

    /// Reads the current attributes (outputs included) of a resource.
    async fn read(&self, resource_type: &str, physical_id: &str) -> ProviderResult<Attributes>;

    /// Updates a resource in place and returns its new attributes.
    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, physical_id: &str) -> ProviderResult<()>;
}

/// Resolves resource types to providers.
///
/// Lookup order is the exact type, then the family (`network` for
/// `network.vpc`), then the default provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_type: BTreeMap<String, Arc<dyn Provider>>,
    by_family: BTreeMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for one exact resource type.
    #[must_use]
    pub fn with_type(mut self, resource_type: &str, provider: Arc<dyn Provider>) -> Self {
        self.by_type.insert(resource_type.to_string(), provider);
        self
    }

    /// Registers a provider for every type of a family.
    #[must_use]
    pub fn with_family(mut self, family: &str, provider: Arc<dyn Provider>) -> Self {
        self.by_family.insert(family.to_string(), provider);
        self
    }

    /// Sets the provider used when nothing more specific matches.
    #[must_use]
    pub fn with_default(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    /// Resolves the provider for `resource_type`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecificationError::UnknownResourceType`] if no provider
    /// handles the type.
    pub fn resolve(
        &self,
        resource_type: &str,
    ) -> std::result::Result<Arc<dyn Provider>, SpecificationError> {
        let family = resource_type
            .split_once('.')
            .map_or(resource_type, |(family, _)| family);

        self.by_type
            .get(resource_type)
            .or_else(|| self.by_family.get(family))
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| SpecificationError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            })
    }

    /// Returns the schema of `resource_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if no provider handles the type.
    pub fn schema(
        &self,
        resource_type: &str,
    ) -> std::result::Result<ResourceSchema, SpecificationError> {
        Ok(self.resolve(resource_type)?.schema(resource_type))
    }

    /// Checks that every node of `graph` has a provider.
    ///
    /// # Errors
    ///
    /// Returns the first unsupported type in logical id order.
    pub fn ensure_supported(
        &self,
        graph: &DependencyGraph,
    ) -> std::result::Result<(), SpecificationError> {
        for node in graph.nodes() {
            self.resolve(&node.resource_type)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.by_type.keys().collect::<Vec<_>>())
            .field("families", &self.by_family.keys().collect::<Vec<_>>())
            .field("has_default", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &'static str) -> Arc<dyn Provider> {
        let mut mock = MockProvider::new();
        mock.expect_name().return_const(name);
        Arc::new(mock)
    }

    #[test]
    fn test_resolution_order() {
        let registry = ProviderRegistry::new()
            .with_type("network.vpc", named("exact"))
            .with_family("network", named("family"))
            .with_default(named("default"));

        assert_eq!(registry.resolve("network.vpc").expect("vpc").name(), "exact");
        assert_eq!(
            registry.resolve("network.subnet").expect("subnet").name(),
            "family"
        );
        assert_eq!(
            registry.resolve("storage.bucket").expect("bucket").name(),
            "default"
        );
    }

    #[test]
    fn test_unknown_type() {
        let registry = ProviderRegistry::new().with_family("network", named("family"));
        let err = registry.resolve("compute.server").err().expect("unknown");
        assert!(matches!(
            err,
            SpecificationError::UnknownResourceType { ref resource_type } if resource_type == "compute.server"
        ));
    }

    #[test]
    fn test_schema_lookup() {
        let mut mock = MockProvider::new();
        mock.expect_schema()
            .returning(|_| ResourceSchema::with_immutable(["cidr"]));
        let registry = ProviderRegistry::new().with_default(Arc::new(mock));

        let schema = registry.schema("network.vpc").expect("schema");
        assert!(schema.is_immutable("cidr"));
        assert!(!schema.is_immutable("name"));
    }
}
