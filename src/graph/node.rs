//! Resource nodes of the dependency graph.

use serde::Serialize;
use std::collections::BTreeSet;

use super::value::{attribute_references, Attributes, Reference};

/// A single declared resource, immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceNode {
    /// User-assigned stable name.
    pub logical_id: String,
    /// Resource type, e.g. `network.vpc`.
    pub resource_type: String,
    /// Desired attributes, possibly containing references.
    pub attributes: Attributes,
    /// Dependencies declared with `depends_on`.
    pub explicit_dependencies: BTreeSet<String>,
    /// Dependencies inferred from references and nesting.
    pub inferred_dependencies: BTreeSet<String>,
    /// Enclosing declaration for nested resources.
    pub parent: Option<String>,
}

impl ResourceNode {
    /// Creates a node with no attributes or dependencies.
    #[must_use]
    pub fn new(logical_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            resource_type: resource_type.into(),
            attributes: Attributes::new(),
            explicit_dependencies: BTreeSet::new(),
            inferred_dependencies: BTreeSet::new(),
            parent: None,
        }
    }

    /// Adds a desired attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<super::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.explicit_dependencies.insert(logical_id.into());
        self
    }

    /// All dependencies, explicit and inferred.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.explicit_dependencies
            .iter()
            .chain(self.inferred_dependencies.iter())
            .map(String::as_str)
            .collect()
    }

    /// Returns true if this node depends on `logical_id`.
    #[must_use]
    pub fn depends_on_id(&self, logical_id: &str) -> bool {
        self.explicit_dependencies.contains(logical_id)
            || self.inferred_dependencies.contains(logical_id)
    }

    /// References held by the desired attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        attribute_references(&self.attributes)
    }

    /// Attribute keys whose values reference `logical_id`.
    #[must_use]
    pub fn attributes_referencing(&self, logical_id: &str) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, value)| {
                value
                    .references()
                    .iter()
                    .any(|r| r.resource() == logical_id)
            })
            .map(|(key, _)| key.as_str())
            .collect()
    }
}
