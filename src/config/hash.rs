//! Specification hashing for change detection.
//!
//! Deterministic hashes identify which specification a plan was computed
//! from and which one was last applied to an environment.

use sha2::{Digest, Sha256};

use crate::graph::{Attributes, DependencyGraph, ResourceNode};

/// Hasher for computing specification hashes.
#[derive(Debug, Default)]
pub struct SpecHasher;

impl SpecHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole desired graph.
    ///
    /// Nodes are visited in logical id order, so the hash is independent of
    /// declaration order in the source document.
    #[must_use]
    pub fn hash_graph(&self, graph: &DependencyGraph) -> String {
        let mut hasher = Sha256::new();

        for node in graph.nodes() {
            hasher.update(self.hash_node(node).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource node.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();

        hasher.update(node.logical_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(node.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.hash_attributes(&node.attributes).as_bytes());

        for dep in node.dependencies() {
            hasher.update(dep.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of an attribute mapping.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        // BTreeMap keys serialize in sorted order
        let canonical = serde_json::to_vec(attributes).unwrap_or_default();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDeclaration;
    use crate::graph::{GraphBuilder, Value};
    use std::collections::BTreeMap;

    fn graph(cidr: &str) -> DependencyGraph {
        let mut vpc = ResourceDeclaration::new("network.vpc");
        vpc.properties
            .insert(String::from("cidr"), Value::from(cidr));
        let mut web = ResourceDeclaration::new("compute.server");
        web.depends_on.push(String::from("vpc"));

        let declarations = BTreeMap::from([
            (String::from("web"), web),
            (String::from("vpc"), vpc),
        ]);
        GraphBuilder::new().build(&declarations).expect("graph")
    }

    #[test]
    fn test_graph_hash_deterministic() {
        let hasher = SpecHasher::new();
        assert_eq!(
            hasher.hash_graph(&graph("10.0.0.0/16")),
            hasher.hash_graph(&graph("10.0.0.0/16"))
        );
    }

    #[test]
    fn test_attribute_change_changes_hash() {
        let hasher = SpecHasher::new();
        assert_ne!(
            hasher.hash_graph(&graph("10.0.0.0/16")),
            hasher.hash_graph(&graph("10.1.0.0/16"))
        );
    }

    #[test]
    fn test_short_hash() {
        let hasher = SpecHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(SpecHasher::hashes_match("abc123", "abc123"));
        assert!(!SpecHasher::hashes_match("abc123", "abc124"));
        assert!(!SpecHasher::hashes_match("abc123", "abc12"));
    }
}
