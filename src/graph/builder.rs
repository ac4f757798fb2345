//! Resource graph builder.
//!
//! Turns the declaration tree of a specification document into a
//! [`DependencyGraph`]. Nested declarations are flattened to `parent/child`
//! logical ids, references and `depends_on` entries become edges, and the
//! result is checked for unresolved targets and cycles. The transformation is
//! pure: nothing outside the returned graph is touched.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::{ResourceDeclaration, SpecDocument};
use crate::error::{Result, SpecificationError};

use super::dag::{find_cycle_in, DependencyGraph};
use super::node::ResourceNode;

/// Separator between a parent id and a nested child id.
pub const NESTING_SEPARATOR: char = '/';

/// Builds dependency graphs from declarations.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    /// Enabled state of each declared feature.
    features: BTreeMap<String, bool>,
}

impl GraphBuilder {
    /// Creates a builder with no features declared.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            features: BTreeMap::new(),
        }
    }

    /// Sets the feature toggles used to filter declarations.
    #[must_use]
    pub fn with_features(mut self, features: BTreeMap<String, bool>) -> Self {
        self.features = features;
        self
    }

    /// Builds the graph of a full specification document.
    ///
    /// # Errors
    ///
    /// Returns a specification error for duplicate ids, unresolved references
    /// or cycles.
    pub fn build_document(document: &SpecDocument) -> Result<DependencyGraph> {
        Self::new()
            .with_features(document.features.clone())
            .build(&document.resources)
    }

    /// Builds the graph of a declaration tree.
    ///
    /// # Errors
    ///
    /// Returns a specification error for invalid ids, unknown features,
    /// duplicate ids, unresolved references or cycles.
    pub fn build(
        &self,
        declarations: &BTreeMap<String, ResourceDeclaration>,
    ) -> Result<DependencyGraph> {
        let mut nodes = BTreeMap::new();
        for (name, declaration) in declarations {
            self.flatten(name, declaration, None, &mut nodes)?;
        }

        Self::resolve_edges(&mut nodes)?;

        if let Some(cycle) = find_cycle_in(&nodes) {
            return Err(SpecificationError::CyclicDependency {
                cycle: cycle.join(" -> "),
            }
            .into());
        }

        let graph = DependencyGraph::from_nodes(nodes);
        debug!(
            "Built dependency graph: {} nodes, {} edges",
            graph.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    /// Flattens one declaration and its children into `nodes`.
    fn flatten(
        &self,
        name: &str,
        declaration: &ResourceDeclaration,
        parent: Option<&str>,
        nodes: &mut BTreeMap<String, ResourceNode>,
    ) -> Result<()> {
        validate_id_segment(name)?;

        let logical_id =
            parent.map_or_else(|| name.to_string(), |p| format!("{p}{NESTING_SEPARATOR}{name}"));

        if !self.is_enabled(&logical_id, declaration)? {
            debug!("Skipping '{logical_id}': feature disabled");
            return Ok(());
        }

        if nodes.contains_key(&logical_id) {
            return Err(SpecificationError::DuplicateId { logical_id }.into());
        }

        let mut node = ResourceNode::new(logical_id.clone(), declaration.resource_type.clone());
        node.attributes = declaration.properties.clone();
        node.explicit_dependencies = declaration.depends_on.iter().cloned().collect();
        node.parent = parent.map(String::from);
        nodes.insert(logical_id.clone(), node);

        for (child_name, child) in &declaration.children {
            self.flatten(child_name, child, Some(&logical_id), nodes)?;
        }

        Ok(())
    }

    /// Returns whether a declaration's feature gate is open.
    fn is_enabled(&self, logical_id: &str, declaration: &ResourceDeclaration) -> Result<bool> {
        let Some(feature) = &declaration.feature else {
            return Ok(true);
        };
        self.features.get(feature).copied().ok_or_else(|| {
            SpecificationError::validation(
                format!("Resource '{logical_id}' uses undeclared feature '{feature}'"),
                format!("resources.{logical_id}.feature"),
            )
            .into()
        })
    }

    /// Infers reference and nesting edges and checks every target exists.
    fn resolve_edges(nodes: &mut BTreeMap<String, ResourceNode>) -> Result<()> {
        let known: BTreeSet<String> = nodes.keys().cloned().collect();

        for node in nodes.values_mut() {
            let mut inferred: BTreeSet<String> = node
                .references()
                .iter()
                .map(|r| r.resource().to_string())
                .collect();

            if let Some(parent) = &node.parent
                && known.contains(parent)
            {
                inferred.insert(parent.clone());
            }

            for target in node.explicit_dependencies.iter().chain(inferred.iter()) {
                if !known.contains(target) {
                    return Err(SpecificationError::UnresolvedReference {
                        from: node.logical_id.clone(),
                        target: target.clone(),
                    }
                    .into());
                }
            }

            node.inferred_dependencies = inferred;
        }

        Ok(())
    }
}

/// Checks that a declaration name can be used as a logical id segment.
fn validate_id_segment(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.contains('.')
        && !name.contains(NESTING_SEPARATOR)
        && !name.chars().any(char::is_whitespace);

    if valid {
        Ok(())
    } else {
        Err(SpecificationError::validation(
            format!("Invalid logical id '{name}': must be non-empty without '.', '/' or whitespace"),
            format!("resources.{name}"),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GroundworkError;

    fn parse(yaml: &str) -> BTreeMap<String, ResourceDeclaration> {
        serde_yaml::from_str(yaml).expect("valid declarations")
    }

    #[test]
    fn test_references_become_edges() {
        let declarations = parse(
            r#"
net:
  type: network.vpc
  properties:
    cidr: 10.0.0.0/16
sg:
  type: network.security_group
  properties:
    vpc: { $ref: net }
web:
  type: compute.server
  depends_on: [sg]
"#,
        );

        let graph = GraphBuilder::new().build(&declarations).expect("graph");
        let sg = graph.node("sg").expect("sg");
        assert!(sg.inferred_dependencies.contains("net"));
        let web = graph.node("web").expect("web");
        assert!(web.explicit_dependencies.contains("sg"));
        assert_eq!(
            graph.topological_order().expect("order"),
            vec!["net", "sg", "web"]
        );
    }

    #[test]
    fn test_children_are_flattened_with_parent_edge() {
        let declarations = parse(
            r"
app:
  type: compute.group
  children:
    bucket:
      type: storage.bucket
",
        );

        let graph = GraphBuilder::new().build(&declarations).expect("graph");
        let child = graph.node("app/bucket").expect("child");
        assert_eq!(child.parent.as_deref(), Some("app"));
        assert!(child.depends_on_id("app"));
    }

    #[test]
    fn test_unresolved_reference() {
        let declarations = parse(
            r"
web:
  type: compute.server
  properties:
    subnet: { $ref: missing.id }
",
        );

        let err = GraphBuilder::new().build(&declarations).unwrap_err();
        assert!(matches!(
            err,
            GroundworkError::Specification(SpecificationError::UnresolvedReference { ref target, .. })
                if target == "missing"
        ));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let declarations = parse(
            r"
a:
  type: t.x
  depends_on: [b]
b:
  type: t.x
  properties:
    peer: { $ref: a }
",
        );

        let err = GraphBuilder::new().build(&declarations).unwrap_err();
        assert!(matches!(
            err,
            GroundworkError::Specification(SpecificationError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let declarations = parse(
            r"
a:
  type: t.x
  depends_on: [a]
",
        );

        assert!(GraphBuilder::new().build(&declarations).is_err());
    }

    #[test]
    fn test_feature_toggles() {
        let declarations = parse(
            r"
net:
  type: network.vpc
wheels:
  type: storage.bucket
  feature: wheels
",
        );

        let disabled = GraphBuilder::new()
            .with_features(BTreeMap::from([(String::from("wheels"), false)]))
            .build(&declarations)
            .expect("graph");
        assert!(!disabled.contains("wheels"));

        let enabled = GraphBuilder::new()
            .with_features(BTreeMap::from([(String::from("wheels"), true)]))
            .build(&declarations)
            .expect("graph");
        assert!(enabled.contains("wheels"));

        assert!(GraphBuilder::new().build(&declarations).is_err());
    }

    #[test]
    fn test_invalid_id() {
        let declarations = parse(
            r"
bad.name:
  type: t.x
",
        );
        assert!(GraphBuilder::new().build(&declarations).is_err());
    }
}
