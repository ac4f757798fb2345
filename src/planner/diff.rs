//! Diff engine for comparing the desired graph with stored state.
//!
//! Every logical id present on either side yields exactly one
//! [`ChangeSetEntry`]. The engine only reads the state snapshot and the
//! providers' local schemas; it never calls a provider verb.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::Result;
use crate::graph::{Attributes, DependencyGraph, ResourceNode, Value};
use crate::provider::{ProviderRegistry, ResourceSchema};
use crate::state::{RecordStatus, StateDocument, StateRecord};

/// Engine for computing change-sets.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    /// Source of resource schemas.
    registry: &'a ProviderRegistry,
}

/// Operation required to converge one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be recreated; the new instance comes up first.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoOp,
}

/// Difference in a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute key.
    pub key: String,
    /// Previously applied value.
    pub old: Option<Value>,
    /// Desired value.
    pub new: Option<Value>,
    /// Whether the attribute cannot change in place.
    pub immutable: bool,
}

/// Change required for one logical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    /// Logical id.
    pub logical_id: String,
    /// Resource type (desired type, or stored type for deletes).
    pub resource_type: String,
    /// Operation kind.
    pub kind: ChangeKind,
    /// Physical id of the current instance, if any.
    pub physical_id: Option<String>,
    /// Previously applied attributes.
    pub old_attributes: Option<Attributes>,
    /// Desired attributes.
    pub new_attributes: Option<Attributes>,
    /// Dependencies in the desired graph.
    pub dependencies: BTreeSet<String>,
    /// Dependencies recorded in state.
    pub previous_dependencies: BTreeSet<String>,
    /// Attribute-level differences.
    pub changes: Vec<AttributeChange>,
    /// Superseded physical ids still to be deleted.
    pub deposed: Vec<String>,
    /// Human-readable reason.
    pub reason: String,
}

/// The complete change-set, ordered by logical id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Entries by logical id.
    pub entries: BTreeMap<String, ChangeSetEntry>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine reading schemas from `registry`.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Computes the change-set between `desired` and `state`.
    ///
    /// # Errors
    ///
    /// Returns a specification error if a desired resource type has no
    /// provider.
    pub fn compute(&self, desired: &DependencyGraph, state: &StateDocument) -> Result<ChangeSet> {
        let mut schemas: BTreeMap<&str, ResourceSchema> = BTreeMap::new();
        for node in desired.nodes() {
            if !schemas.contains_key(node.resource_type.as_str()) {
                let schema = self.registry.schema(&node.resource_type)?;
                schemas.insert(node.resource_type.as_str(), schema);
            }
        }

        let mut entries = BTreeMap::new();

        for node in desired.nodes() {
            let schema = schemas
                .get(node.resource_type.as_str())
                .cloned()
                .unwrap_or_default();
            let entry = Self::diff_node(node, state.get(&node.logical_id), &schema);
            debug!("{}: {} ({})", entry.logical_id, entry.kind, entry.reason);
            entries.insert(entry.logical_id.clone(), entry);
        }

        for record in state.records.values() {
            if desired.contains(&record.logical_id) {
                continue;
            }
            if let Some(entry) = Self::diff_removed(record) {
                debug!("{}: {} ({})", entry.logical_id, entry.kind, entry.reason);
                entries.insert(entry.logical_id.clone(), entry);
            }
        }

        Self::propagate_replacements(desired, &schemas, &mut entries);

        Ok(ChangeSet { entries })
    }

    /// Diffs a desired node against its stored record.
    fn diff_node(
        node: &ResourceNode,
        record: Option<&StateRecord>,
        schema: &ResourceSchema,
    ) -> ChangeSetEntry {
        let mut entry = ChangeSetEntry {
            logical_id: node.logical_id.clone(),
            resource_type: node.resource_type.clone(),
            kind: ChangeKind::Create,
            physical_id: None,
            old_attributes: None,
            new_attributes: Some(node.attributes.clone()),
            dependencies: node.dependencies().into_iter().map(String::from).collect(),
            previous_dependencies: BTreeSet::new(),
            changes: Vec::new(),
            deposed: Vec::new(),
            reason: String::from("Resource not in state"),
        };

        let Some(record) = record else {
            return entry;
        };

        entry.deposed.clone_from(&record.deposed);
        entry.previous_dependencies.clone_from(&record.dependencies);

        if record.status == RecordStatus::Deleted {
            entry.reason = String::from("Resource was destroyed");
            return entry;
        }

        let Some(physical_id) = record.physical_id.clone().filter(|_| record.status != RecordStatus::Pending)
        else {
            // An interrupted create may have left an instance behind
            if let Some(orphan) = &record.physical_id
                && !entry.deposed.contains(orphan)
            {
                entry.deposed.push(orphan.clone());
            }
            entry.reason = format!("Previous create did not complete ({})", record.status);
            return entry;
        };

        entry.physical_id = Some(physical_id);
        entry.old_attributes = Some(record.attributes.clone());
        entry.changes = diff_attributes(&record.attributes, &node.attributes, schema);

        if record.resource_type != node.resource_type {
            entry.kind = ChangeKind::Replace;
            entry.reason = format!(
                "Resource type changed from {} to {}",
                record.resource_type, node.resource_type
            );
        } else if entry.changes.iter().any(|c| c.immutable) {
            entry.kind = ChangeKind::Replace;
            entry.reason = format!(
                "Immutable attribute changed: {}",
                join_keys(entry.changes.iter().filter(|c| c.immutable))
            );
        } else if !entry.changes.is_empty() {
            entry.kind = ChangeKind::Update;
            entry.reason = format!("Attributes changed: {}", join_keys(entry.changes.iter()));
        } else if record.status == RecordStatus::Failed {
            entry.kind = ChangeKind::Update;
            entry.reason = String::from("Previous apply failed");
        } else {
            entry.kind = ChangeKind::NoOp;
            entry.reason = String::from("Up to date");
        }

        entry
    }

    /// Diffs a stored record that is no longer desired.
    fn diff_removed(record: &StateRecord) -> Option<ChangeSetEntry> {
        if record.status == RecordStatus::Deleted && record.deposed.is_empty() {
            return None;
        }

        let reason = if record.status == RecordStatus::Deleted {
            String::from("Superseded instances awaiting cleanup")
        } else {
            String::from("Resource removed from specification")
        };

        Some(ChangeSetEntry {
            logical_id: record.logical_id.clone(),
            resource_type: record.resource_type.clone(),
            kind: ChangeKind::Delete,
            physical_id: record
                .physical_id
                .clone()
                .filter(|_| record.status != RecordStatus::Deleted),
            old_attributes: Some(record.attributes.clone()),
            new_attributes: None,
            dependencies: BTreeSet::new(),
            previous_dependencies: record.dependencies.clone(),
            changes: Vec::new(),
            deposed: record.deposed.clone(),
            reason,
        })
    }

    /// Carries a replacement over to the resources depending on it.
    ///
    /// A dependent linked only through mutable `$ref` attributes is updated
    /// to point at the replacement. One linked by `depends_on`, by nesting or
    /// by an immutable attribute is replaced as well, so the old instance is
    /// never deleted from under it. Runs to a fixpoint, since a dependent
    /// forced into a replacement can in turn force its own dependents.
    fn propagate_replacements(
        desired: &DependencyGraph,
        schemas: &BTreeMap<&str, ResourceSchema>,
        entries: &mut BTreeMap<String, ChangeSetEntry>,
    ) {
        let mut replaced: BTreeSet<String> = entries
            .values()
            .filter(|e| e.kind == ChangeKind::Replace)
            .map(|e| e.logical_id.clone())
            .collect();
        let mut frontier: Vec<String> = replaced.iter().cloned().collect();

        while let Some(target) = frontier.pop() {
            for node in desired.nodes() {
                if node.logical_id == target || !node.depends_on_id(&target) {
                    continue;
                }
                let Some(entry) = entries.get_mut(&node.logical_id) else {
                    continue;
                };

                let keys = node.attributes_referencing(&target);
                let schema = schemas.get(node.resource_type.as_str());
                let repointable = !keys.is_empty()
                    && !node.explicit_dependencies.contains(&target)
                    && node.parent.as_deref() != Some(target.as_str())
                    && !keys
                        .iter()
                        .any(|k| schema.is_some_and(|s| s.is_immutable(k)));

                match entry.kind {
                    ChangeKind::NoOp | ChangeKind::Update if !repointable => {
                        entry.kind = ChangeKind::Replace;
                        entry.reason = format!("Depends on replaced resource '{target}'");
                        if replaced.insert(entry.logical_id.clone()) {
                            frontier.push(entry.logical_id.clone());
                        }
                    }
                    ChangeKind::NoOp => {
                        entry.kind = ChangeKind::Update;
                        entry.reason = format!("Re-pointed to replacement of '{target}'");
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Structural comparison of two attribute maps.
fn diff_attributes(old: &Attributes, new: &Attributes, schema: &ResourceSchema) -> Vec<AttributeChange> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let before = old.get(key);
            let after = new.get(key);
            (before != after).then(|| AttributeChange {
                key: key.clone(),
                old: before.cloned(),
                new: after.cloned(),
                immutable: schema.is_immutable(key),
            })
        })
        .collect()
}

fn join_keys<'c>(changes: impl Iterator<Item = &'c AttributeChange>) -> String {
    changes.map(|c| c.key.as_str()).collect::<Vec<_>>().join(", ")
}

impl ChangeSet {
    /// Gets the entry of a logical id.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&ChangeSetEntry> {
        self.entries.get(logical_id)
    }

    /// Iterates entries in logical id order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeSetEntry> {
        self.entries.values()
    }

    /// Number of entries of a kind.
    #[must_use]
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.entries.values().filter(|e| e.kind == kind).count()
    }

    /// Returns true if any entry requires action.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.kind != ChangeKind::NoOp || !e.deposed.is_empty())
    }

    /// Entries that require action.
    #[must_use]
    pub fn actionable(&self) -> Vec<&ChangeSetEntry> {
        self.entries
            .values()
            .filter(|e| e.kind != ChangeKind::NoOp || !e.deposed.is_empty())
            .collect()
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ChangeSetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.logical_id, self.kind)?;
        if !self.changes.is_empty() {
            write!(f, " ({})", join_keys(self.changes.iter()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDeclaration;
    use crate::graph::{GraphBuilder, Reference};
    use crate::provider::MemoryProvider;
    use std::sync::Arc;

    fn registry() -> ProviderRegistry {
        let provider = MemoryProvider::new()
            .with_schema("test.network", ResourceSchema::with_immutable(["cidr"]))
            .with_schema("test.server", ResourceSchema::with_immutable(["subnet"]));
        ProviderRegistry::new().with_default(Arc::new(provider))
    }

    fn graph(yaml: &str) -> DependencyGraph {
        let declarations: BTreeMap<String, ResourceDeclaration> =
            serde_yaml::from_str(yaml).expect("declarations");
        GraphBuilder::new().build(&declarations).expect("graph")
    }

    fn applied(node: &ResourceNode, physical_id: &str) -> StateRecord {
        let mut record = StateRecord::pending(&node.logical_id, &node.resource_type);
        record.physical_id = Some(physical_id.to_string());
        record.attributes = node.attributes.clone();
        record.dependencies = node.dependencies().into_iter().map(String::from).collect();
        record.status = RecordStatus::Applied;
        record
    }

    fn state_of(graph: &DependencyGraph) -> StateDocument {
        let mut state = StateDocument::new("app", "dev");
        for (i, node) in graph.nodes().enumerate() {
            state.set_record(applied(node, &format!("p-{i}")));
        }
        state
    }

    const NET_SERVER: &str = r"
Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }
Server: { type: test.server, depends_on: [Net], properties: { size: small } }
";

    #[test]
    fn test_empty_state_creates_everything() {
        let registry = registry();
        let changes = DiffEngine::new(&registry)
            .compute(&graph(NET_SERVER), &StateDocument::new("app", "dev"))
            .expect("diff");

        assert_eq!(changes.count(ChangeKind::Create), 2);
        assert!(changes.has_changes());
    }

    #[test]
    fn test_identical_state_is_noop() {
        let registry = registry();
        let desired = graph(NET_SERVER);
        let changes = DiffEngine::new(&registry)
            .compute(&desired, &state_of(&desired))
            .expect("diff");

        assert_eq!(changes.count(ChangeKind::NoOp), 2);
        assert!(!changes.has_changes());
    }

    #[test]
    fn test_update_and_replace_classification() {
        let registry = registry();
        let current = graph(NET_SERVER);
        let state = state_of(&current);

        let resized = graph(
            r"
Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }
Server: { type: test.server, depends_on: [Net], properties: { size: large } }
",
        );
        let changes = DiffEngine::new(&registry).compute(&resized, &state).expect("diff");
        let server = changes.get("Server").expect("server");
        assert_eq!(server.kind, ChangeKind::Update);
        assert_eq!(server.changes.len(), 1);
        assert!(!server.changes[0].immutable);
        assert_eq!(changes.get("Net").expect("net").kind, ChangeKind::NoOp);

        let renumbered = graph(
            r"
Net: { type: test.network, properties: { cidr: 10.1.0.0/16 } }
Server: { type: test.server, depends_on: [Net], properties: { size: small } }
",
        );
        let changes = DiffEngine::new(&registry).compute(&renumbered, &state).expect("diff");
        assert_eq!(changes.get("Net").expect("net").kind, ChangeKind::Replace);
        // depends_on cannot be re-pointed, so the server moves with the network
        let server = changes.get("Server").expect("server");
        assert_eq!(server.kind, ChangeKind::Replace);
        assert!(server.changes.is_empty());
        assert_eq!(server.reason, "Depends on replaced resource 'Net'");
    }

    #[test]
    fn test_replacement_cascades_to_nested_resources() {
        let registry = registry();
        let current = graph(
            r"
Net:
  type: test.network
  properties: { cidr: 10.0.0.0/16 }
  children:
    Route: { type: test.route, properties: { via: gw } }
",
        );
        let state = state_of(&current);

        let renumbered = graph(
            r"
Net:
  type: test.network
  properties: { cidr: 10.1.0.0/16 }
  children:
    Route: { type: test.route, properties: { via: gw } }
",
        );
        let changes = DiffEngine::new(&registry).compute(&renumbered, &state).expect("diff");
        assert_eq!(changes.get("Net/Route").expect("route").kind, ChangeKind::Replace);
    }

    #[test]
    fn test_type_change_forces_replace() {
        let registry = registry();
        let current = graph(NET_SERVER);
        let state = state_of(&current);

        let retyped = graph(
            r"
Net: { type: test.vnet, properties: { cidr: 10.0.0.0/16 } }
Server: { type: test.server, depends_on: [Net], properties: { size: small } }
",
        );
        let changes = DiffEngine::new(&registry).compute(&retyped, &state).expect("diff");
        assert_eq!(changes.get("Net").expect("net").kind, ChangeKind::Replace);
    }

    #[test]
    fn test_replacement_repoints_referencing_resources() {
        let registry = registry();
        let current = graph(
            r#"
Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }
Server: { type: test.server, properties: { subnet: { "$ref": Net } } }
Monitor: { type: test.monitor, properties: { target: { "$ref": Server.address } } }
Tag: { type: test.tag, properties: { net: { "$ref": Net } } }
"#,
        );
        let state = state_of(&current);

        let renumbered = graph(
            r#"
Net: { type: test.network, properties: { cidr: 10.1.0.0/16 } }
Server: { type: test.server, properties: { subnet: { "$ref": Net } } }
Monitor: { type: test.monitor, properties: { target: { "$ref": Server.address } } }
Tag: { type: test.tag, properties: { net: { "$ref": Net } } }
"#,
        );
        let changes = DiffEngine::new(&registry).compute(&renumbered, &state).expect("diff");

        assert_eq!(changes.get("Net").expect("net").kind, ChangeKind::Replace);
        // subnet is immutable for servers
        assert_eq!(changes.get("Server").expect("server").kind, ChangeKind::Replace);
        // cascades through the replaced server
        assert_eq!(changes.get("Monitor").expect("monitor").kind, ChangeKind::Update);
        assert_eq!(changes.get("Tag").expect("tag").kind, ChangeKind::Update);
    }

    #[test]
    fn test_removed_and_tombstoned_records() {
        let registry = registry();
        let current = graph(NET_SERVER);
        let mut state = state_of(&current);

        let mut gone = StateRecord::pending("Old", "test.server");
        gone.physical_id = Some(String::from("old-1"));
        gone.status = RecordStatus::Deleted;
        state.set_record(gone.clone());

        gone.logical_id = String::from("Stale");
        gone.deposed.push(String::from("stale-0"));
        state.set_record(gone);

        let desired = graph(
            r"
Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }
",
        );
        let changes = DiffEngine::new(&registry).compute(&desired, &state).expect("diff");

        let server = changes.get("Server").expect("server");
        assert_eq!(server.kind, ChangeKind::Delete);
        assert_eq!(server.previous_dependencies, BTreeSet::from([String::from("Net")]));
        assert!(changes.get("Old").is_none());

        let stale = changes.get("Stale").expect("stale");
        assert_eq!(stale.kind, ChangeKind::Delete);
        assert_eq!(stale.physical_id, None);
        assert_eq!(stale.deposed, vec![String::from("stale-0")]);
    }

    #[test]
    fn test_incomplete_records_are_recreated() {
        let registry = registry();
        let desired = graph(NET_SERVER);
        let mut state = state_of(&desired);

        state.record_status("Net", RecordStatus::Pending);
        state.record_status("Server", RecordStatus::Failed);

        let changes = DiffEngine::new(&registry).compute(&desired, &state).expect("diff");
        let net = changes.get("Net").expect("net");
        assert_eq!(net.kind, ChangeKind::Create);
        assert_eq!(net.deposed.len(), 1);
        assert_eq!(changes.get("Server").expect("server").kind, ChangeKind::Update);
    }

    #[test]
    fn test_unknown_type_fails() {
        let registry = ProviderRegistry::new();
        let desired = graph(NET_SERVER);
        assert!(DiffEngine::new(&registry)
            .compute(&desired, &StateDocument::new("app", "dev"))
            .is_err());
    }

    #[test]
    fn test_structural_equality_ignores_key_order() {
        let registry = registry();
        let a = graph(
            r"
Net: { type: test.network, properties: { tags: { b: 2, a: 1 }, cidr: x } }
",
        );
        let b = graph(
            r"
Net: { type: test.network, properties: { cidr: x, tags: { a: 1, b: 2 } } }
",
        );
        let changes = DiffEngine::new(&registry).compute(&b, &state_of(&a)).expect("diff");
        assert_eq!(changes.get("Net").expect("net").kind, ChangeKind::NoOp);

        let reference = Value::from(Reference::new("Net"));
        assert_eq!(reference, Value::from(Reference::new("Net")));
    }
}
