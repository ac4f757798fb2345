//! The dependency graph: resource nodes plus "must exist before" edges.

use std::collections::{BTreeMap, BTreeSet};

use super::node::ResourceNode;

/// Directed acyclic graph of resources.
///
/// An edge `A -> B` means A must exist before B is created, and B must be
/// destroyed before A. Nodes are keyed by logical id in lexical order.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes by logical id.
    nodes: BTreeMap<String, ResourceNode>,
}

impl DependencyGraph {
    /// Creates an empty graph (the desired state of a destroyed environment).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Wraps already-validated nodes. Used by the builder.
    pub(crate) const fn from_nodes(nodes: BTreeMap<String, ResourceNode>) -> Self {
        Self { nodes }
    }

    /// Gets a node by logical id.
    #[must_use]
    pub fn node(&self, logical_id: &str) -> Option<&ResourceNode> {
        self.nodes.get(logical_id)
    }

    /// Returns true if the graph has a node with this id.
    #[must_use]
    pub fn contains(&self, logical_id: &str) -> bool {
        self.nodes.contains_key(logical_id)
    }

    /// Iterates nodes in logical id order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Logical ids in lexical order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.dependencies().len()).sum()
    }

    /// Nodes that depend directly on `logical_id`.
    #[must_use]
    pub fn dependents(&self, logical_id: &str) -> Vec<&ResourceNode> {
        self.nodes
            .values()
            .filter(|n| n.depends_on_id(logical_id))
            .collect()
    }

    /// Topological order with lexical tie-break.
    ///
    /// Returns `None` if the graph contains a cycle, which the builder never
    /// produces.
    #[must_use]
    pub fn topological_order(&self) -> Option<Vec<&str>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.logical_id.as_str(), n.dependencies().len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent.logical_id.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(dependent.logical_id.as_str());
                    }
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }

    /// Finds a dependency cycle, returned as a closed path of logical ids.
    ///
    /// Depth-first search with an explicit recursion stack.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        find_cycle_in(&self.nodes)
    }
}

/// Visit state for cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the current recursion stack.
    Active,
    /// Fully explored.
    Done,
}

/// Finds a cycle among `nodes`, ignoring edges to unknown ids.
pub(crate) fn find_cycle_in(nodes: &BTreeMap<String, ResourceNode>) -> Option<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack: Vec<&str> = Vec::new();

    for start in nodes.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }
        if let Some(cycle) = visit(start, nodes, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Recursive DFS step.
fn visit<'a>(
    id: &'a str,
    nodes: &'a BTreeMap<String, ResourceNode>,
    marks: &mut BTreeMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(id, Mark::Active);
    stack.push(id);

    if let Some(node) = nodes.get(id) {
        for dep in node.dependencies() {
            if !nodes.contains_key(dep) {
                continue;
            }
            match marks.get(dep) {
                Some(Mark::Active) => {
                    let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| (*s).to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(dep, nodes, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
    }

    stack.pop();
    marks.insert(id, Mark::Done);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(nodes: Vec<ResourceNode>) -> DependencyGraph {
        DependencyGraph::from_nodes(
            nodes
                .into_iter()
                .map(|n| (n.logical_id.clone(), n))
                .collect(),
        )
    }

    #[test]
    fn test_topological_order_lexical_tie_break() {
        let graph = graph_of(vec![
            ResourceNode::new("web", "compute.server").depends_on("net"),
            ResourceNode::new("net", "network.vpc"),
            ResourceNode::new("bucket", "storage.bucket"),
        ]);

        let order = graph.topological_order().expect("acyclic");
        assert_eq!(order, vec!["bucket", "net", "web"]);
    }

    #[test]
    fn test_find_cycle_reports_path() {
        let graph = graph_of(vec![
            ResourceNode::new("a", "t.x").depends_on("b"),
            ResourceNode::new("b", "t.x").depends_on("c"),
            ResourceNode::new("c", "t.x").depends_on("a"),
        ]);

        let cycle = graph.find_cycle().expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert!(graph.topological_order().is_none());
    }

    #[test]
    fn test_dependents() {
        let graph = graph_of(vec![
            ResourceNode::new("net", "network.vpc"),
            ResourceNode::new("sg", "network.security_group").depends_on("net"),
            ResourceNode::new("web", "compute.server").depends_on("net"),
        ]);

        let ids: Vec<&str> = graph
            .dependents("net")
            .iter()
            .map(|n| n.logical_id.as_str())
            .collect();
        assert_eq!(ids, vec!["sg", "web"]);
        assert_eq!(graph.edge_count(), 2);
    }
}
