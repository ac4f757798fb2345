//! Execution plan types and scheduling.
//!
//! The scheduler expands a change-set into steps, wires them with
//! "must happen before" edges and batches them with Kahn's algorithm. Every
//! step in a batch is independent of the others in that batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

use crate::error::PlanError;
use crate::graph::Attributes;

use super::diff::{AttributeChange, ChangeKind, ChangeSet, ChangeSetEntry};

/// A complete execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unique plan identifier.
    pub id: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Project the plan belongs to.
    pub project: String,
    /// Target environment.
    pub environment: String,
    /// Hash of the desired specification.
    pub spec_hash: String,
    /// State serial the plan was computed against.
    pub state_serial: u64,
    /// Strictly ordered batches of independent steps.
    pub batches: Vec<Vec<PlanStep>>,
}

/// A single scheduled operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Logical id of the resource.
    pub logical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Operation to perform.
    pub action: StepAction,
    /// Physical id operated on by updates and deletes.
    pub physical_id: Option<String>,
    /// Superseded physical ids removed by this step.
    #[serde(default)]
    pub superseded: Vec<String>,
    /// Desired attributes, references unresolved.
    pub attributes: Option<Attributes>,
    /// Dependencies to record once the step is applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Attribute-level differences, for display.
    #[serde(default)]
    pub changes: Vec<AttributeChange>,
    /// Reason for this step.
    pub reason: String,
}

/// Types of steps in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Create a resource.
    Create,
    /// Create the replacement instance of a resource.
    CreateReplacement,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// Delete superseded instances of a resource.
    DeleteReplaced,
    /// Nothing to do.
    NoOp,
}

/// Counts of planned operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to delete.
    pub delete: usize,
    /// Unchanged resources.
    pub unchanged: usize,
}

/// Plan identity, copied into the resulting plan.
#[derive(Debug, Clone)]
pub struct PlanContext {
    /// Project name.
    pub project: String,
    /// Target environment.
    pub environment: String,
    /// Hash of the desired specification.
    pub spec_hash: String,
    /// Current state serial.
    pub state_serial: u64,
}

/// Orders change-sets into execution plans.
#[derive(Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Schedules `changes` into batches.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DependencyResolutionFailed`] if the combined
    /// create and delete edges cannot be ordered.
    pub fn schedule(
        &self,
        changes: &ChangeSet,
        context: PlanContext,
    ) -> std::result::Result<ExecutionPlan, PlanError> {
        let steps = expand(changes);
        let edges = Self::edges(changes, &steps);
        let batches = Self::batch(steps, &edges)?;

        debug!(
            "Scheduled {} steps into {} batches",
            batches.iter().map(Vec::len).sum::<usize>(),
            batches.len()
        );

        Ok(ExecutionPlan {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            project: context.project,
            environment: context.environment,
            spec_hash: context.spec_hash,
            state_serial: context.state_serial,
            batches,
        })
    }

    /// Computes `before -> after` edges between step indices.
    fn edges(changes: &ChangeSet, steps: &[PlanStep]) -> BTreeSet<(usize, usize)> {
        let mut bring_up: BTreeMap<&str, usize> = BTreeMap::new();
        let mut by_resource: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, step) in steps.iter().enumerate() {
            if step.action.brings_up() {
                bring_up.insert(step.logical_id.as_str(), index);
            }
            if step.action != StepAction::NoOp {
                by_resource.entry(step.logical_id.as_str()).or_default().push(index);
            }
        }

        // Every resource whose current or previous instance depends on `id`
        let dependents_of = |id: &str| -> Vec<usize> {
            changes
                .iter()
                .filter(|e| e.logical_id != id)
                .filter(|e| e.dependencies.contains(id) || e.previous_dependencies.contains(id))
                .flat_map(|e| by_resource.get(e.logical_id.as_str()).cloned().unwrap_or_default())
                .collect()
        };

        let mut edges = BTreeSet::new();
        for (index, step) in steps.iter().enumerate() {
            match step.action {
                StepAction::Create | StepAction::CreateReplacement | StepAction::Update => {
                    for dep in &step.dependencies {
                        if let Some(&before) = bring_up.get(dep.as_str()) {
                            edges.insert((before, index));
                        }
                    }
                }
                StepAction::Delete => {
                    let id = step.logical_id.as_str();
                    for before in changes
                        .iter()
                        .filter(|e| e.logical_id != id && e.previous_dependencies.contains(id))
                        .flat_map(|e| by_resource.get(e.logical_id.as_str()).cloned().unwrap_or_default())
                    {
                        edges.insert((before, index));
                    }
                }
                StepAction::DeleteReplaced => {
                    let id = step.logical_id.as_str();
                    if let Some(&before) = bring_up.get(id) {
                        edges.insert((before, index));
                    }
                    for before in dependents_of(id) {
                        edges.insert((before, index));
                    }
                }
                StepAction::NoOp => {}
            }
        }

        edges.retain(|(before, after)| before != after);
        edges
    }

    /// Kahn's algorithm, batching every ready step per round.
    fn batch(
        steps: Vec<PlanStep>,
        edges: &BTreeSet<(usize, usize)>,
    ) -> std::result::Result<Vec<Vec<PlanStep>>, PlanError> {
        let mut in_degree = vec![0usize; steps.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for &(before, after) in edges {
            in_degree[after] += 1;
            successors[before].push(after);
        }

        let mut ready: Vec<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order: Vec<Vec<usize>> = Vec::new();
        let mut scheduled = 0;

        while !ready.is_empty() {
            ready.sort_by(|&a, &b| steps[a].sort_key().cmp(&steps[b].sort_key()));
            let mut next = Vec::new();
            for &index in &ready {
                for &after in &successors[index] {
                    in_degree[after] -= 1;
                    if in_degree[after] == 0 {
                        next.push(after);
                    }
                }
            }
            scheduled += ready.len();
            order.push(std::mem::replace(&mut ready, next));
        }

        if scheduled != steps.len() {
            let stuck: Vec<String> = (0..steps.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| steps[i].label())
                .collect();
            return Err(PlanError::DependencyResolutionFailed {
                message: format!("Steps cannot be ordered: {}", stuck.join(", ")),
            });
        }

        let mut slots: Vec<Option<PlanStep>> = steps.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .map(|batch| batch.into_iter().filter_map(|i| slots[i].take()).collect())
            .collect())
    }
}

/// Expands change-set entries into steps.
fn expand(changes: &ChangeSet) -> Vec<PlanStep> {
    let mut steps = Vec::new();

    for entry in changes.iter() {
        match entry.kind {
            ChangeKind::Create => {
                steps.push(step(entry, StepAction::Create, None, Vec::new()));
            }
            ChangeKind::Update => {
                steps.push(step(entry, StepAction::Update, entry.physical_id.clone(), Vec::new()));
            }
            ChangeKind::NoOp => {
                steps.push(step(entry, StepAction::NoOp, entry.physical_id.clone(), Vec::new()));
            }
            ChangeKind::Replace => {
                steps.push(step(
                    entry,
                    StepAction::CreateReplacement,
                    entry.physical_id.clone(),
                    Vec::new(),
                ));
                let mut superseded: Vec<String> = entry.physical_id.iter().cloned().collect();
                superseded.extend(entry.deposed.iter().cloned());
                steps.push(step(entry, StepAction::DeleteReplaced, None, superseded));
                continue;
            }
            ChangeKind::Delete => {
                steps.push(step(
                    entry,
                    StepAction::Delete,
                    entry.physical_id.clone(),
                    entry.deposed.clone(),
                ));
                continue;
            }
        }

        if !entry.deposed.is_empty() {
            steps.push(step(entry, StepAction::DeleteReplaced, None, entry.deposed.clone()));
        }
    }

    steps
}

fn step(
    entry: &ChangeSetEntry,
    action: StepAction,
    physical_id: Option<String>,
    superseded: Vec<String>,
) -> PlanStep {
    let reason = if action == StepAction::DeleteReplaced && entry.kind != ChangeKind::Replace {
        String::from("Clean up superseded instances")
    } else {
        entry.reason.clone()
    };

    PlanStep {
        logical_id: entry.logical_id.clone(),
        resource_type: entry.resource_type.clone(),
        action,
        physical_id,
        superseded,
        attributes: entry.new_attributes.clone(),
        dependencies: entry.dependencies.clone(),
        changes: entry.changes.clone(),
        reason,
    }
}

impl StepAction {
    /// Returns true if the step leaves a live instance of its resource.
    #[must_use]
    pub const fn brings_up(self) -> bool {
        matches!(self, Self::Create | Self::CreateReplacement | Self::Update)
    }

    /// Returns true if the step calls a provider.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl PlanStep {
    /// Short label such as `Create(Net')` or `Delete(Net)`.
    #[must_use]
    pub fn label(&self) -> String {
        match self.action {
            StepAction::Create => format!("Create({})", self.logical_id),
            StepAction::CreateReplacement => format!("Create({}')", self.logical_id),
            StepAction::Update => format!("Update({})", self.logical_id),
            StepAction::Delete | StepAction::DeleteReplaced => {
                format!("Delete({})", self.logical_id)
            }
            StepAction::NoOp => format!("NoOp({})", self.logical_id),
        }
    }

    fn sort_key(&self) -> (&str, StepAction) {
        (self.logical_id.as_str(), self.action)
    }
}

impl ExecutionPlan {
    /// Returns true if applying the plan would not call any provider.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps().all(|s| !s.action.is_mutation())
    }

    /// Iterates every step in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.batches.iter().flatten()
    }

    /// Number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Number of steps that call a provider.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.steps().filter(|s| s.action.is_mutation()).count()
    }

    /// Step labels per batch, e.g. `[["Create(Net)"], ["Create(Server)"]]`.
    #[must_use]
    pub fn layout(&self) -> Vec<Vec<String>> {
        self.batches
            .iter()
            .map(|batch| batch.iter().map(PlanStep::label).collect())
            .collect()
    }

    /// Counts of planned operations per resource.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for step in self.steps() {
            match step.action {
                StepAction::Create => summary.create += 1,
                StepAction::CreateReplacement => summary.replace += 1,
                StepAction::Update => summary.update += 1,
                StepAction::Delete => summary.delete += 1,
                StepAction::NoOp => summary.unchanged += 1,
                StepAction::DeleteReplaced => {}
            }
        }
        summary
    }

    /// Parses a saved plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a plan.
    pub fn from_json(content: &str) -> crate::error::Result<Self> {
        serde_json::from_str(content).map_err(|e| {
            crate::error::GroundworkError::internal(format!("Failed to parse plan: {e}"))
        })
    }

    /// Serializes the plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan cannot be encoded.
    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::GroundworkError::internal(format!("Failed to serialize plan: {e}"))
        })
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::CreateReplacement => "create replacement",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DeleteReplaced => "delete replaced",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.unchanged
        )
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} batches):", self.batches.len())?;
        for (i, batch) in self.batches.iter().enumerate() {
            writeln!(f, "  Batch {}:", i + 1)?;
            for step in batch.iter().filter(|s| s.action.is_mutation()) {
                writeln!(f, "    {step}")?;
            }
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RecordStatus, StateDocument, StateRecord};
    use crate::config::ResourceDeclaration;
    use crate::graph::{DependencyGraph, GraphBuilder};
    use crate::planner::DiffEngine;
    use crate::provider::{MemoryProvider, ProviderRegistry, ResourceSchema};
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

    fn state_of(graph: &DependencyGraph) -> StateDocument {
        let mut state = StateDocument::new("app", "dev");
        for node in graph.nodes() {
            let mut record = StateRecord::pending(&node.logical_id, &node.resource_type);
            record.physical_id = Some(format!("{}-1", node.logical_id));
            record.attributes = node.attributes.clone();
            record.dependencies = node.dependencies().into_iter().map(String::from).collect();
            record.status = RecordStatus::Applied;
            state.set_record(record);
        }
        state
    }

    fn plan(desired: &DependencyGraph, state: &StateDocument) -> ExecutionPlan {
        let registry = registry();
        let changes = DiffEngine::new(&registry).compute(desired, state).expect("diff");
        Scheduler::new()
            .schedule(
                &changes,
                PlanContext {
                    project: String::from("app"),
                    environment: String::from("dev"),
                    spec_hash: String::from("hash"),
                    state_serial: state.serial,
                },
            )
            .expect("schedule")
    }

    const NET_SERVER: &str = r"
Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }
Server: { type: test.server, depends_on: [Net], properties: { size: small } }
";

    #[test]
    fn test_first_apply_orders_creates() {
        let desired = graph(NET_SERVER);
        let plan = plan(&desired, &StateDocument::new("app", "dev"));
        assert_eq!(plan.layout(), vec![vec!["Create(Net)"], vec!["Create(Server)"]]);
        assert_eq!(plan.summary().create, 2);
    }

    #[test]
    fn test_second_apply_is_all_noop() {
        let desired = graph(NET_SERVER);
        let plan = plan(&desired, &state_of(&desired));
        assert_eq!(plan.layout(), vec![vec!["NoOp(Net)", "NoOp(Server)"]]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_removal_deletes_in_reverse_order() {
        let current = graph(NET_SERVER);
        let plan = plan(&DependencyGraph::empty(), &state_of(&current));
        assert_eq!(plan.layout(), vec![vec!["Delete(Server)"], vec!["Delete(Net)"]]);
    }

    #[test]
    fn test_removing_only_the_dependent() {
        let current = graph(NET_SERVER);
        let desired = graph("Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }");
        let plan = plan(&desired, &state_of(&current));
        assert_eq!(plan.layout(), vec![vec!["NoOp(Net)", "Delete(Server)"]]);
    }

    #[test]
    fn test_immutable_change_creates_before_destroying() {
        let current = graph(NET_SERVER);
        let desired = graph(
            r"
Net: { type: test.network, properties: { cidr: 10.1.0.0/16 } }
Server: { type: test.server, depends_on: [Net], properties: { size: small } }
",
        );
        let plan = plan(&desired, &state_of(&current));
        assert_eq!(
            plan.layout(),
            vec![
                vec!["Create(Net')"],
                vec!["Create(Server')"],
                vec!["Delete(Server)"],
                vec!["Delete(Net)"]
            ]
        );

        let server_delete = plan.batches[2].first().expect("server delete");
        assert_eq!(server_delete.superseded, vec![String::from("Server-1")]);
        let net_delete = plan.batches[3].first().expect("net delete");
        assert_eq!(net_delete.action, StepAction::DeleteReplaced);
        assert_eq!(net_delete.superseded, vec![String::from("Net-1")]);
        assert_eq!(plan.summary().replace, 2);
    }

    #[test]
    fn test_replacement_waits_for_repointed_dependents() {
        let current = graph(
            r#"
Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }
Server: { type: test.server, properties: { network: { "$ref": Net } } }
"#,
        );
        let desired = graph(
            r#"
Net: { type: test.network, properties: { cidr: 10.1.0.0/16 } }
Server: { type: test.server, properties: { network: { "$ref": Net } } }
"#,
        );
        let plan = plan(&desired, &state_of(&current));
        assert_eq!(
            plan.layout(),
            vec![
                vec!["Create(Net')"],
                vec!["Update(Server)"],
                vec!["Delete(Net)"]
            ]
        );
    }

    #[test]
    fn test_cascading_replacement() {
        let current = graph(
            r#"
Net: { type: test.network, properties: { cidr: 10.0.0.0/16 } }
Server: { type: test.server, properties: { subnet: { "$ref": Net } } }
"#,
        );
        let desired = graph(
            r#"
Net: { type: test.network, properties: { cidr: 10.1.0.0/16 } }
Server: { type: test.server, properties: { subnet: { "$ref": Net } } }
"#,
        );
        let plan = plan(&desired, &state_of(&current));
        assert_eq!(
            plan.layout(),
            vec![
                vec!["Create(Net')"],
                vec!["Create(Server')"],
                vec!["Delete(Server)"],
                vec!["Delete(Net)"]
            ]
        );
    }

    #[test]
    fn test_independent_steps_share_a_batch() {
        let desired = graph(
            r"
b: { type: test.bucket }
a: { type: test.bucket }
c: { type: test.server, depends_on: [a, b] }
",
        );
        let plan = plan(&desired, &StateDocument::new("app", "dev"));
        assert_eq!(
            plan.layout(),
            vec![vec!["Create(a)", "Create(b)"], vec!["Create(c)"]]
        );
    }

    #[test]
    fn test_cycle_in_stored_dependencies_fails() {
        let mut state = StateDocument::new("app", "dev");
        for (id, dep) in [("a", "b"), ("b", "a")] {
            let mut record = StateRecord::pending(id, "test.bucket");
            record.physical_id = Some(format!("{id}-1"));
            record.dependencies.insert(dep.to_string());
            record.status = RecordStatus::Applied;
            state.set_record(record);
        }

        let registry = registry();
        let changes = DiffEngine::new(&registry)
            .compute(&DependencyGraph::empty(), &state)
            .expect("diff");
        let result = Scheduler::new().schedule(
            &changes,
            PlanContext {
                project: String::from("app"),
                environment: String::from("dev"),
                spec_hash: String::new(),
                state_serial: 0,
            },
        );
        assert!(matches!(result, Err(PlanError::DependencyResolutionFailed { .. })));
    }

    #[test]
    fn test_plan_json_roundtrip() {
        let desired = graph(NET_SERVER);
        let plan = plan(&desired, &StateDocument::new("app", "dev"));
        let restored = ExecutionPlan::from_json(&plan.to_json().expect("encode")).expect("decode");
        assert_eq!(restored, plan);
    }
}
