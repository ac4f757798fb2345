//! Reconciliation engine.
//!
//! The engine is bound to one project environment. It owns the state store,
//! the provider registry and the execution settings, and wires the graph
//! builder, diff engine, scheduler and executor together.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExecutionConfig, ResourceDeclaration, SpecDocument, SpecHasher};
use crate::error::{PlanError, ProviderError, Result};
use crate::graph::{resolve_attributes, DependencyGraph, GraphBuilder, Value};
use crate::planner::{
    ApplyResult, DiffEngine, ExecutionPlan, Executor, PlanContext, RetryPolicy, Scheduler,
};
use crate::provider::ProviderRegistry;
use crate::state::{generate_holder_id, ApplyOperation, StateDocument, StateLedger, StateStore};

/// Environment-scoped reconciliation engine.
pub struct Engine {
    project: String,
    environment: String,
    store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
    execution: ExecutionConfig,
    features: BTreeMap<String, bool>,
    cancel: CancellationToken,
}

/// How a recorded resource differs from what the provider reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    /// The provider no longer knows the resource.
    Missing,
    /// One or more attributes changed outside of groundwork.
    Modified,
    /// The record never reached the applied state.
    Unapplied,
    /// The provider could not be queried.
    Unreadable,
}

/// One attribute whose live value differs from the recorded one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDrift {
    /// Attribute name.
    pub key: String,
    /// Recorded value, references resolved.
    pub recorded: Value,
    /// Live value, if the provider still reports the attribute.
    pub live: Option<Value>,
}

/// A drifted resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    /// Logical id.
    pub logical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Recorded physical id.
    pub physical_id: Option<String>,
    /// Kind of drift.
    pub status: DriftStatus,
    /// Attribute differences for modified resources.
    pub attributes: Vec<AttributeDrift>,
    /// Provider error for unreadable resources.
    pub message: Option<String>,
}

/// Result of a drift check.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Environment that was checked.
    pub environment: String,
    /// Number of live records examined.
    pub checked: usize,
    /// Drifted resources, by logical id.
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    /// Returns true if anything drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }

    /// Drift entry of one resource.
    #[must_use]
    pub fn entry(&self, logical_id: &str) -> Option<&DriftEntry> {
        self.entries.iter().find(|e| e.logical_id == logical_id)
    }
}

impl Engine {
    /// Creates an engine for `project`/`environment`.
    #[must_use]
    pub fn new(
        project: &str,
        environment: &str,
        store: Arc<dyn StateStore>,
        registry: ProviderRegistry,
    ) -> Self {
        Self {
            project: project.to_string(),
            environment: environment.to_string(),
            store,
            registry,
            execution: ExecutionConfig::default(),
            features: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates an engine from the settings of a specification document.
    #[must_use]
    pub fn from_document(
        document: &SpecDocument,
        store: Arc<dyn StateStore>,
        registry: ProviderRegistry,
    ) -> Self {
        Self::new(
            &document.project.name,
            &document.project.environment,
            store,
            registry,
        )
        .with_execution(document.execution.clone())
        .with_features(document.features.clone())
    }

    /// Sets the executor settings.
    #[must_use]
    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Sets the feature toggles applied while building graphs.
    #[must_use]
    pub fn with_features(mut self, features: BTreeMap<String, bool>) -> Self {
        self.features = features;
        self
    }

    /// Uses `token` to cancel applies between batches.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels running applies.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Environment this engine is bound to.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Loads the state of the bound environment, or an empty document.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state is unreadable or corrupted.
    pub async fn load_state(&self) -> Result<StateDocument> {
        Ok(self
            .store
            .load(&self.environment)
            .await?
            .unwrap_or_else(|| StateDocument::new(&self.project, &self.environment)))
    }

    /// Computes the plan that converges `environment` to `resources`.
    ///
    /// No provider is called and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns a specification error for invalid, cyclic or unsupported
    /// declarations, a state error for corrupted state, or a plan error.
    pub async fn plan(
        &self,
        resources: &BTreeMap<String, ResourceDeclaration>,
        environment: &str,
    ) -> Result<ExecutionPlan> {
        self.check_environment(environment)?;
        let graph = GraphBuilder::new()
            .with_features(self.features.clone())
            .build(resources)?;
        self.plan_graph(&graph).await
    }

    /// Computes the plan for the resources of a specification document.
    ///
    /// # Errors
    ///
    /// See [`Engine::plan`].
    pub async fn plan_document(&self, document: &SpecDocument) -> Result<ExecutionPlan> {
        self.check_environment(&document.project.environment)?;
        let graph = GraphBuilder::build_document(document)?;
        self.plan_graph(&graph).await
    }

    async fn plan_graph(&self, graph: &DependencyGraph) -> Result<ExecutionPlan> {
        self.registry.ensure_supported(graph)?;
        let state = self.load_state().await?;
        debug!(
            "Planning {} resource(s) against state serial {}",
            graph.len(),
            state.serial
        );

        let changes = DiffEngine::new(&self.registry).compute(graph, &state)?;
        let plan = Scheduler::new().schedule(
            &changes,
            PlanContext {
                project: self.project.clone(),
                environment: self.environment.clone(),
                spec_hash: SpecHasher::new().hash_graph(graph),
                state_serial: state.serial,
            },
        )?;

        info!("Plan {}: {}", plan.id, plan.summary());
        Ok(plan)
    }

    /// Applies a plan computed by [`Engine::plan`].
    ///
    /// The state lock is held for the whole apply. Resource failures are
    /// reported in the [`ApplyResult`]; only errors that prevent the apply
    /// from starting are returned as `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan targets another environment, the state is
    /// locked, or the plan is stale.
    pub async fn apply(&self, plan: &ExecutionPlan) -> Result<ApplyResult> {
        self.run_locked(plan, ApplyOperation::Apply).await
    }

    /// Deletes every resource recorded for `environment`.
    ///
    /// # Errors
    ///
    /// See [`Engine::apply`].
    pub async fn destroy(&self, environment: &str) -> Result<ApplyResult> {
        self.check_environment(environment)?;
        let plan = self.plan_graph(&DependencyGraph::empty()).await?;
        self.run_locked(&plan, ApplyOperation::Destroy).await
    }

    /// Computes the plan that [`Engine::destroy`] would execute.
    ///
    /// # Errors
    ///
    /// See [`Engine::plan`].
    pub async fn plan_destroy(&self, environment: &str) -> Result<ExecutionPlan> {
        self.check_environment(environment)?;
        self.plan_graph(&DependencyGraph::empty()).await
    }

    async fn run_locked(
        &self,
        plan: &ExecutionPlan,
        operation: ApplyOperation,
    ) -> Result<ApplyResult> {
        self.check_environment(&plan.environment)?;

        let holder = generate_holder_id();
        let lock = self.store.acquire_lock(&self.environment, &holder).await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let result = self.run(plan, operation).await;

        if let Err(e) = self.store.release_lock(&self.environment, &lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    async fn run(&self, plan: &ExecutionPlan, operation: ApplyOperation) -> Result<ApplyResult> {
        let state = self.load_state().await?;
        if state.serial != plan.state_serial {
            return Err(PlanError::StalePlan {
                planned: plan.state_serial,
                current: state.serial,
            }
            .into());
        }

        let ledger = Arc::new(StateLedger::new(
            Arc::clone(&self.store),
            &self.environment,
            state,
        ));
        let executor = Executor::new(self.registry.clone(), ledger)
            .with_config(&self.execution)
            .with_cancellation(self.cancel.clone());
        Ok(executor.execute(plan, operation).await)
    }

    /// Compares every applied record with what its provider reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or a record's type has
    /// no provider.
    pub async fn check_drift(&self, environment: &str) -> Result<DriftReport> {
        self.check_environment(environment)?;
        let state = self.load_state().await?;
        let retry = RetryPolicy::from(&self.execution.retry);
        info!("Checking drift in {}/{}", self.project, self.environment);

        let mut report = DriftReport {
            environment: self.environment.clone(),
            checked: 0,
            entries: Vec::new(),
        };

        for record in state.live_records() {
            report.checked += 1;
            let mut entry = DriftEntry {
                logical_id: record.logical_id.clone(),
                resource_type: record.resource_type.clone(),
                physical_id: record.physical_id.clone(),
                status: DriftStatus::Unapplied,
                attributes: Vec::new(),
                message: None,
            };

            let Some(physical_id) = record.physical_id.as_deref().filter(|_| record.is_applied())
            else {
                report.entries.push(entry);
                continue;
            };

            let provider = self.registry.resolve(&record.resource_type)?;
            let provider = provider.as_ref();
            let resource_type = record.resource_type.as_str();
            let live = match retry
                .run(&format!("Read({})", record.logical_id), move || {
                    provider.read(resource_type, physical_id)
                })
                .await
            {
                Ok((live, _)) => live,
                Err(e) => {
                    entry.status = match e.error {
                        ProviderError::NotFound { .. } => DriftStatus::Missing,
                        _ => DriftStatus::Unreadable,
                    };
                    entry.message = Some(e.error.to_string());
                    report.entries.push(entry);
                    continue;
                }
            };

            let recorded = match resolve_attributes(&record.attributes, &|r| state.lookup(r)) {
                Ok(resolved) => resolved,
                Err(reference) => {
                    warn!("Cannot resolve {reference} for '{}'", record.logical_id);
                    record.attributes.clone()
                }
            };
            entry.attributes = recorded
                .into_iter()
                .filter_map(|(key, value)| {
                    let current = live.get(&key);
                    (current != Some(&value)).then(|| AttributeDrift {
                        live: current.cloned(),
                        key,
                        recorded: value,
                    })
                })
                .collect();

            if !entry.attributes.is_empty() {
                entry.status = DriftStatus::Modified;
                report.entries.push(entry);
            }
        }

        if report.has_drift() {
            warn!("{} of {} resource(s) drifted", report.entries.len(), report.checked);
        } else {
            info!("No drift detected");
        }
        Ok(report)
    }

    fn check_environment(&self, environment: &str) -> Result<()> {
        if environment == self.environment {
            Ok(())
        } else {
            Err(PlanError::EnvironmentMismatch {
                planned: environment.to_string(),
                current: self.environment.clone(),
            }
            .into())
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("project", &self.project)
            .field("environment", &self.environment)
            .field("backend", &self.store.backend_type())
            .field("registry", &self.registry)
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Missing => "missing",
            Self::Modified => "modified",
            Self::Unapplied => "unapplied",
            Self::Unreadable => "unreadable",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift() {
            return write!(f, "No drift detected - state is converged");
        }

        writeln!(f, "Drift detected in {}:", self.environment)?;
        for entry in &self.entries {
            writeln!(f, "  - {} ({})", entry.logical_id, entry.status)?;
            for attribute in &entry.attributes {
                let live = attribute
                    .live
                    .as_ref()
                    .map_or_else(|| String::from("<absent>"), ToString::to_string);
                writeln!(f, "      {}: {} -> {live}", attribute.key, attribute.recorded)?;
            }
        }
        Ok(())
    }
}
