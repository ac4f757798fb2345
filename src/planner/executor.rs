//! Plan executor.
//!
//! Batches run strictly in order. Steps inside a batch run concurrently up to
//! the configured limit. Every state change goes through the [`StateLedger`],
//! so a crash mid-apply leaves pending records behind instead of silently
//! losing track of a resource.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutionConfig, FailurePolicy};
use crate::error::{ExecutionFailure, GroundworkError, ProviderError};
use crate::graph::{Attributes, Value, ID_ATTRIBUTE};
use crate::provider::{Provider, ProviderRegistry};
use crate::state::{
    ApplyHistoryEntry, ApplyOperation, RecordStatus, StateDocument, StateLedger, StateRecord,
};

use super::plan::{ExecutionPlan, PlanStep, StepAction};
use super::retry::{RetryExhausted, RetryPolicy};

/// Progress of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Running.
    InProgress,
    /// Completed successfully.
    Applied,
    /// Failed after retries.
    Failed,
    /// Never started because of an earlier failure or cancellation.
    Skipped,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step label, e.g. `Create(Net')`.
    pub label: String,
    /// Logical id of the resource.
    pub logical_id: String,
    /// Step action.
    pub action: StepAction,
    /// Final status.
    pub status: StepStatus,
    /// Provider attempts made.
    pub attempts: u32,
    /// Physical id produced or operated on.
    pub physical_id: Option<String>,
    /// Error message for failed steps.
    pub error: Option<String>,
}

/// Outcome of a whole apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    /// Identifier of the executed plan.
    pub plan_id: String,
    /// One report per step, in plan order.
    pub steps: Vec<StepReport>,
    /// Every failed resource operation.
    pub failures: Vec<ExecutionFailure>,
    /// Labels of steps that were reverted by the rollback policy.
    pub rolled_back: Vec<String>,
    /// True if the apply stopped because of cancellation.
    pub cancelled: bool,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

impl ApplyResult {
    /// Returns true if every step was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Number of steps that ended with `status`.
    #[must_use]
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Report of the step with the given label.
    #[must_use]
    pub fn step(&self, label: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.label == label)
    }
}

impl StepReport {
    fn pending(step: &PlanStep) -> Self {
        Self {
            label: step.label(),
            logical_id: step.logical_id.clone(),
            action: step.action,
            status: StepStatus::Pending,
            attempts: 0,
            physical_id: step.physical_id.clone(),
            error: None,
        }
    }
}

struct StepOutcome {
    physical_id: Option<String>,
    attempts: u32,
}

/// Runs execution plans against providers.
pub struct Executor {
    registry: ProviderRegistry,
    ledger: Arc<StateLedger>,
    retry: RetryPolicy,
    concurrency: usize,
    on_failure: FailurePolicy,
    cancel: CancellationToken,
}

impl Executor {
    /// Creates an executor with default execution settings.
    #[must_use]
    pub fn new(registry: ProviderRegistry, ledger: Arc<StateLedger>) -> Self {
        Self {
            registry,
            ledger,
            retry: RetryPolicy::default(),
            concurrency: ExecutionConfig::default().concurrency,
            on_failure: FailurePolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Applies concurrency, failure and retry settings.
    #[must_use]
    pub fn with_config(mut self, config: &ExecutionConfig) -> Self {
        self.retry = RetryPolicy::from(&config.retry);
        self.concurrency = config.concurrency.max(1);
        self.on_failure = config.on_failure;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Uses `token` to stop scheduling new batches.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Executes `plan` and records the outcome in state.
    ///
    /// Failures never abort the call: they are collected in the returned
    /// [`ApplyResult`] together with the status of every step.
    pub async fn execute(&self, plan: &ExecutionPlan, operation: ApplyOperation) -> ApplyResult {
        let started = Instant::now();
        info!(
            "Executing plan {} ({} steps in {} batches)",
            plan.id,
            plan.step_count(),
            plan.batches.len()
        );

        let mut reports: Vec<StepReport> = plan.steps().map(StepReport::pending).collect();
        let mut failures = Vec::new();
        let mut rolled_back = Vec::new();
        let mut cancelled = false;
        let mut halted = false;
        let mut offset = 0;

        for (index, batch) in plan.batches.iter().enumerate() {
            let range = offset..offset + batch.len();
            offset += batch.len();

            if !halted && self.cancel.is_cancelled() {
                warn!("Apply cancelled before batch {}", index + 1);
                cancelled = true;
                halted = true;
            }
            if halted {
                for report in &mut reports[range] {
                    report.status = StepStatus::Skipped;
                }
                continue;
            }

            debug!("Batch {}/{}: {} step(s)", index + 1, plan.batches.len(), batch.len());
            let before = match self.on_failure {
                FailurePolicy::Rollback => Some(self.ledger.snapshot().await),
                FailurePolicy::Halt => None,
            };
            for report in &mut reports[range.clone()] {
                report.status = StepStatus::InProgress;
            }

            // A started batch always runs to completion; cancellation is
            // only observed between batches.
            let outcomes: Vec<(usize, Result<StepOutcome, ExecutionFailure>)> =
                stream::iter(batch.iter().enumerate())
                    .map(|(i, step)| async move { (i, self.run_step(step).await) })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;

            let mut batch_failed = false;
            for (i, outcome) in outcomes {
                let report = &mut reports[range.start + i];
                match outcome {
                    Ok(outcome) => {
                        report.status = StepStatus::Applied;
                        report.attempts = outcome.attempts;
                        if outcome.physical_id.is_some() {
                            report.physical_id = outcome.physical_id;
                        }
                    }
                    Err(failure) => {
                        report.status = StepStatus::Failed;
                        report.attempts = failure.attempts;
                        report.error = Some(failure.cause.clone());
                        failures.push(failure);
                        batch_failed = true;
                    }
                }
            }

            if batch_failed {
                halted = true;
                if let Some(before) = before {
                    rolled_back = self.rollback(batch, &reports[range], &before).await;
                }
            }
        }

        let result = ApplyResult {
            plan_id: plan.id.clone(),
            steps: reports,
            failures,
            rolled_back,
            cancelled,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        self.record_history(plan, operation, &result).await;

        if result.is_success() {
            info!("Plan {} applied in {}ms", plan.id, result.duration_ms);
        } else {
            error!(
                "Plan {} finished with {} failure(s){}",
                plan.id,
                result.failures.len(),
                if result.cancelled { " (cancelled)" } else { "" }
            );
        }
        result
    }

    async fn run_step(&self, step: &PlanStep) -> Result<StepOutcome, ExecutionFailure> {
        let provider = self
            .registry
            .resolve(&step.resource_type)
            .map_err(|e| failure(step, e.to_string(), 0))?;
        let provider = provider.as_ref();

        if step.action.is_mutation() {
            info!("{step}");
        }
        let result = match step.action {
            StepAction::Create | StepAction::CreateReplacement => self.create(step, provider).await,
            StepAction::Update => self.update(step, provider).await,
            StepAction::Delete => self.delete(step, provider).await,
            StepAction::DeleteReplaced => self.delete_replaced(step, provider).await,
            StepAction::NoOp => self.refresh_dependencies(step).await,
        };

        if let Err(failure) = &result {
            error!("{failure}");
        }
        result
    }

    async fn create(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
    ) -> Result<StepOutcome, ExecutionFailure> {
        let label = step.label();
        let desired = step.attributes.clone().unwrap_or_default();

        // The pending record exists before the provider is called.
        self.ledger
            .update(|doc| {
                let record = record_mut(doc, step);
                match record.physical_id.take() {
                    Some(old) if record.status != RecordStatus::Deleted => {
                        if !record.deposed.contains(&old) {
                            record.deposed.push(old);
                        }
                    }
                    _ => {}
                }
                record.resource_type.clone_from(&step.resource_type);
                record.attributes.clone_from(&desired);
                record.outputs = Attributes::new();
                record.dependencies.clone_from(&step.dependencies);
                record.set_status(RecordStatus::Pending);
            })
            .await
            .map_err(|e| state_failure(step, &e, 0))?;

        let resolved = match self.ledger.resolve(&desired).await {
            Ok(resolved) => resolved,
            Err(reference) => {
                self.mark_failed(&step.logical_id).await;
                return Err(failure(step, format!("{reference} has no value"), 0));
            }
        };

        let resource_type = step.resource_type.as_str();
        let attributes = &resolved;
        let (physical_id, attempts) = match self
            .retry
            .run(&label, move || provider.create(resource_type, attributes))
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.mark_failed(&step.logical_id).await;
                return Err(exhausted(step, e));
            }
        };

        self.ledger
            .update(|doc| {
                let record = record_mut(doc, step);
                record.physical_id = Some(physical_id.clone());
                record.set_status(RecordStatus::Applied);
            })
            .await
            .map_err(|e| {
                failure(
                    step,
                    format!("created {physical_id} but could not record it: {e}"),
                    attempts,
                )
            })?;

        let id = physical_id.as_str();
        let outputs = match self
            .retry
            .run(&label, move || provider.read(resource_type, id))
            .await
        {
            Ok((outputs, _)) => outputs,
            Err(e) => {
                warn!("Could not read outputs of {label}: {}", e.error);
                let mut outputs = resolved.clone();
                outputs.insert(ID_ATTRIBUTE.to_string(), Value::from(id));
                outputs
            }
        };
        self.ledger
            .update(|doc| record_mut(doc, step).outputs = outputs)
            .await
            .map_err(|e| state_failure(step, &e, attempts))?;

        Ok(StepOutcome {
            physical_id: Some(physical_id),
            attempts,
        })
    }

    async fn update(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
    ) -> Result<StepOutcome, ExecutionFailure> {
        let Some(physical_id) = step.physical_id.as_deref() else {
            return Err(failure(step, "no physical id recorded", 0));
        };
        let desired = step.attributes.clone().unwrap_or_default();
        let resolved = match self.ledger.resolve(&desired).await {
            Ok(resolved) => resolved,
            Err(reference) => {
                self.mark_failed(&step.logical_id).await;
                return Err(failure(step, format!("{reference} has no value"), 0));
            }
        };

        let resource_type = step.resource_type.as_str();
        let attributes = &resolved;
        let (outputs, attempts) = match self
            .retry
            .run(&step.label(), move || {
                provider.update(resource_type, physical_id, attributes)
            })
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                self.mark_failed(&step.logical_id).await;
                return Err(exhausted(step, e));
            }
        };

        self.ledger
            .update(|doc| {
                let record = record_mut(doc, step);
                record.resource_type.clone_from(&step.resource_type);
                record.attributes = desired;
                record.outputs = outputs;
                record.dependencies.clone_from(&step.dependencies);
                record.set_status(RecordStatus::Applied);
            })
            .await
            .map_err(|e| state_failure(step, &e, attempts))?;

        Ok(StepOutcome {
            physical_id: Some(physical_id.to_string()),
            attempts,
        })
    }

    async fn delete(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
    ) -> Result<StepOutcome, ExecutionFailure> {
        let targets: Vec<&str> = step
            .physical_id
            .iter()
            .chain(&step.superseded)
            .map(String::as_str)
            .collect();
        let (removed, result) = self.delete_instances(step, provider, &targets).await;

        match result {
            Ok(attempts) => {
                self.ledger
                    .update(|doc| {
                        let record = record_mut(doc, step);
                        record.physical_id = None;
                        record.deposed.clear();
                        record.set_status(RecordStatus::Deleted);
                    })
                    .await
                    .map_err(|e| state_failure(step, &e, attempts))?;
                Ok(StepOutcome {
                    physical_id: step.physical_id.clone(),
                    attempts,
                })
            }
            Err(failure) => {
                let write = self
                    .ledger
                    .update(|doc| {
                        if let Some(record) = doc.get_mut(&step.logical_id) {
                            if record
                                .physical_id
                                .as_ref()
                                .is_some_and(|id| removed.contains(id))
                            {
                                record.physical_id = None;
                            }
                            record.deposed.retain(|id| !removed.contains(id));
                            record.set_status(RecordStatus::Failed);
                        }
                    })
                    .await;
                if let Err(e) = write {
                    error!("Failed to record partial delete of '{}': {e}", step.logical_id);
                }
                Err(failure)
            }
        }
    }

    async fn delete_replaced(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
    ) -> Result<StepOutcome, ExecutionFailure> {
        let targets: Vec<&str> = step.superseded.iter().map(String::as_str).collect();
        let (removed, result) = self.delete_instances(step, provider, &targets).await;

        let write = self
            .ledger
            .update(|doc| {
                if let Some(record) = doc.get_mut(&step.logical_id) {
                    record.deposed.retain(|id| !removed.contains(id));
                }
            })
            .await;
        let attempts = result?;
        write.map_err(|e| state_failure(step, &e, attempts))?;

        Ok(StepOutcome {
            physical_id: None,
            attempts,
        })
    }

    /// Deletes each instance in turn. A missing instance counts as deleted.
    async fn delete_instances(
        &self,
        step: &PlanStep,
        provider: &dyn Provider,
        targets: &[&str],
    ) -> (BTreeSet<String>, Result<u32, ExecutionFailure>) {
        let resource_type = step.resource_type.as_str();
        let mut removed = BTreeSet::new();
        let mut attempts = 0;

        for &physical_id in targets {
            let what = format!("{} [{physical_id}]", step.label());
            match self
                .retry
                .run(&what, move || provider.delete(resource_type, physical_id))
                .await
            {
                Ok(((), n)) => attempts += n,
                Err(RetryExhausted {
                    error: ProviderError::NotFound { .. },
                    attempts: n,
                }) => {
                    debug!("{physical_id} is already gone");
                    attempts += n;
                }
                Err(e) => {
                    let total = attempts + e.attempts;
                    return (removed, Err(failure(step, e.error.to_string(), total)));
                }
            }
            removed.insert(physical_id.to_string());
        }

        (removed, Ok(attempts))
    }

    async fn refresh_dependencies(&self, step: &PlanStep) -> Result<StepOutcome, ExecutionFailure> {
        let Some(record) = self.ledger.record(&step.logical_id).await else {
            return Ok(StepOutcome {
                physical_id: None,
                attempts: 0,
            });
        };

        if record.dependencies != step.dependencies {
            self.ledger
                .update(|doc| record_mut(doc, step).dependencies.clone_from(&step.dependencies))
                .await
                .map_err(|e| state_failure(step, &e, 0))?;
        }
        Ok(StepOutcome {
            physical_id: record.physical_id,
            attempts: 0,
        })
    }

    async fn mark_failed(&self, logical_id: &str) {
        if let Err(e) = self
            .ledger
            .update(|doc| doc.record_status(logical_id, RecordStatus::Failed))
            .await
        {
            error!("Failed to mark '{logical_id}' as failed: {e}");
        }
    }

    /// Reverts the steps of a failed batch, newest first.
    async fn rollback(
        &self,
        batch: &[PlanStep],
        reports: &[StepReport],
        before: &StateDocument,
    ) -> Vec<String> {
        warn!("Rolling back {} step(s) of the failed batch", batch.len());
        let mut reverted = Vec::new();

        for (step, report) in batch.iter().zip(reports).rev() {
            if !step.action.is_mutation() {
                continue;
            }
            let previous = before.get(&step.logical_id);
            let label = step.label();

            let outcome = match report.status {
                StepStatus::Applied => self.revert(step, previous).await,
                StepStatus::Failed => self.restore_failed(step, previous).await,
                _ => continue,
            };

            match outcome {
                Ok(true) => {
                    info!("Rolled back {label}");
                    reverted.push(label);
                }
                Ok(false) => {
                    if report.status == StepStatus::Applied {
                        warn!("{label} cannot be rolled back");
                    }
                }
                Err(e) => error!("Rollback of {label} failed: {e}"),
            }
        }

        reverted
    }

    async fn revert(
        &self,
        step: &PlanStep,
        previous: Option<&StateRecord>,
    ) -> Result<bool, ExecutionFailure> {
        let provider = self
            .registry
            .resolve(&step.resource_type)
            .map_err(|e| failure(step, e.to_string(), 0))?;
        let provider = provider.as_ref();
        let resource_type = step.resource_type.as_str();

        match step.action {
            StepAction::Create | StepAction::CreateReplacement => {
                let created = self
                    .ledger
                    .record(&step.logical_id)
                    .await
                    .and_then(|r| r.physical_id);
                if let Some(created) = created {
                    self.delete_instances(step, provider, &[created.as_str()])
                        .await
                        .1?;
                }
                self.restore(step, previous).await?;
                Ok(true)
            }
            StepAction::Update => {
                let Some(previous) = previous else {
                    return Ok(false);
                };
                let Some(physical_id) = previous.physical_id.as_deref() else {
                    return Ok(false);
                };
                let attributes = self
                    .ledger
                    .resolve(&previous.attributes)
                    .await
                    .map_err(|reference| failure(step, format!("{reference} has no value"), 0))?;
                let attributes = &attributes;
                self.retry
                    .run(&step.label(), move || {
                        provider.update(resource_type, physical_id, attributes)
                    })
                    .await
                    .map_err(|e| exhausted(step, e))?;
                self.restore(step, Some(previous)).await?;
                Ok(true)
            }
            StepAction::Delete => {
                let Some(previous) = previous.filter(|p| p.physical_id.is_some()) else {
                    return Ok(false);
                };
                let attributes = self
                    .ledger
                    .resolve(&previous.attributes)
                    .await
                    .map_err(|reference| failure(step, format!("{reference} has no value"), 0))?;
                let resolved = &attributes;
                let (physical_id, _) = self
                    .retry
                    .run(&step.label(), move || provider.create(resource_type, resolved))
                    .await
                    .map_err(|e| exhausted(step, e))?;

                let id = physical_id.as_str();
                let outputs = self
                    .retry
                    .run(&step.label(), move || provider.read(resource_type, id))
                    .await
                    .map_or_else(|_| previous.outputs.clone(), |(outputs, _)| outputs);

                let mut record = previous.clone();
                record.physical_id = Some(physical_id);
                record.outputs = outputs;
                record.deposed.clear();
                record.set_status(RecordStatus::Applied);
                self.ledger
                    .update(|doc| doc.set_record(record))
                    .await
                    .map_err(|e| state_failure(step, &e, 0))?;
                Ok(true)
            }
            StepAction::DeleteReplaced | StepAction::NoOp => Ok(false),
        }
    }

    /// Brings the record of a failed step back to its state before the batch.
    async fn restore_failed(
        &self,
        step: &PlanStep,
        previous: Option<&StateRecord>,
    ) -> Result<bool, ExecutionFailure> {
        match step.action {
            // A failed create leaves only a pending record behind.
            StepAction::Create | StepAction::CreateReplacement => {
                self.restore(step, previous).await.map(|()| false)
            }
            StepAction::Update => self.revert(step, previous).await,
            StepAction::Delete => {
                let Some(current) = self.ledger.record(&step.logical_id).await else {
                    return Ok(false);
                };
                if current.physical_id.is_none() {
                    return self.revert(step, previous).await;
                }
                let Some(previous) = previous else {
                    return Ok(false);
                };
                // Superseded instances already removed stay removed.
                let mut record = previous.clone();
                record.deposed = current.deposed;
                self.ledger
                    .update(|doc| doc.set_record(record))
                    .await
                    .map_err(|e| state_failure(step, &e, 0))?;
                Ok(true)
            }
            // The record already lists exactly the instances still standing.
            StepAction::DeleteReplaced | StepAction::NoOp => Ok(false),
        }
    }

    async fn restore(
        &self,
        step: &PlanStep,
        previous: Option<&StateRecord>,
    ) -> Result<(), ExecutionFailure> {
        self.ledger
            .update(|doc| match previous {
                Some(record) => doc.set_record(record.clone()),
                None => {
                    doc.remove(&step.logical_id);
                }
            })
            .await
            .map_err(|e| state_failure(step, &e, 0))
    }

    async fn record_history(&self, plan: &ExecutionPlan, operation: ApplyOperation, result: &ApplyResult) {
        let error = if result.cancelled {
            Some(String::from("cancelled"))
        } else if result.failures.is_empty() {
            None
        } else {
            Some(
                result
                    .failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };
        let resources: BTreeSet<String> = plan
            .steps()
            .filter(|s| s.action.is_mutation())
            .map(|s| s.logical_id.clone())
            .collect();
        let entry = ApplyHistoryEntry::new(
            operation,
            &plan.id,
            &plan.spec_hash,
            resources.into_iter().collect(),
            error,
        );
        let success = result.is_success();

        let write = self
            .ledger
            .update(|doc| {
                doc.add_history(entry);
                doc.spec_hash.clone_from(&plan.spec_hash);
                if success {
                    doc.compact()
                } else {
                    0
                }
            })
            .await;
        match write {
            Ok(0) => {}
            Ok(compacted) => debug!("Compacted {compacted} deleted record(s)"),
            Err(e) => error!("Failed to record apply history: {e}"),
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("ledger", &self.ledger)
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .field("on_failure", &self.on_failure)
            .finish_non_exhaustive()
    }
}

fn record_mut<'d>(doc: &'d mut StateDocument, step: &PlanStep) -> &'d mut StateRecord {
    doc.records
        .entry(step.logical_id.clone())
        .or_insert_with(|| StateRecord::pending(&step.logical_id, &step.resource_type))
}

fn failure(step: &PlanStep, cause: impl Into<String>, attempts: u32) -> ExecutionFailure {
    ExecutionFailure {
        logical_id: step.logical_id.clone(),
        operation: step.action.to_string(),
        cause: cause.into(),
        attempts,
    }
}

fn exhausted(step: &PlanStep, e: RetryExhausted) -> ExecutionFailure {
    failure(step, e.error.to_string(), e.attempts)
}

fn state_failure(step: &PlanStep, e: &GroundworkError, attempts: u32) -> ExecutionFailure {
    failure(step, format!("state write failed: {e}"), attempts)
}
