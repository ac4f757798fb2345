//! Planning and execution.
//!
//! The diff engine compares the desired graph with recorded state, the
//! scheduler orders the resulting change-set into batches, and the executor
//! applies those batches through providers.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{AttributeChange, ChangeKind, ChangeSet, ChangeSetEntry, DiffEngine};
pub use executor::{ApplyResult, Executor, StepReport, StepStatus};
pub use plan::{ExecutionPlan, PlanContext, PlanStep, PlanSummary, Scheduler, StepAction};
pub use retry::{RetryExhausted, RetryPolicy};
