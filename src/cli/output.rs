//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{SpecDocument, ValidationResult};
use crate::engine::{DriftReport, DriftStatus};
use crate::planner::{ApplyResult, ExecutionPlan, StepAction, StepStatus};
use crate::state::{LockInfo, RecordStatus, StateDocument};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "Batch")]
    batch: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Step result row for table display.
#[derive(Tabled)]
struct StepResultRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    logical_id: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats the outcome of `validate`.
    #[must_use]
    pub fn format_validation(
        &self,
        document: &SpecDocument,
        result: &ValidationResult,
        resources: usize,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": document.project.name,
                "environment": document.project.environment,
                "resources": resources,
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Specification is valid\n", "✓".green())
                } else {
                    let mut output = format!("{} Specification is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                    output
                };

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(
                    output,
                    "\n   Project: {}\n   Environment: {}\n   Resources: {resources}\n",
                    document.project.name, document.project.environment
                );
                output
            }
        }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ExecutionPlan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(
            output,
            "\nExecution Plan {} ({}/{})\n   Spec hash: {}\n\n",
            plan.id,
            plan.project,
            plan.environment,
            short(&plan.spec_hash)
        );

        let rows: Vec<PlanStepRow> = plan
            .batches
            .iter()
            .enumerate()
            .flat_map(|(i, batch)| {
                batch
                    .iter()
                    .filter(|s| s.action.is_mutation())
                    .map(move |s| PlanStepRow {
                        batch: i + 1,
                        action: Self::format_action(s.action),
                        resource: s.logical_id.clone(),
                        resource_type: s.resource_type.clone(),
                        reason: truncate(&s.reason, 48),
                    })
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().yellow(),
            summary.delete.to_string().red()
        );
        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_apply(&self, result: &ApplyResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let mut output = if result.is_success() {
                    format!("{} Apply complete\n\n", "✓".green())
                } else if result.cancelled {
                    format!("{} Apply cancelled\n\n", "⚠".yellow())
                } else {
                    format!("{} Apply failed\n\n", "✗".red())
                };

                let rows: Vec<StepResultRow> = result
                    .steps
                    .iter()
                    .filter(|s| s.action.is_mutation())
                    .map(|s| StepResultRow {
                        step: s.label.clone(),
                        status: Self::format_step_status(s.status),
                        attempts: s.attempts,
                        physical_id: s.physical_id.clone().unwrap_or_default(),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !result.failures.is_empty() {
                    let _ = write!(output, "\n{} Failures:\n", "✗".red());
                    for failure in &result.failures {
                        let _ = writeln!(output, "   - {failure}");
                    }
                }
                if !result.rolled_back.is_empty() {
                    let _ = writeln!(output, "\nRolled back: {}", result.rolled_back.join(", "));
                }

                let _ = writeln!(
                    output,
                    "\n{} applied, {} failed, {} skipped in {}ms",
                    result.count(StepStatus::Applied),
                    result.count(StepStatus::Failed),
                    result.count(StepStatus::Skipped),
                    result.duration_ms
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} resource(s) converged.\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in &report.entries {
                    let status = match entry.status {
                        DriftStatus::Missing => entry.status.to_string().red().to_string(),
                        DriftStatus::Modified => entry.status.to_string().yellow().to_string(),
                        DriftStatus::Unapplied | DriftStatus::Unreadable => {
                            entry.status.to_string().dimmed().to_string()
                        }
                    };
                    let _ = writeln!(output, "   - {} ({status})", entry.logical_id);
                    for attribute in &entry.attributes {
                        let live = attribute
                            .live
                            .as_ref()
                            .map_or_else(|| String::from("<absent>"), ToString::to_string);
                        let _ = writeln!(
                            output,
                            "       {}: {} -> {live}",
                            attribute.key, attribute.recorded
                        );
                    }
                    if let Some(message) = &entry.message {
                        let _ = writeln!(output, "       {message}");
                    }
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.entries.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats the state document.
    #[must_use]
    pub fn format_state(&self, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Spec hash: {}", short(&state.spec_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);

                if !state.records.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .records
                        .values()
                        .map(|r| RecordRow {
                            logical_id: r.logical_id.clone(),
                            resource_type: r.resource_type.clone(),
                            status: Self::format_record_status(r.status),
                            physical_id: r.physical_id.clone().unwrap_or_default(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats a held lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn format_message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "message": message })),
            OutputFormat::Text => format!("{message}\n"),
        }
    }

    /// Formats a step action with color.
    fn format_action(action: StepAction) -> String {
        match action {
            StepAction::Create => "+create".green().to_string(),
            StepAction::CreateReplacement => "+/-replace".yellow().to_string(),
            StepAction::Update => "~update".yellow().to_string(),
            StepAction::Delete => "-delete".red().to_string(),
            StepAction::DeleteReplaced => "-deposed".red().to_string(),
            StepAction::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats a step status with color.
    fn format_step_status(status: StepStatus) -> String {
        match status {
            StepStatus::Applied => "applied".green().to_string(),
            StepStatus::Failed => "failed".red().to_string(),
            StepStatus::Skipped => "skipped".dimmed().to_string(),
            StepStatus::Pending | StepStatus::InProgress => "pending".yellow().to_string(),
        }
    }

    /// Formats a record status with color.
    fn format_record_status(status: RecordStatus) -> String {
        match status {
            RecordStatus::Applied => "applied".green().to_string(),
            RecordStatus::Pending => "pending".yellow().to_string(),
            RecordStatus::Failed => "failed".red().to_string(),
            RecordStatus::Deleted => "deleted".dimmed().to_string(),
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default() + "\n"
}

/// First eight characters of a hash.
fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer reason text", 10), "a longe...");
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn test_json_state_output() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let state = StateDocument::new("app", "dev");
        let output = formatter.format_state(&state);
        let parsed: serde_json::Value = serde_json::from_str(&output).expect("json");
        assert_eq!(parsed["project"], "app");
        assert_eq!(parsed["serial"], 0);
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let plan = ExecutionPlan {
            id: String::from("plan-1"),
            created_at: chrono::Utc::now(),
            project: String::from("app"),
            environment: String::from("dev"),
            spec_hash: String::from("abcdef0123"),
            state_serial: 0,
            batches: Vec::new(),
        };
        assert!(formatter.format_plan(&plan).contains("No changes required"));
    }
}
