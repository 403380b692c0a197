//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{InputsHasher, ValidationResult};
use crate::error::StackweaveError;
use crate::model::Stack;
use crate::orchestrator::RunReport;
use crate::planner::{ActionKind, ApplyResult, NodeStatus, Plan};
use crate::state::{LockInfo, StackOutputs, StackState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Node report row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when emitting JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a validation outcome with a summary of the declared stacks.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, stacks: &[Stack], show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                errors: result.errors.iter().map(|e| format!("{}: {}", e.field, e.message)).collect(),
                warnings: result.warnings.clone(),
                stacks: stacks
                    .iter()
                    .map(|s| StackSummaryJson {
                        name: s.name().to_string(),
                        resources: s.len(),
                        references: s.referenced_stacks().into_iter().collect(),
                    })
                    .collect(),
            }),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nStacks:\n");
                for stack in stacks {
                    let references = stack.referenced_stacks();
                    if references.is_empty() {
                        let _ = writeln!(output, "   {} ({} resources)", stack.name(), stack.len());
                    } else {
                        let names: Vec<String> = references.into_iter().collect();
                        let _ = writeln!(
                            output,
                            "   {} ({} resources, reads {})",
                            stack.name(),
                            stack.len(),
                            names.join(", ")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats preview plans for display.
    #[must_use]
    pub fn format_plans(&self, plans: &[Plan], detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&plans),
            OutputFormat::Text => {
                let mut output = String::new();
                for plan in plans {
                    output.push_str(&Self::format_plan_text(plan, detailed));
                }
                output
            }
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() && plan.count(ActionKind::PendingDependency) == 0 {
            return format!("{} {plan}\n", "✓".green());
        }

        let mut output = format!("\nStack {}\n", plan.stack.bold());

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.kind != ActionKind::NoOp)
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action(a.kind, a.replacement),
                resource: a.resource_id.to_string(),
                reason: Self::truncate(&a.reason, 50),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions.iter().filter(|a| !a.unresolved.is_empty()) {
                let waiting: Vec<String> = action.unresolved.iter().map(ToString::to_string).collect();
                let _ = writeln!(output, "   {} waits on {}", action.resource_id, waiting.join(", "));
            }
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} pending, {} unchanged",
            plan.count(ActionKind::Create).to_string().green(),
            plan.count(ActionKind::Update).to_string().yellow(),
            plan.count(ActionKind::Delete).to_string().red(),
            plan.count(ActionKind::PendingDependency).to_string().cyan(),
            plan.count(ActionKind::NoOp)
        );

        output
    }

    /// Formats the outcome of `up` or `destroy`.
    #[must_use]
    pub fn format_run(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let mut output = String::new();
                for result in &report.results {
                    output.push_str(&Self::format_result_text(result));
                }
                if let Some(aborted) = &report.aborted {
                    let _ = writeln!(
                        output,
                        "\n{} Stack {} aborted: {}",
                        "✗".red(),
                        aborted.stack.bold(),
                        aborted.message
                    );
                }
                for stack in &report.skipped {
                    let _ = writeln!(output, "{} Stack {stack} skipped", "⚠".yellow());
                }
                output
            }
        }
    }

    fn format_result_text(result: &ApplyResult) -> String {
        let status = if result.is_success() {
            format!("{} Stack {} converged", "✓".green(), result.stack.bold())
        } else {
            format!("{} Stack {} did not converge", "✗".red(), result.stack.bold())
        };

        let mut output = format!("\n{status} in {}s\n", result.duration().num_seconds());

        let rows: Vec<NodeRow> = result
            .reports
            .iter()
            .filter(|r| r.status != NodeStatus::NoOp)
            .map(|r| NodeRow {
                resource: r.resource_id.to_string(),
                action: Self::format_action(r.action, r.replacement),
                status: Self::format_status(r.status),
                attempts: r.attempts,
                error: r.error.as_ref().map_or_else(String::new, |e| {
                    let hint = if e.retry_safe { "" } else { " (check before retrying)" };
                    format!("{}{hint}", Self::truncate(&e.message, 60))
                }),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = writeln!(
            output,
            "   {} succeeded, {} unchanged, {} failed, {} blocked, {} cancelled, {} need reconciliation",
            result.count(NodeStatus::Succeeded),
            result.count(NodeStatus::NoOp),
            result.count(NodeStatus::Failed),
            result.count(NodeStatus::Blocked),
            result.count(NodeStatus::Cancelled),
            result.count(NodeStatus::NeedsReconciliation)
        );

        if !result.outputs_complete {
            let _ = writeln!(output, "   {} some outputs could not be resolved", "⚠".yellow());
        }

        output
    }

    /// Formats the published outputs of a stack.
    #[must_use]
    pub fn format_outputs(&self, stack: &str, outputs: Option<&StackOutputs>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&outputs),
            OutputFormat::Text => match outputs {
                None => format!("Stack {stack} has not published outputs.\n"),
                Some(outputs) => {
                    let mut output = format!("\nOutputs of {}\n\n", stack.bold());
                    for (key, value) in &outputs.values {
                        let _ = writeln!(output, "   {key} = {value}");
                    }
                    let _ = writeln!(output, "\n   Published: {}", outputs.published_at.format("%Y-%m-%d %H:%M"));
                    if !outputs.complete {
                        let _ = writeln!(output, "   {} incomplete", "⚠".yellow());
                    }
                    output
                }
            },
        }
    }

    /// Formats the stored state of a stack.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = format!("\nState: {}\n\n", state.stack.bold());

                if state.records.is_empty() {
                    output.push_str("   No resources recorded.\n");
                } else {
                    let rows: Vec<RecordRow> = state
                        .records
                        .values()
                        .map(|r| RecordRow {
                            resource: r.resource_id.to_string(),
                            kind: r.kind.clone(),
                            provider: r.provider.to_string(),
                            hash: InputsHasher::short_hash(&r.inputs_hash).to_string(),
                            version: r.version,
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
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

    /// Formats a lock description.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "Stack {} locked by {} ({})\n",
                lock.stack, lock.holder, lock.lock_id
            ),
        }
    }

    /// Formats a plain message.
    #[must_use]
    pub fn format_message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": "ok", "message": message })),
            OutputFormat::Text => format!("{} {message}\n", "✓".green()),
        }
    }

    /// Formats a terminating error.
    #[must_use]
    pub fn format_error(&self, error: &StackweaveError) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "status": "error",
                "message": error.to_string(),
                "exit_code": error.exit_code(),
                "retryable": error.is_retryable(),
            })),
            OutputFormat::Text => format!("{} {error}\n", "✗".red()),
        }
    }

    fn format_action(kind: ActionKind, replacement: bool) -> String {
        match (kind, replacement) {
            (ActionKind::Create, true) => "+replace".magenta().to_string(),
            (ActionKind::Create, false) => "+create".green().to_string(),
            (ActionKind::Update, _) => "~update".yellow().to_string(),
            (ActionKind::Delete, true) => "-replaced".magenta().to_string(),
            (ActionKind::Delete, false) => "-delete".red().to_string(),
            (ActionKind::PendingDependency, _) => "?pending".cyan().to_string(),
            (ActionKind::NoOp, _) => "no-op".dimmed().to_string(),
        }
    }

    fn format_status(status: NodeStatus) -> String {
        match status {
            NodeStatus::Succeeded => "succeeded".green().to_string(),
            NodeStatus::NoOp => "no-op".dimmed().to_string(),
            NodeStatus::Failed => "failed".red().to_string(),
            NodeStatus::Blocked => "blocked".yellow().to_string(),
            NodeStatus::Cancelled => "cancelled".yellow().to_string(),
            NodeStatus::NeedsReconciliation => "needs reconciliation".red().bold().to_string(),
        }
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
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct ValidationJson {
    valid: bool,
    errors: Vec<String>,
    warnings: Vec<String>,
    stacks: Vec<StackSummaryJson>,
}

#[derive(Serialize)]
struct StackSummaryJson {
    name: String,
    resources: usize,
    references: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Inputs, Value};
    use crate::orchestrator::StackAbort;
    use crate::planner::Action;
    use crate::state::StackOperation;
    use std::collections::BTreeMap;

    fn plan() -> Plan {
        let mut stack = Stack::new("network");
        stack
            .declare(
                "echo:vpc",
                "vpc",
                Inputs::from([(String::from("cidr"), Value::literal("10.0.0.0/16"))]),
                Vec::<String>::new(),
            )
            .expect("declare");
        let resource = stack.get("vpc").expect("vpc").clone();

        let mut plan = Plan::new("network", BTreeMap::new());
        plan.push(Action::for_resource(&resource, ActionKind::Create, "new resource"));
        plan
    }

    #[test]
    fn test_aborted_run_lists_stack_and_skipped() {
        let report = RunReport {
            operation: StackOperation::Up,
            results: Vec::new(),
            aborted: Some(StackAbort::new(
                "cluster",
                StackweaveError::Resolve(crate::error::ResolveError::UnknownOutput {
                    stack: String::from("network"),
                    key: String::from("vpcId"),
                }),
            )),
            skipped: vec![String::from("mesh")],
        };

        let json: serde_json::Value =
            serde_json::from_str(&OutputFormatter::new(OutputFormat::Json).format_run(&report)).expect("json");
        assert_eq!(json["aborted"]["stack"], "cluster");
        assert_eq!(json["aborted"]["exit_code"], 2);
        assert_eq!(json["skipped"][0], "mesh");

        let text = OutputFormatter::new(OutputFormat::Text).format_run(&report);
        assert!(text.contains("aborted"));
        assert!(text.contains("Stack mesh skipped"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_plan_json_lists_actions() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: serde_json::Value =
            serde_json::from_str(&formatter.format_plans(&[plan()], false)).expect("json");
        assert_eq!(json[0]["stack"], "network");
        assert_eq!(json[0]["actions"][0]["kind"], "create");
        assert_eq!(json[0]["actions"][0]["resource_id"], "vpc");
    }

    #[test]
    fn test_plan_text_summarises_counts() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plans(&[plan()], false);
        assert!(text.contains("+create"));
        assert!(text.contains("Plan: 1 to create, 0 to update, 0 to delete, 0 pending, 0 unchanged"));
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plans(&[Plan::new("dns", BTreeMap::new())], false);
        assert!(text.contains("No changes required for stack dns"));
    }

    #[test]
    fn test_error_json_carries_exit_code() {
        let error = StackweaveError::Model(crate::error::ModelError::CyclicDependency {
            cycle: vec![String::from("a"), String::from("b")],
        });
        let json: serde_json::Value =
            serde_json::from_str(&OutputFormatter::new(OutputFormat::Json).format_error(&error)).expect("json");
        assert_eq!(json["exit_code"], 3);
        assert_eq!(json["status"], "error");
    }
}
