//! Output formatting for CLI commands.
//!
//! This module renders plans, run reports and state for display, either as
//! colored text tables or as JSON for scripting.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::orchestrator::{ProgressEvent, RunReport, UnitOutcome};
use crate::planner::{ChangeKind, ChangeSet, DeploymentPlan, UnitPreview};
use crate::state::{ContextEntry, LockInfo, RecordedState};
use crate::unit::{DeployableUnit, UnitState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Environment")]
    environment: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Summary")]
    summary: String,
}

/// Run outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Submissions")]
    submissions: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Status row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Environment")]
    environment: String,
    #[tabled(rename = "Revision")]
    revision: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Committed")]
    committed: String,
}

/// Context entry row for table display.
#[derive(Tabled)]
struct ContextRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Stale")]
    stale: String,
    #[tabled(rename = "Resolved")]
    resolved: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a deployment plan.
    #[must_use]
    pub fn format_plan(&self, plan: &DeploymentPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &DeploymentPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!("{} No changes required, every unit matches its recorded state.\n", "✓".green());
        }

        let mut output = format!("\n{} plan\n\n", plan.mode.to_string().bold());

        let rows: Vec<PlanRow> = plan
            .units
            .iter()
            .enumerate()
            .map(|(i, unit)| {
                let (change, summary) = match &unit.preview {
                    UnitPreview::Changes { change_set } => {
                        (Self::format_change(change_set), Self::summarize(change_set))
                    }
                    UnitPreview::Error { class, message } => {
                        ("error".red().to_string(), Self::truncate(&format!("{class:?}: {message}"), 60))
                    }
                };
                PlanRow {
                    index: i + 1,
                    unit: unit.unit_id.clone(),
                    environment: unit.environment.to_string(),
                    change,
                    summary,
                }
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for unit in &plan.units {
                let Some(change_set) = unit.change_set() else { continue };
                if change_set.is_empty() {
                    continue;
                }
                let _ = writeln!(output, "\n{}:", unit.unit_id.bold());
                for entry in &change_set.entries {
                    let _ = writeln!(output, "   {entry}");
                }
                for path in &change_set.unresolved {
                    let _ = writeln!(output, "   {} {path} (known after apply)", "?".dimmed());
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} units to change, {} unchanged, {} errors\n",
            plan.change_count().to_string().yellow(),
            (plan.units.len() - plan.change_count() - plan.error_count()).to_string().green(),
            plan.error_count().to_string().red()
        );

        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let headline = if report.is_success() {
            format!("{} {} run completed", "✓".green(), report.mode)
        } else if report.cancelled {
            format!("{} {} run cancelled", "⚠".yellow(), report.mode)
        } else {
            format!("{} {} run finished with failures", "✗".red(), report.mode)
        };

        let mut output = format!("\n{headline}{}\n\n", if report.dry_run { " (dry run)" } else { "" });

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .map(|o| OutcomeRow {
                unit: o.unit_id.clone(),
                state: Self::format_state(o.state),
                submissions: o.submissions,
                detail: Self::truncate(&Self::outcome_detail(o), 60),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        for outcome in report.outcomes.iter().filter(|o| o.error.is_some()) {
            let Some(error) = &outcome.error else { continue };
            if error.diagnostics.is_empty() {
                continue;
            }
            let _ = writeln!(output, "\n{} diagnostics:", outcome.unit_id.bold());
            for line in &error.diagnostics {
                let _ = writeln!(output, "   - {line}");
            }
        }

        let elapsed = report.finished_at - report.started_at;
        let _ = write!(
            output,
            "\n{} succeeded, {} failed, {} rolled back, {} pending in {}ms\n",
            (report.count(UnitState::Succeeded) + report.count(UnitState::Planned)).to_string().green(),
            report.count(UnitState::Failed).to_string().red(),
            report.count(UnitState::RolledBack).to_string().yellow(),
            report.count(UnitState::Pending).to_string().dimmed(),
            elapsed.num_milliseconds()
        );

        output
    }

    fn outcome_detail(outcome: &UnitOutcome) -> String {
        if let Some(error) = &outcome.error {
            return error.message.clone();
        }
        if !outcome.blocked_by.is_empty() {
            return format!("blocked by {}", outcome.blocked_by.join(", "));
        }
        outcome
            .change_set
            .as_ref()
            .map_or_else(String::new, Self::summarize)
    }

    /// Formats a progress event as a single line.
    #[must_use]
    pub fn format_event(&self, event: &ProgressEvent) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(event).unwrap_or_default(),
            OutputFormat::Text => {
                let mut line = format!(
                    "{} {} [{}] {}",
                    event.at.format("%H:%M:%S").to_string().dimmed(),
                    event.unit_id.bold(),
                    event.environment,
                    Self::format_state(event.state)
                );
                if let Some(message) = &event.message {
                    let _ = write!(line, " {}", Self::truncate(message, 80));
                }
                line
            }
        }
    }

    /// Formats the recorded state of the project's units.
    #[must_use]
    pub fn format_status(&self, units: &[DeployableUnit], records: &[Option<RecordedState>]) -> String {
        match self.format {
            OutputFormat::Json => {
                let entries: Vec<serde_json::Value> = units
                    .iter()
                    .zip(records)
                    .map(|(unit, record)| {
                        serde_json::json!({
                            "unit_id": unit.id,
                            "environment": unit.environment,
                            "record": record,
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&entries).unwrap_or_default()
            }
            OutputFormat::Text => {
                let rows: Vec<StatusRow> = units
                    .iter()
                    .zip(records)
                    .map(|(unit, record)| match record {
                        Some(record) => StatusRow {
                            unit: unit.id.clone(),
                            environment: unit.environment.to_string(),
                            revision: record.revision.to_string(),
                            fingerprint: Self::truncate(&record.fingerprint, 16),
                            committed: record.committed_at.format("%Y-%m-%d %H:%M").to_string(),
                        },
                        None => StatusRow {
                            unit: unit.id.clone(),
                            environment: unit.environment.to_string(),
                            revision: "-".dimmed().to_string(),
                            fingerprint: "never applied".dimmed().to_string(),
                            committed: String::new(),
                        },
                    })
                    .collect();
                format!("\n{}\n", Table::new(rows))
            }
        }
    }

    /// Formats one recorded state.
    #[must_use]
    pub fn format_record(&self, record: &RecordedState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(record).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("\n{} in {}\n\n", record.unit_id.bold(), record.environment);
                let _ = writeln!(output, "   Revision: {}", record.revision);
                let _ = writeln!(output, "   Fingerprint: {}", record.fingerprint);
                let _ = writeln!(output, "   Committed: {}", record.committed_at);
                let _ = writeln!(output, "   Format: {}", record.format_version);
                if !record.outputs.is_empty() {
                    output.push_str("\n   Outputs:\n");
                    for (name, value) in &record.outputs {
                        let _ = writeln!(output, "     {name} = {value}");
                    }
                }
                let document = serde_json::to_string_pretty(&record.document).unwrap_or_default();
                let _ = write!(output, "\n   Document:\n{}\n", Self::indent(&document, 5));
                output
            }
        }
    }

    /// Formats context cache entries.
    #[must_use]
    pub fn format_context(&self, entries: &[ContextEntry]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(entries).unwrap_or_default(),
            OutputFormat::Text => {
                if entries.is_empty() {
                    return String::from("No context entries cached.\n");
                }
                let rows: Vec<ContextRow> = entries
                    .iter()
                    .map(|e| ContextRow {
                        key: e.key.to_string(),
                        value: Self::truncate(&e.value.to_string(), 40),
                        stale: if e.stale { "yes".yellow().to_string() } else { "no".to_string() },
                        resolved: e.resolved_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("\n{}\n", Table::new(rows))
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&lock).unwrap_or_default(),
            OutputFormat::Text => lock.map_or_else(
                || String::from("State is not locked.\n"),
                |info| {
                    format!(
                        "Locked by {} since {} (lock {}, {}s left)\n",
                        info.holder,
                        info.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                        info.lock_id,
                        info.remaining_secs()
                    )
                },
            ),
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Project is valid\n", "✓".green())
                } else {
                    format!("{} Project has {} errors\n", "✗".red(), result.error_count())
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {error}");
                }
                if show_warnings && result.warning_count() > 0 {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    fn format_change(change_set: &ChangeSet) -> String {
        if change_set.is_empty() {
            return "none".dimmed().to_string();
        }
        let label = change_set.kind.to_string();
        if change_set.requires_replacement() {
            return format!("{label} (replace)").red().to_string();
        }
        match change_set.kind {
            ChangeKind::Create => label.green().to_string(),
            ChangeKind::Update | ChangeKind::Rollback => {
                label.yellow().to_string()
            }
            ChangeKind::Destroy => label.red().to_string(),
        }
    }

    fn summarize(change_set: &ChangeSet) -> String {
        if change_set.is_empty() {
            return String::from("no changes");
        }
        let (adds, modifies, removes) = change_set.counts();
        let mut summary = format!("+{adds} ~{modifies} -{removes}");
        if !change_set.unresolved.is_empty() {
            let _ = write!(summary, ", {} known after apply", change_set.unresolved.len());
        }
        summary
    }

    /// Formats a unit state with color.
    fn format_state(state: UnitState) -> String {
        let label = state.to_string();
        match state {
            UnitState::Succeeded => label.green().to_string(),
            UnitState::Planned => label.cyan().to_string(),
            UnitState::Failed => label.red().to_string(),
            UnitState::RolledBack => label.yellow().to_string(),
            UnitState::Pending => label.dimmed().to_string(),
            UnitState::Diffing | UnitState::Submitting | UnitState::InProgress => label.blue().to_string(),
        }
    }

    /// Truncates a string to at most `max_len` characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    fn indent(text: &str, width: usize) -> String {
        let pad = " ".repeat(width);
        text.lines()
            .map(|line| format!("{pad}{line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
