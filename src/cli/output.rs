//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::capacity::{InstanceSnapshot, Market};
use crate::cleanup::CleanupReport;
use crate::lifecycle::TerminationOutcome;
use crate::orchestrator::{DeployOutcome, ReadyReport, StopReason};
use crate::selector::Candidate;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Offering row for table display.
#[derive(Tabled)]
struct OfferingRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "GPU")]
    gpu: String,
    #[tabled(rename = "VRAM")]
    vram: String,
    #[tabled(rename = "$/hr")]
    cost: String,
    #[tabled(rename = "Available")]
    available: u32,
}

/// Tunnel row for table display.
#[derive(Tabled)]
struct TunnelRow {
    #[tabled(rename = "Service")]
    label: String,
    #[tabled(rename = "Local")]
    local: String,
    #[tabled(rename = "Remote port")]
    remote: u16,
}

/// Stop result row for table display.
#[derive(Tabled)]
struct StopRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Result")]
    result: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the selected format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats ranked offerings.
    #[must_use]
    pub fn format_offerings(&self, market: Market, candidates: &[Candidate]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&OfferingsJson {
                market,
                candidates,
            })
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("\nGPU offerings ({market})\n\n");

                let rows: Vec<OfferingRow> = candidates
                    .iter()
                    .enumerate()
                    .map(|(i, c)| OfferingRow {
                        index: i + 1,
                        gpu: Self::truncate(&c.offering.display_name, 32),
                        vram: format!("{}GB", c.offering.vram_gb),
                        cost: format!("{:.2}", c.cost_per_hour),
                        available: c.offering.available,
                    })
                    .collect();

                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                if let Some(best) = candidates.first() {
                    let _ = write!(
                        output,
                        "\n{} deploy would request {} at ${:.2}/hr\n",
                        "→".cyan(),
                        best.offering.display_name.bold(),
                        best.cost_per_hour
                    );
                }
                output
            }
        }
    }

    /// Formats connection details for a ready pod.
    #[must_use]
    pub fn format_ready(&self, report: &ReadyReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\n{} Pod {} is ready\n\n",
                    "✓".green(),
                    report.pod_name.bold()
                );
                let _ = writeln!(output, "   ID:       {}", report.pod_id);
                let _ = writeln!(
                    output,
                    "   GPU:      {} ({}GB, {})",
                    report.gpu, report.vram_gb, report.market
                );
                let _ = writeln!(output, "   Cost:     ${:.2}/hr", report.cost_per_hour);
                let _ = writeln!(
                    output,
                    "   SSH:      ssh -p {} root@{}\n",
                    report.ssh_port, report.public_ip
                );

                let rows: Vec<TunnelRow> = report
                    .tunnels
                    .iter()
                    .map(|t| TunnelRow {
                        label: t.label.clone(),
                        local: format!("{}:{}", report.bind, t.local_port),
                        remote: t.remote_port,
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let _ = write!(
                    output,
                    "\n{} The pod is billed until this process exits. Press Ctrl+C to terminate it.\n",
                    "⚠".yellow()
                );
                output
            }
        }
    }

    /// Formats the end-of-run summary.
    #[must_use]
    pub fn format_outcome(&self, outcome: &DeployOutcome) -> String {
        let reason = match &outcome.reason {
            StopReason::Interrupted => String::from("interrupted"),
            StopReason::TunnelsExited => String::from("tunnels exited"),
            StopReason::Failed(e) => e.to_string(),
        };

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&OutcomeJson {
                success: outcome.success(),
                reason,
                tunnels_stopped: outcome.cleanup.tunnels_stopped,
                termination: Self::termination_text(&outcome.cleanup),
            })
            .unwrap_or_default(),
            OutputFormat::Text => {
                let status = if outcome.success() {
                    format!("{} Run finished ({reason})", "✓".green())
                } else {
                    format!("{} Run failed: {reason}", "✗".red())
                };

                let mut output = format!("{status}\n");
                let _ = writeln!(output, "   Tunnels stopped: {}", outcome.cleanup.tunnels_stopped);
                let _ = writeln!(output, "   Pod: {}", Self::termination_text(&outcome.cleanup));
                output
            }
        }
    }

    /// Formats the result of `stop`.
    #[must_use]
    pub fn format_stop(
        &self,
        results: &[(InstanceSnapshot, Result<TerminationOutcome, String>)],
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let rows: Vec<StopJson<'_>> = results
                    .iter()
                    .map(|(pod, outcome)| StopJson {
                        id: &pod.id,
                        name: &pod.name,
                        terminated: outcome.is_ok(),
                        result: Self::outcome_text(outcome),
                    })
                    .collect();
                serde_json::to_string_pretty(&rows).unwrap_or_default()
            }
            OutputFormat::Text => {
                if results.is_empty() {
                    return format!("{} No running pods to stop.\n", "✓".green());
                }

                let rows: Vec<StopRow> = results
                    .iter()
                    .map(|(pod, outcome)| StopRow {
                        name: pod.name.clone(),
                        id: Self::truncate(&pod.id, 16),
                        result: match outcome {
                            Ok(_) => Self::outcome_text(outcome).green().to_string(),
                            Err(_) => Self::outcome_text(outcome).red().to_string(),
                        },
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                output
            }
        }
    }

    fn termination_text(report: &CleanupReport) -> String {
        match &report.termination {
            Ok(outcome) => outcome.to_string(),
            Err(e) => format!("NOT CONFIRMED ({e}); check the RunPod console"),
        }
    }

    fn outcome_text(outcome: &Result<TerminationOutcome, String>) -> String {
        match outcome {
            Ok(outcome) => outcome.to_string(),
            Err(e) => format!("failed: {e}"),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct OfferingsJson<'a> {
    market: Market,
    candidates: &'a [Candidate],
}

#[derive(Serialize)]
struct OutcomeJson {
    success: bool,
    reason: String,
    tunnels_stopped: usize,
    termination: String,
}

#[derive(Serialize)]
struct StopJson<'a> {
    id: &'a str,
    name: &'a str,
    terminated: bool,
    result: String,
}
