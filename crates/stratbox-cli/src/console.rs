//! CLI console utilities

use colored::*;
use stratbox_core::{ExecutionResult, ExecutionStatus, Severity, ValidationReport};

/// Formatted terminal output
pub struct CliConsole;

impl CliConsole {
    pub fn success(&self, message: &str) {
        println!("{} {}", "✓".green().bold(), message.green());
    }

    pub fn warn(&self, message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message.yellow());
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message.red());
    }

    pub fn print_header(&self, title: &str) {
        println!();
        println!("{}", title.bold().underline());
        println!("{}", "=".repeat(title.chars().count()).dimmed());
    }

    /// Print a validation report with one line per issue
    pub fn print_report(&self, label: &str, report: &ValidationReport) {
        if report.safe() {
            self.success(&format!("{}: {}", label, report.summary()));
        } else {
            self.error(&format!("{}: {}", label, report.summary()));
        }
        for issue in report.issues() {
            let tag = match issue.severity {
                Severity::Blocking => "blocking".red(),
                Severity::Warning => "warning".yellow(),
                Severity::Info => "info".blue(),
            };
            let line = issue
                .line
                .map(|l| format!("line {}", l))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {} {} [{}] {}",
                tag,
                line.dimmed(),
                issue.rule_id,
                issue.message
            );
        }
    }

    /// Print the outcome of one execution
    pub fn print_result(&self, label: &str, result: &ExecutionResult) {
        let headline = format!("{}: {}", label, result.summary());
        match result.status {
            ExecutionStatus::Success => self.success(&headline),
            ExecutionStatus::ValidationRejected | ExecutionStatus::Cancelled => {
                self.warn(&headline)
            }
            _ => self.error(&headline),
        }

        if let Some(report) = result
            .validation_report
            .as_ref()
            .filter(|report| !report.safe())
        {
            self.print_report(label, report);
        }
        if !result.stdout.is_empty() {
            println!("{}", "--- stdout ---".dimmed());
            print!("{}", result.stdout);
        }
        if !result.stderr.is_empty() {
            println!("{}", "--- stderr ---".dimmed());
            print!("{}", result.stderr);
        }
        if result.output_truncated {
            self.warn("output was truncated");
        }
        if result.launched() {
            let usage = &result.resource_usage;
            println!(
                "{}",
                format!(
                    "memory peak {} KiB, cpu peak {:.1}%, {} sample(s)",
                    usage.memory_bytes_peak / 1024,
                    usage.cpu_percent_peak,
                    usage.sample_count
                )
                .dimmed()
            );
        }
    }
}
