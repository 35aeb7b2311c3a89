//! Types for static source validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Severity of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, recorded for audit only
    Info,
    /// Contributes to the risk score but does not block on its own
    Warning,
    /// Rejects the source outright
    Blocking,
}

impl Severity {
    /// Get a human-readable name
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Blocking => "blocking",
        }
    }
}

/// Rule that produced an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    /// Source could not be tokenized or parsed
    SyntaxError,
    /// Source exceeds the configured size bound
    SourceTooLarge,
    /// Import of a module outside the allow-list
    ForbiddenImport,
    /// Call to (or reference of) a capability-granting function
    ForbiddenCall,
    /// Access to an introspection attribute reaching interpreter internals
    ForbiddenAttribute,
    /// `global` / `nonlocal` rebinding of an outer scope
    ScopeRebinding,
    /// `from module import *`
    StarImport,
    /// `except:` without an exception type
    BareExcept,
    /// Accumulated score crossed the policy threshold
    RiskThresholdExceeded,
}

impl RuleId {
    /// Get the stable identifier used in reports and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::SyntaxError => "syntax_error",
            RuleId::SourceTooLarge => "source_too_large",
            RuleId::ForbiddenImport => "forbidden_import",
            RuleId::ForbiddenCall => "forbidden_call",
            RuleId::ForbiddenAttribute => "forbidden_attribute",
            RuleId::ScopeRebinding => "scope_rebinding",
            RuleId::StarImport => "star_import",
            RuleId::BareExcept => "bare_except",
            RuleId::RiskThresholdExceeded => "risk_threshold_exceeded",
        }
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single policy finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Severity level
    pub severity: Severity,
    /// Rule that fired
    pub rule_id: RuleId,
    /// 1-based source line, when known
    pub line: Option<usize>,
    /// Human-readable description
    pub message: String,
}

impl Issue {
    /// Create a new issue
    pub fn new(
        severity: Severity,
        rule_id: RuleId,
        line: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            rule_id,
            line,
            message: message.into(),
        }
    }

    /// Create a blocking issue
    pub fn blocking(rule_id: RuleId, line: Option<usize>, message: impl Into<String>) -> Self {
        Self::new(Severity::Blocking, rule_id, line, message)
    }

    /// Create a warning
    pub fn warning(rule_id: RuleId, line: Option<usize>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, rule_id, line, message)
    }

    /// Whether this issue rejects the source on its own
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(
                f,
                "[{}] {} (line {}): {}",
                self.severity.as_str(),
                self.rule_id,
                line,
                self.message
            ),
            None => write!(
                f,
                "[{}] {}: {}",
                self.severity.as_str(),
                self.rule_id,
                self.message
            ),
        }
    }
}

/// Outcome of validating one source file
///
/// Built fresh for every call and read-only afterwards. The inventory of
/// imports, calls and attributes is populated even when the source is
/// rejected, so the report doubles as an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    safe: bool,
    score: u8,
    issues: Vec<Issue>,
    imports_used: BTreeSet<String>,
    functions_called: BTreeSet<String>,
    attributes_accessed: BTreeSet<String>,
    #[serde(with = "humantime_serde")]
    elapsed: Duration,
}

impl ValidationReport {
    pub(crate) fn new(
        safe: bool,
        score: u8,
        issues: Vec<Issue>,
        inventory: Inventory,
        elapsed: Duration,
    ) -> Self {
        Self {
            safe,
            score,
            issues,
            imports_used: inventory.imports,
            functions_called: inventory.functions,
            attributes_accessed: inventory.attributes,
            elapsed,
        }
    }

    /// Whether the source may be executed
    pub fn safe(&self) -> bool {
        self.safe
    }

    /// Accumulated risk score in `[0, 100]`
    pub fn score(&self) -> u8 {
        self.score
    }

    /// All issues in discovery order
    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    /// Imported module names
    pub fn imports_used(&self) -> &BTreeSet<String> {
        &self.imports_used
    }

    /// Called function names (dotted where resolvable)
    pub fn functions_called(&self) -> &BTreeSet<String> {
        &self.functions_called
    }

    /// Accessed attribute names
    pub fn attributes_accessed(&self) -> &BTreeSet<String> {
        &self.attributes_accessed
    }

    /// Wall-clock time spent validating
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Issues that block execution
    pub fn blocking_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.is_blocking())
    }

    /// Whether any issue was produced by `rule`
    pub fn has_rule(&self, rule: RuleId) -> bool {
        self.issues.iter().any(|i| i.rule_id == rule)
    }

    /// Whether the source failed to parse
    pub fn is_syntax_error(&self) -> bool {
        self.has_rule(RuleId::SyntaxError)
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        let blocking = self.blocking_issues().count();
        format!(
            "{} (score {}, {} issue(s), {} blocking)",
            if self.safe { "safe" } else { "rejected" },
            self.score,
            self.issues.len(),
            blocking
        )
    }
}

/// Names collected while walking the syntax tree
#[derive(Debug, Clone, Default)]
pub(crate) struct Inventory {
    pub imports: BTreeSet<String>,
    pub functions: BTreeSet<String>,
    pub attributes: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_display() {
        let issue = Issue::blocking(RuleId::ForbiddenImport, Some(3), "module 'os' is not allowed");
        assert_eq!(
            issue.to_string(),
            "[blocking] forbidden_import (line 3): module 'os' is not allowed"
        );

        let issue = Issue::warning(RuleId::BareExcept, None, "bare except");
        assert!(!issue.is_blocking());
        assert!(issue.to_string().starts_with("[warning] bare_except:"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Blocking > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_report_accessors() {
        let mut inventory = Inventory::default();
        inventory.imports.insert("math".to_string());
        let report = ValidationReport::new(
            false,
            40,
            vec![
                Issue::warning(RuleId::ScopeRebinding, Some(1), "global x"),
                Issue::blocking(RuleId::ForbiddenCall, Some(2), "eval"),
            ],
            inventory,
            Duration::from_millis(1),
        );

        assert!(!report.safe());
        assert_eq!(report.blocking_issues().count(), 1);
        assert!(report.has_rule(RuleId::ForbiddenCall));
        assert!(!report.is_syntax_error());
        assert!(report.imports_used().contains("math"));
        assert_eq!(report.summary(), "rejected (score 40, 2 issue(s), 1 blocking)");
    }

    #[test]
    fn test_report_serializes_rule_ids() {
        let report = ValidationReport::new(
            false,
            100,
            vec![Issue::blocking(RuleId::SyntaxError, Some(1), "invalid syntax")],
            Inventory::default(),
            Duration::from_millis(2),
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"rule_id\":\"syntax_error\""));
        assert!(json.contains("\"severity\":\"blocking\""));
    }
}
