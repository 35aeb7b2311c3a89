//! Static source validation
//!
//! Parses guest source into a syntax tree and checks it against a
//! [`ValidationPolicy`] before anything is allowed near a container:
//! - Imports outside the allow-list (default-deny)
//! - Calls to capability-granting functions
//! - Introspection attributes that reach interpreter internals
//! - Broad-risk constructs, scored and escalated in strict mode
//!
//! Validation never fails: unparseable or oversized input yields a rejected
//! [`ValidationReport`] carrying the reason.

mod analyzer;
pub mod ast;
pub mod lexer;
pub mod parser;
pub mod policy;
pub mod types;
pub mod visitor;

pub use lexer::SyntaxError;
pub use parser::parse_module;
pub use policy::{RuleWeights, ValidationPolicy};
pub use types::{Issue, RuleId, Severity, ValidationReport};

use analyzer::Analyzer;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use types::Inventory;

/// Validates guest source against an immutable policy
#[derive(Debug, Clone, Default)]
pub struct StaticValidator {
    policy: Arc<ValidationPolicy>,
}

impl StaticValidator {
    /// Create a validator owning `policy`
    pub fn new(policy: ValidationPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    /// Create a validator sharing an existing policy
    pub fn with_shared_policy(policy: Arc<ValidationPolicy>) -> Self {
        Self { policy }
    }

    /// Get the policy in effect
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate `source`, always returning a report
    pub fn validate(&self, source: &str) -> ValidationReport {
        let started = Instant::now();

        let (mut issues, inventory) =
            match panic::catch_unwind(AssertUnwindSafe(|| self.collect(source))) {
                Ok(found) => found,
                Err(_) => {
                    error!(bytes = source.len(), "Validator panicked, rejecting source");
                    (
                        vec![Issue::blocking(
                            RuleId::SyntaxError,
                            None,
                            "source could not be analysed",
                        )],
                        Inventory::default(),
                    )
                }
            };

        let score = self.score(&issues);
        let has_blocking = issues.iter().any(Issue::is_blocking);
        let over_threshold = score > self.policy.risk_threshold;
        if !has_blocking && over_threshold {
            issues.push(Issue::blocking(
                RuleId::RiskThresholdExceeded,
                None,
                format!(
                    "risk score {} exceeds threshold {}",
                    score, self.policy.risk_threshold
                ),
            ));
        }
        let safe = !has_blocking && !over_threshold;

        let elapsed = started.elapsed();
        debug!(
            safe,
            score,
            issues = issues.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "Validated source"
        );
        ValidationReport::new(safe, score, issues, inventory, elapsed)
    }

    fn collect(&self, source: &str) -> (Vec<Issue>, Inventory) {
        if source.len() > self.policy.max_source_bytes {
            let issue = Issue::blocking(
                RuleId::SourceTooLarge,
                None,
                format!(
                    "source is {} bytes, limit is {}",
                    source.len(),
                    self.policy.max_source_bytes
                ),
            );
            return (vec![issue], Inventory::default());
        }

        match parse_module(source) {
            Ok(module) => Analyzer::new(&self.policy).analyze(&module),
            Err(e) => (
                vec![Issue::blocking(
                    RuleId::SyntaxError,
                    Some(e.line),
                    e.message,
                )],
                Inventory::default(),
            ),
        }
    }

    /// Sum of rule weights, saturated at 100
    fn score(&self, issues: &[Issue]) -> u8 {
        let total = issues
            .iter()
            .map(|i| self.policy.weights.weight_for(i.rule_id))
            .fold(0u32, u32::saturating_add);
        total.min(100) as u8
    }
}
