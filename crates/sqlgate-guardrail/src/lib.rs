//! sqlgate guardrails
//!
//! Deterministic gates between generated SQL and the database: schema checks
//! on extracted filters, confirmation that every required filter and snippet
//! survived into the final SQL, and snippet composition rules.

pub mod composition;
pub mod filters;
pub mod preservation;
pub mod schema;
pub mod state;

use serde::{Deserialize, Serialize};
use sqlgate_catalog::Snippet;
use sqlgate_sql::StructuralReport;
use tracing::{debug, warn};

pub use composition::{validate_composition, CompositionReport, CompositionViolation, ViolationKind};
pub use filters::{
    validate_filter, validate_filters, FilterIssue, FilterOperator, FilterValidationReport,
    RejectedFilter, ResidualFilter, UnknownOperator,
};
pub use preservation::{field_in_where, filter_preserved, snippet_present};
pub use schema::{FieldType, InMemorySchemaCatalog, SchemaCatalog, SchemaField};
pub use state::{
    ClarificationChoice, FilterSource, MergedFilter, MergedFilterState, PendingClarification,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    FieldNotFound,
    OperatorInvalidForType,
    ValueTypeMismatch,
    EnumValueNotFound,
    RequiredFilterMissing,
    OptionalFilterMissing,
    RequiredSnippetMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Clarify,
    Reject,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "pass",
            Verdict::Clarify => "clarify",
            Verdict::Reject => "reject",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardIssue {
    pub code: IssueCode,
    pub severity: Severity,
    pub subject: String,
    pub message: String,
}

/// What the generated SQL must carry
#[derive(Debug, Clone, Copy, Default)]
pub struct Expectations<'a> {
    pub filters: &'a [ResidualFilter],
    pub snippets: &'a [&'a Snippet],
    /// When false, snippets are advisory and absence is not reported
    pub snippets_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlValidationResult {
    pub verdict: Verdict,
    pub structural: StructuralReport,
    pub used_snippets: Vec<String>,
    pub missing_snippets: Vec<String>,
    pub applied_filters: Vec<ResidualFilter>,
    pub dropped_filters: Vec<ResidualFilter>,
    pub issues: Vec<GuardIssue>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SqlValidationResult {
    pub fn is_reject(&self) -> bool {
        self.verdict == Verdict::Reject
    }

    /// One line per blocking problem, for error messages
    pub fn blocking_reasons(&self) -> Vec<String> {
        self.structural
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.kind, e.message))
            .chain(
                self.issues
                    .iter()
                    .filter(|i| i.severity == Severity::Error)
                    .map(|i| i.message.clone()),
            )
            .collect()
    }
}

/// Validate generated SQL structurally and against the filters and snippets it must carry.
pub fn validate_sql(sql: &str, expected: &Expectations<'_>) -> SqlValidationResult {
    let structural = sqlgate_sql::validate(sql);
    let mut issues = Vec::new();
    let mut applied_filters = Vec::new();
    let mut dropped_filters = Vec::new();

    for filter in expected.filters {
        if filter_preserved(filter, &structural.all_where_clauses) {
            applied_filters.push(filter.clone());
            continue;
        }
        let (code, severity) = if filter.required {
            (IssueCode::RequiredFilterMissing, Severity::Error)
        } else {
            (IssueCode::OptionalFilterMissing, Severity::Warning)
        };
        warn!(field = %filter.field, required = filter.required, "Filter missing from generated SQL");
        issues.push(GuardIssue {
            code,
            severity,
            subject: filter.field.clone(),
            message: format!(
                "Filter '{}' ({} {}) does not appear in the WHERE clause",
                filter.label(),
                filter.field,
                filter.operator
            ),
        });
        dropped_filters.push(filter.clone());
    }

    let mut used_snippets = Vec::new();
    let mut missing_snippets = Vec::new();
    for snippet in expected.snippets {
        if snippet_present(snippet, sql) {
            used_snippets.push(snippet.template.id.clone());
        } else {
            missing_snippets.push(snippet.template.id.clone());
            if expected.snippets_required {
                issues.push(GuardIssue {
                    code: IssueCode::RequiredSnippetMissing,
                    severity: Severity::Warning,
                    subject: snippet.template.id.clone(),
                    message: format!("Snippet {} is not reflected in the SQL", snippet.template.id),
                });
            }
        }
    }

    let required_filter_missing = issues
        .iter()
        .any(|i| i.code == IssueCode::RequiredFilterMissing);
    let verdict = if !structural.is_valid || required_filter_missing {
        Verdict::Reject
    } else if expected.snippets_required && !missing_snippets.is_empty() {
        Verdict::Clarify
    } else {
        Verdict::Pass
    };

    let warnings = structural
        .warnings
        .iter()
        .map(|w| format!("{}: {}", w.kind, w.message))
        .chain(
            issues
                .iter()
                .filter(|i| i.severity == Severity::Warning)
                .map(|i| i.message.clone()),
        )
        .collect();

    debug!(verdict = %verdict, dropped = dropped_filters.len(), missing_snippets = missing_snippets.len(), "SQL validated");

    SqlValidationResult {
        verdict,
        structural,
        used_snippets,
        missing_snippets,
        applied_filters,
        dropped_filters,
        issues,
        warnings,
    }
}
