//! sqlgate SQL structural validator
//!
//! A tolerant, grammar-free check of one top-level SELECT (after any CTEs):
//! GROUP BY / ORDER BY legality and aggregate nesting. Input that cannot be
//! tokenized cleanly degrades to "no errors found"; this crate never fails.

pub mod lexer;
pub mod rules;
pub mod statement;

use serde::{Deserialize, Serialize};

pub use lexer::{strip_comments, tokenize, LexState, Lexed, Token, TokenKind};
pub use statement::{
    ColumnRef, GroupByItem, OrderByItem, OrderByKind, SelectItem, SelectStatement, SortDirection,
};

/// Category of a structural finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    GroupByViolation,
    OrderByViolation,
    AggregateViolation,
    SelectNotGrouped,
    OrdinalOutOfRange,
    Unparseable,
}

impl IssueKind {
    pub fn code(&self) -> &'static str {
        match self {
            IssueKind::GroupByViolation => "GROUP_BY_VIOLATION",
            IssueKind::OrderByViolation => "ORDER_BY_VIOLATION",
            IssueKind::AggregateViolation => "AGGREGATE_VIOLATION",
            IssueKind::SelectNotGrouped => "SELECT_NOT_GROUPED",
            IssueKind::OrdinalOutOfRange => "ORDINAL_OUT_OF_RANGE",
            IssueKind::Unparseable => "UNPARSEABLE",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralIssue {
    pub kind: IssueKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Result of structural validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuralReport {
    pub is_valid: bool,
    pub errors: Vec<StructuralIssue>,
    pub warnings: Vec<StructuralIssue>,
    pub cte_names: Vec<String>,
    pub has_where: bool,
    /// WHERE clause of the final SELECT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    /// Every WHERE clause in the statement, CTE bodies included
    #[serde(default)]
    pub all_where_clauses: Vec<String>,
    pub select_items: Vec<SelectItem>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderByItem>,
}

impl StructuralReport {
    fn unparseable(reason: &str) -> Self {
        Self {
            is_valid: true,
            warnings: vec![StructuralIssue {
                kind: IssueKind::Unparseable,
                message: reason.to_string(),
                expression: None,
                suggestion: None,
            }],
            ..Default::default()
        }
    }

    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }
}

/// Validate the final top-level SELECT of `sql`.
pub fn validate(sql: &str) -> StructuralReport {
    let stripped = strip_comments(sql);
    let lexed = tokenize(&stripped);

    if !lexed.is_well_formed() {
        return StructuralReport::unparseable(match lexed.final_state {
            LexState::Normal => "Unbalanced parentheses; structure not checked",
            _ => "Unterminated quoted literal; structure not checked",
        });
    }

    let Some(statement) = statement::parse_final_select(&stripped, &lexed.tokens) else {
        return StructuralReport::unparseable("No SELECT statement found; structure not checked");
    };

    let mut errors = rules::check_aggregate_nesting(&lexed.tokens);
    let mut warnings = Vec::new();

    let grouping = rules::Grouping::from_statement(&statement);
    if !grouping.is_empty() {
        let (order_errors, order_warnings) = rules::check_order_by(&statement, &grouping);
        errors.extend(order_errors);
        warnings.extend(order_warnings);
        warnings.extend(rules::check_select_list(&statement, &grouping));
    }

    StructuralReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        has_where: statement.where_clause.is_some(),
        all_where_clauses: statement::all_where_clauses(&stripped, &lexed.tokens),
        group_by: statement.group_by.iter().map(|g| g.expression.clone()).collect(),
        cte_names: statement.cte_names,
        where_clause: statement.where_clause,
        select_items: statement.select_items,
        order_by: statement.order_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_ordered_by_grouped_column() {
        let report = validate("SELECT category, COUNT(*) FROM t GROUP BY category ORDER BY category");
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_case_grouping_with_ungrouped_order() {
        let sql = "SELECT CASE WHEN age < 18 THEN 'minor' WHEN age < 65 THEN 'adult' ELSE 'senior' END AS age_group, \
                   COUNT(*) AS patients \
                   FROM patient \
                   GROUP BY CASE WHEN age < 18 THEN 'minor' WHEN age < 65 THEN 'adult' ELSE 'senior' END \
                   ORDER BY updated_at";
        let report = validate(sql);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, IssueKind::GroupByViolation);
        assert!(report.errors[0].suggestion.is_some());
    }

    #[test]
    fn test_unparseable_input_has_no_errors() {
        for sql in ["", "not sql at all", "SELECT 'open", "SELECT (a FROM t"] {
            let report = validate(sql);
            assert!(report.is_valid, "{sql}");
            assert!(report.errors.is_empty(), "{sql}");
        }
    }

    #[test]
    fn test_where_and_cte_reported() {
        let report = validate(
            "WITH recent AS (SELECT * FROM visits WHERE visit_date > '2024-01-01') \
             SELECT patient_id FROM recent WHERE status = 'open'",
        );
        assert_eq!(report.cte_names, vec!["recent".to_string()]);
        assert!(report.has_where);
        assert_eq!(report.where_clause.as_deref(), Some("status = 'open'"));
        assert_eq!(report.all_where_clauses.len(), 2);
    }

    #[test]
    fn test_comments_are_ignored() {
        let report = validate(
            "SELECT category, COUNT(*) -- ORDER BY updated_at\nFROM t GROUP BY category /* ORDER BY x */",
        );
        assert!(report.is_valid);
        assert!(report.order_by.is_empty());
    }

    #[test]
    fn test_issue_codes_serialize() {
        let json = serde_json::to_string(&IssueKind::GroupByViolation).unwrap();
        assert_eq!(json, "\"GROUP_BY_VIOLATION\"");
        assert_eq!(IssueKind::AggregateViolation.to_string(), "AGGREGATE_VIOLATION");
    }
}
