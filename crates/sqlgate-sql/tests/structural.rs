//! GROUP BY / ORDER BY / aggregate rules exercised through `validate`

use proptest::prelude::*;
use proptest::sample::{select, subsequence, Index};
use sqlgate_sql::{validate, IssueKind};

const COLUMNS: &[&str] = &["region", "category", "status", "tier", "clinic", "wound_type"];

fn error_kinds(sql: &str) -> Vec<IssueKind> {
    validate(sql).errors.iter().map(|e| e.kind).collect()
}

#[test]
fn test_ordinal_positions_are_valid() {
    assert!(error_kinds("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY 1").is_empty());
    assert!(error_kinds("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY 2 DESC").is_empty());
}

#[test]
fn test_ordinal_out_of_range_only_warns() {
    let report = validate("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY 3");
    assert!(report.is_valid);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == IssueKind::OrdinalOutOfRange));
}

#[test]
fn test_bare_column_grouped_and_ungrouped() {
    assert!(error_kinds("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY region").is_empty());
    assert_eq!(
        error_kinds("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY status"),
        vec![IssueKind::GroupByViolation]
    );
}

#[test]
fn test_qualified_and_unqualified_columns_match() {
    assert!(error_kinds("SELECT t.region, COUNT(*) FROM t GROUP BY t.region ORDER BY region").is_empty());
    assert!(error_kinds("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY t.region").is_empty());
    assert!(error_kinds("SELECT \"Region\", COUNT(*) FROM t GROUP BY \"Region\" ORDER BY [region]").is_empty());
}

#[test]
fn test_alias_rules() {
    assert!(error_kinds("SELECT region, COUNT(*) AS n FROM t GROUP BY region ORDER BY n DESC").is_empty());
    assert!(error_kinds("SELECT region AS r, COUNT(*) FROM t GROUP BY region ORDER BY r").is_empty());
    assert_eq!(
        error_kinds("SELECT region, updated_at AS u, COUNT(*) FROM t GROUP BY region ORDER BY u"),
        vec![IssueKind::OrderByViolation]
    );
}

#[test]
fn test_group_by_alias_and_position() {
    assert!(error_kinds(
        "SELECT date_trunc('month', created_at) AS month_start, COUNT(*) FROM t GROUP BY month_start ORDER BY month_start"
    )
    .is_empty());
    assert!(error_kinds("SELECT region, COUNT(*) FROM t GROUP BY 1 ORDER BY region").is_empty());
}

#[test]
fn test_compound_expressions() {
    assert!(error_kinds(
        "SELECT region, tier, COUNT(*) FROM t GROUP BY region, tier ORDER BY region || '-' || tier"
    )
    .is_empty());
    assert!(error_kinds("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY COUNT(*) DESC").is_empty());
    assert!(error_kinds(
        "SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY SUM(amount) / COUNT(*) DESC"
    )
    .is_empty());
    assert_eq!(
        error_kinds("SELECT region, COUNT(*) FROM t GROUP BY region ORDER BY COALESCE(score, 0) + 1"),
        vec![IssueKind::OrderByViolation]
    );
}

#[test]
fn test_no_group_by_means_no_ordering_rules() {
    assert!(error_kinds("SELECT region, status FROM t ORDER BY updated_at DESC").is_empty());
}

#[test]
fn test_select_list_warning_does_not_invalidate() {
    let report = validate("SELECT region, status, COUNT(*) FROM t GROUP BY region");
    assert!(report.is_valid);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == IssueKind::SelectNotGrouped));
}

#[test]
fn test_order_by_uses_final_select_only() {
    let sql = "WITH ranked AS (SELECT region, updated_at FROM t ORDER BY updated_at) \
               SELECT region, COUNT(*) FROM ranked GROUP BY region ORDER BY region";
    assert!(error_kinds(sql).is_empty());
}

proptest! {
    #[test]
    fn prop_order_by_grouped_columns_or_aggregate_alias_is_valid(
        grouped in subsequence(COLUMNS.to_vec(), 1..=COLUMNS.len()),
        picks in proptest::collection::vec(any::<Index>(), 1..4),
        with_alias in any::<bool>(),
        desc in any::<bool>(),
    ) {
        let group_list = grouped.join(", ");
        let mut order: Vec<String> = picks.iter().map(|ix| ix.get(&grouped).to_string()).collect();
        if with_alias {
            order.push("total".to_string());
        }
        let direction = if desc { " DESC" } else { "" };
        let order_list = order
            .iter()
            .map(|o| format!("{o}{direction}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {group_list}, COUNT(*) AS total FROM t GROUP BY {group_list} ORDER BY {order_list}"
        );
        let report = validate(&sql);
        prop_assert!(report.errors.is_empty(), "{}: {:?}", sql, report.errors);
    }

    #[test]
    fn prop_ungrouped_order_column_yields_exactly_one_violation(
        grouped in subsequence(COLUMNS.to_vec(), 1..COLUMNS.len()),
        extra in "[a-z]{3,8}_at",
    ) {
        let group_list = grouped.join(", ");
        let sql = format!(
            "SELECT {group_list}, COUNT(*) AS total FROM t GROUP BY {group_list} ORDER BY {extra}"
        );
        let kinds = error_kinds(&sql);
        prop_assert_eq!(kinds.len(), 1, "{}", sql);
        prop_assert!(matches!(kinds[0], IssueKind::GroupByViolation | IssueKind::OrderByViolation));
    }

    #[test]
    fn prop_nested_aggregate_always_flagged(
        outer in select(vec!["COUNT", "SUM", "AVG", "max"]),
        inner in select(vec!["MAX", "min", "SUM", "AVG", "COUNT"]),
        grouped in any::<bool>(),
    ) {
        let sql = if grouped {
            format!("SELECT region, {outer}({inner}(x)) FROM t GROUP BY region")
        } else {
            format!("SELECT {outer}({inner}(x)) FROM t")
        };
        let kinds = error_kinds(&sql);
        prop_assert_eq!(kinds, vec![IssueKind::AggregateViolation]);
    }
}
