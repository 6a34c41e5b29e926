//! Grouping, ordering and aggregate-nesting rules

use std::collections::HashSet;

use crate::lexer::{Token, TokenKind};
use crate::statement::{
    is_aggregate_name, is_reserved, select_alias, ColumnRef, OrderByKind, SelectItem,
    SelectStatement,
};
use crate::{IssueKind, StructuralIssue};

/// What the GROUP BY clause makes available to SELECT and ORDER BY
#[derive(Debug, Default)]
pub struct Grouping {
    expressions: HashSet<String>,
    columns: Vec<ColumnRef>,
    aliases: HashSet<String>,
}

impl Grouping {
    pub fn from_statement(statement: &SelectStatement) -> Self {
        let mut grouping = Grouping::default();
        for item in &statement.group_by {
            grouping.expressions.insert(item.normalized.clone());
            if let Some(column) = &item.column {
                grouping.columns.push(column.clone());
            }

            // GROUP BY 2
            if let [single] = item.tokens.as_slice() {
                if single.kind == TokenKind::Number {
                    if let Some(selected) = single
                        .text
                        .parse::<usize>()
                        .ok()
                        .and_then(|p| p.checked_sub(1))
                        .and_then(|i| statement.select_items.get(i))
                    {
                        grouping.add_select_item(selected);
                    }
                    continue;
                }
            }

            // GROUP BY an output alias
            if let Some(column) = &item.column {
                if column.qualifier.is_none() {
                    if let Some(selected) = select_alias(&statement.select_items, &column.name) {
                        grouping.add_select_item(selected);
                    }
                }
            }
        }
        grouping
    }

    fn add_select_item(&mut self, item: &SelectItem) {
        self.expressions.insert(item.normalized.clone());
        if let Some(column) = item.column() {
            self.columns.push(column);
        }
        if let Some(alias) = &item.alias {
            self.aliases.insert(alias.to_lowercase());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn contains_expression(&self, normalized: &str) -> bool {
        self.expressions.contains(normalized)
    }

    /// Exact match, or match by unqualified name
    pub fn contains_column(&self, column: &ColumnRef) -> bool {
        self.expressions.contains(&column.to_string())
            || self.columns.iter().any(|grouped| grouped.matches(column))
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.aliases.contains(&alias.to_lowercase())
    }
}

/// Identifiers referenced outside aggregate calls. Function names, keywords
/// and cast target types are skipped.
pub fn free_identifiers(tokens: &[Token]) -> Vec<ColumnRef> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        let next = tokens.get(i + 1);
        let prev = i.checked_sub(1).map(|p| &tokens[p]);

        if token.kind == TokenKind::Word && next.is_some_and(|n| n.kind == TokenKind::LParen) {
            if is_aggregate_name(&token.text) {
                // Skip the whole call
                let depth = token.depth;
                let close = tokens[i + 2..]
                    .iter()
                    .position(|t| t.kind == TokenKind::RParen && t.depth == depth)
                    .map(|p| p + i + 2)
                    .unwrap_or(tokens.len());
                i = close + 1;
            } else {
                i += 1;
            }
            continue;
        }

        let is_cast_target = prev.is_some_and(|p| {
            (p.kind == TokenKind::Operator && p.text == "::") || p.is_keyword("as")
        });
        let is_ident = token.kind == TokenKind::QuotedIdent
            || (token.kind == TokenKind::Word && !is_reserved(&token.text));

        if is_ident && !is_cast_target {
            // Fold `a.b.c` into a single reference
            let mut parts = vec![token.ident().to_lowercase()];
            let mut j = i + 1;
            while j + 1 < tokens.len()
                && tokens[j].kind == TokenKind::Dot
                && tokens[j + 1].is_identifier_like()
            {
                parts.push(tokens[j + 1].ident().to_lowercase());
                j += 2;
            }
            if tokens.get(j).is_some_and(|t| t.kind == TokenKind::Dot)
                && tokens.get(j + 1).is_some_and(|t| t.kind == TokenKind::Star)
            {
                j += 2;
            }
            let name = parts.pop().unwrap_or_default();
            found.push(ColumnRef {
                qualifier: parts.pop(),
                name,
            });
            i = j;
            continue;
        }
        i += 1;
    }
    found
}

/// Identifiers in `tokens` that are neither grouped nor an output alias
fn ungrouped_identifiers(tokens: &[Token], grouping: &Grouping) -> Vec<ColumnRef> {
    free_identifiers(tokens)
        .into_iter()
        .filter(|column| {
            !grouping.contains_column(column)
                && !(column.qualifier.is_none() && grouping.contains_alias(&column.name))
        })
        .collect()
}

fn select_item_is_grouped(item: &SelectItem, grouping: &Grouping) -> bool {
    item.is_aggregate
        || item.is_opaque
        || grouping.contains_expression(&item.normalized)
        || item
            .alias
            .as_deref()
            .is_some_and(|alias| grouping.contains_alias(alias))
        || ungrouped_identifiers(&item.tokens, grouping).is_empty()
}

/// ORDER BY legality against GROUP BY. Returns `(errors, warnings)`.
pub fn check_order_by(
    statement: &SelectStatement,
    grouping: &Grouping,
) -> (Vec<StructuralIssue>, Vec<StructuralIssue>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for item in &statement.order_by {
        match &item.kind {
            OrderByKind::Ordinal { position } => {
                if *position == 0 || *position > statement.select_items.len() {
                    warnings.push(StructuralIssue {
                        kind: IssueKind::OrdinalOutOfRange,
                        message: format!(
                            "ORDER BY position {} does not refer to a SELECT item ({} selected)",
                            position,
                            statement.select_items.len()
                        ),
                        expression: Some(item.expression.clone()),
                        suggestion: Some("Use a position between 1 and the number of selected columns".to_string()),
                    });
                }
            }
            OrderByKind::Alias { name } => {
                let Some(selected) = select_alias(&statement.select_items, name) else {
                    continue;
                };
                if !select_item_is_grouped(selected, grouping) {
                    errors.push(StructuralIssue {
                        kind: IssueKind::OrderByViolation,
                        message: format!(
                            "ORDER BY alias '{}' refers to '{}', which is neither an aggregate nor part of GROUP BY",
                            name, selected.expression
                        ),
                        expression: Some(item.expression.clone()),
                        suggestion: Some(format!(
                            "Add '{}' to GROUP BY or order by an aggregate of it",
                            selected.expression
                        )),
                    });
                }
            }
            OrderByKind::Column { column } => {
                let output_alias = column.qualifier.is_none()
                    && select_alias(&statement.select_items, &column.name).is_some();
                if !output_alias && !grouping.contains_column(column) {
                    errors.push(StructuralIssue {
                        kind: IssueKind::GroupByViolation,
                        message: format!(
                            "Column '{}' in ORDER BY must appear in GROUP BY or be used in an aggregate function",
                            item.expression
                        ),
                        expression: Some(item.expression.clone()),
                        suggestion: Some(format!(
                            "Add '{0}' to GROUP BY, wrap it in an aggregate such as MAX({0}), or remove it from ORDER BY",
                            item.expression
                        )),
                    });
                }
            }
            OrderByKind::Expression => {
                if grouping.contains_expression(&item.normalized) {
                    continue;
                }
                let selected_match = statement
                    .select_items
                    .iter()
                    .find(|selected| selected.normalized == item.normalized);
                if selected_match.is_some_and(|s| select_item_is_grouped(s, grouping)) {
                    continue;
                }
                let missing = ungrouped_identifiers(&item.tokens, grouping);
                if !missing.is_empty() {
                    let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
                    errors.push(StructuralIssue {
                        kind: IssueKind::OrderByViolation,
                        message: format!(
                            "ORDER BY expression '{}' references columns not in GROUP BY: {}",
                            item.expression,
                            names.join(", ")
                        ),
                        expression: Some(item.expression.clone()),
                        suggestion: Some(format!(
                            "Group by {} as well, or order by an aggregate or a grouped expression",
                            names.join(", ")
                        )),
                    });
                }
            }
        }
    }

    (errors, warnings)
}

/// SELECT items that are neither aggregated nor grouped. Warnings only.
pub fn check_select_list(statement: &SelectStatement, grouping: &Grouping) -> Vec<StructuralIssue> {
    statement
        .select_items
        .iter()
        .filter(|item| item.is_wildcard || !select_item_is_grouped(item, grouping))
        .map(|item| StructuralIssue {
            kind: IssueKind::SelectNotGrouped,
            message: format!(
                "SELECT item '{}' is neither aggregated nor listed in GROUP BY",
                item.expression
            ),
            expression: Some(item.expression.clone()),
            suggestion: Some("Add it to GROUP BY or wrap it in an aggregate".to_string()),
        })
        .collect()
}

#[derive(Debug)]
struct Frame {
    aggregate: Option<String>,
    /// A SELECT opened inside this paren; aggregates below it start fresh
    subquery: bool,
    nested: Vec<String>,
}

/// Aggregates nested inside another aggregate's arguments.
///
/// A running stack of open parens marks which ones belong to aggregate calls.
/// `SUM(COUNT(*)) OVER (...)` is a window over an aggregate and is allowed.
pub fn check_aggregate_nesting(tokens: &[Token]) -> Vec<StructuralIssue> {
    let mut issues = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut pending: Option<String> = None;

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Word
                if is_aggregate_name(&token.text)
                    && tokens.get(i + 1).is_some_and(|t| t.kind == TokenKind::LParen) =>
            {
                let name = token.text.to_uppercase();
                for frame in stack.iter_mut().rev() {
                    if frame.aggregate.is_some() {
                        frame.nested.push(name.clone());
                        break;
                    }
                    if frame.subquery {
                        break;
                    }
                }
                pending = Some(name);
            }
            TokenKind::Word if token.is_keyword("select") => {
                if let Some(top) = stack.last_mut() {
                    top.subquery = true;
                }
            }
            TokenKind::LParen => stack.push(Frame {
                aggregate: pending.take(),
                subquery: false,
                nested: Vec::new(),
            }),
            TokenKind::RParen => {
                let Some(frame) = stack.pop() else { continue };
                let Some(outer) = frame.aggregate else { continue };
                let windowed = tokens.get(i + 1).is_some_and(|t| t.is_keyword("over"));
                if windowed {
                    continue;
                }
                for inner in frame.nested {
                    issues.push(StructuralIssue {
                        kind: IssueKind::AggregateViolation,
                        message: format!(
                            "Aggregate function {} cannot be nested inside {}",
                            inner, outer
                        ),
                        expression: None,
                        suggestion: Some(
                            "Compute the inner aggregate in a subquery or CTE, then aggregate its result"
                                .to_string(),
                        ),
                    });
                }
            }
            _ => {}
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    #[test]
    fn test_free_identifiers_skip_aggregates_and_functions() {
        let lexed = tokenize("COALESCE(a, 0) + SUM(b) + t.c::int");
        let names: Vec<String> = free_identifiers(&lexed.tokens)
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(names, vec!["a".to_string(), "t.c".to_string()]);
    }

    #[test]
    fn test_nested_aggregate_detected() {
        let lexed = tokenize("SELECT COUNT(MAX(x)) FROM t");
        let issues = check_aggregate_nesting(&lexed.tokens);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::AggregateViolation);
        assert!(issues[0].message.contains("MAX"));
    }

    #[test]
    fn test_nested_through_plain_parens() {
        let lexed = tokenize("SELECT SUM(ROUND(AVG(x), 2)) FROM t");
        assert_eq!(check_aggregate_nesting(&lexed.tokens).len(), 1);
    }

    #[test]
    fn test_window_over_aggregate_allowed() {
        let lexed = tokenize("SELECT g, SUM(COUNT(*)) OVER () FROM t GROUP BY g");
        assert!(check_aggregate_nesting(&lexed.tokens).is_empty());
    }

    #[test]
    fn test_aggregate_in_subquery_argument_allowed() {
        let lexed = tokenize("SELECT SUM((SELECT MAX(x) FROM u)) FROM t");
        assert!(check_aggregate_nesting(&lexed.tokens).is_empty());
    }
}
