//! Clause splitting and item parsing for the final top-level SELECT

use serde::{Deserialize, Serialize};

use crate::lexer::{Token, TokenKind};

/// Aggregate function names recognised when followed by `(`
pub const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "median", "mode", "stddev", "stddev_pop",
    "stddev_samp", "variance", "var_pop", "var_samp", "array_agg", "string_agg",
    "group_concat", "listagg", "list", "percentile_cont", "percentile_disc", "bool_and",
    "bool_or", "every", "count_if", "approx_count_distinct", "any_value", "arg_max",
    "arg_min", "corr", "covar_pop", "covar_samp", "json_agg", "jsonb_agg",
];

/// Words that never name a column or an alias
const RESERVED: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "as", "case", "when", "then", "else",
    "end", "in", "is", "null", "like", "ilike", "between", "on", "join", "group", "by",
    "order", "having", "limit", "offset", "distinct", "asc", "desc", "union", "all",
    "intersect", "except", "over", "partition", "true", "false", "interval", "filter",
    "within", "nulls", "first", "last", "collate", "cast", "exists", "any", "some",
    "escape", "similar", "to", "rows", "range", "preceding", "following", "current",
    "row", "unbounded", "year", "month", "day", "hour", "minute", "second", "week",
    "quarter", "epoch", "dow", "doy", "date", "timestamp", "time", "with", "recursive",
    "fetch", "qualify", "window", "left", "right", "inner", "outer", "full", "cross",
    "using", "lateral", "top",
];

/// Words that may precede an implicit alias even though they are reserved
const VALUE_WORDS: &[&str] = &["end", "null", "true", "false"];

pub fn is_aggregate_name(word: &str) -> bool {
    AGGREGATE_FUNCTIONS
        .iter()
        .any(|name| name.eq_ignore_ascii_case(word))
}

pub fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}

/// A possibly qualified column reference, lower-cased and unquoted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnRef {
    /// Same column when names agree and qualifiers agree or either is absent
    pub fn matches(&self, other: &ColumnRef) -> bool {
        self.name == other.name
            && match (&self.qualifier, &other.qualifier) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}.{}", q, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasKind {
    Explicit,
    Implicit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectItem {
    pub expression: String,
    pub normalized: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_kind: Option<AliasKind>,
    pub is_aggregate: bool,
    /// Window functions and scalar subqueries; grouping cannot be judged
    pub is_opaque: bool,
    pub is_wildcard: bool,
    #[serde(skip)]
    pub tokens: Vec<Token>,
}

impl SelectItem {
    /// Column when the expression is a bare (possibly qualified) identifier
    pub fn column(&self) -> Option<ColumnRef> {
        column_ref(&self.tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupByItem {
    pub expression: String,
    pub normalized: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<ColumnRef>,
    #[serde(skip)]
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderByKind {
    Ordinal { position: usize },
    Alias { name: String },
    Column { column: ColumnRef },
    Expression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderByItem {
    pub expression: String,
    pub normalized: String,
    pub kind: OrderByKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<SortDirection>,
    #[serde(skip)]
    pub tokens: Vec<Token>,
}

/// The final top-level SELECT split into its clauses
#[derive(Debug, Clone, Default)]
pub struct SelectStatement {
    pub cte_names: Vec<String>,
    pub distinct: bool,
    pub select_items: Vec<SelectItem>,
    pub where_clause: Option<String>,
    pub group_by: Vec<GroupByItem>,
    pub having: Option<String>,
    pub order_by: Vec<OrderByItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Other,
}

/// Parse the last SELECT at the shallowest depth. `None` when there is no SELECT.
pub fn parse_final_select(sql: &str, tokens: &[Token]) -> Option<SelectStatement> {
    let base = tokens
        .iter()
        .filter(|t| t.is_keyword("select"))
        .map(|t| t.depth)
        .min()?;
    let select_idx = tokens
        .iter()
        .rposition(|t| t.is_keyword("select") && t.depth == base)?;

    let mut statement = SelectStatement {
        cte_names: cte_names(&tokens[..select_idx], base),
        ..Default::default()
    };

    // Clause boundaries at the base depth
    let mut sections: Vec<(Clause, usize, usize)> = Vec::new();
    let mut current = Clause::Select;
    let mut section_start = select_idx + 1;
    let mut seen_from = false;
    let mut i = select_idx + 1;
    let mut stop = tokens.len();

    while i < tokens.len() {
        let token = &tokens[i];
        if token.depth < base || token.kind == TokenKind::Semicolon && token.depth == base {
            stop = i;
            break;
        }
        if token.depth == base && token.kind == TokenKind::Word {
            let next_is_by = tokens.get(i + 1).is_some_and(|t| t.is_keyword("by"));
            let (clause, width) = match token.text.to_ascii_lowercase().as_str() {
                "from" if !seen_from => (Some(Clause::From), 1),
                "where" => (Some(Clause::Where), 1),
                "group" if next_is_by => (Some(Clause::GroupBy), 2),
                "having" => (Some(Clause::Having), 1),
                "order" if next_is_by => (Some(Clause::OrderBy), 2),
                "limit" | "offset" | "fetch" | "qualify" | "window" => (Some(Clause::Other), 1),
                "union" | "intersect" | "except" => {
                    stop = i;
                    break;
                }
                _ => (None, 0),
            };
            if let Some(clause) = clause {
                sections.push((current, section_start, i));
                if clause == Clause::From {
                    seen_from = true;
                }
                current = clause;
                section_start = i + width;
                i += width;
                continue;
            }
        }
        i += 1;
    }
    sections.push((current, section_start, stop));

    for (clause, start, end) in sections {
        let body = &tokens[start.min(end)..end];
        match clause {
            Clause::Select => {
                let (distinct, items) = strip_select_modifiers(body);
                statement.distinct = distinct;
                statement.select_items = split_items(items, base)
                    .into_iter()
                    .map(|item| parse_select_item(sql, item))
                    .collect();
            }
            Clause::Where => statement.where_clause = span_text(sql, body),
            Clause::Having => statement.having = span_text(sql, body),
            Clause::GroupBy => {
                statement.group_by = split_items(body, base)
                    .into_iter()
                    .filter(|item| !item.is_empty())
                    .map(|item| GroupByItem {
                        expression: span_text(sql, item).unwrap_or_default(),
                        normalized: normalize(item),
                        column: column_ref(item),
                        tokens: item.to_vec(),
                    })
                    .collect();
            }
            Clause::OrderBy => {
                statement.order_by = split_items(body, base)
                    .into_iter()
                    .filter(|item| !item.is_empty())
                    .map(|item| parse_order_item(sql, item, &statement.select_items))
                    .collect();
            }
            Clause::From | Clause::Other => {}
        }
    }

    Some(statement)
}

/// Text of every WHERE clause at any depth, CTE bodies and subqueries included
pub fn all_where_clauses(sql: &str, tokens: &[Token]) -> Vec<String> {
    let mut clauses = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if !token.is_keyword("where") {
            continue;
        }
        let depth = token.depth;
        let mut end = tokens.len();
        for (j, next) in tokens.iter().enumerate().skip(idx + 1) {
            let terminates = next.depth < depth
                || (next.depth == depth
                    && (next.kind == TokenKind::Semicolon
                        || ["group", "order", "having", "limit", "offset", "union",
                            "intersect", "except", "qualify", "window", "fetch"]
                            .iter()
                            .any(|kw| next.is_keyword(kw))));
            if terminates {
                end = j;
                break;
            }
        }
        if let Some(text) = span_text(sql, &tokens[idx + 1..end]) {
            clauses.push(text);
        }
    }
    clauses
}

fn cte_names(prefix: &[Token], base: usize) -> Vec<String> {
    let mut names = Vec::new();
    let Some(with_idx) = prefix
        .iter()
        .position(|t| t.is_keyword("with") && t.depth == base)
    else {
        return names;
    };

    let mut expect_name = true;
    for token in &prefix[with_idx + 1..] {
        if token.depth != base {
            continue;
        }
        if token.kind == TokenKind::Comma {
            expect_name = true;
        } else if expect_name && token.is_identifier_like() && !token.is_keyword("recursive") {
            names.push(token.ident().to_lowercase());
            expect_name = false;
        }
    }
    names
}

fn strip_select_modifiers(tokens: &[Token]) -> (bool, &[Token]) {
    let mut rest = tokens;
    let mut distinct = false;
    loop {
        match rest.first() {
            Some(t) if t.is_keyword("distinct") => {
                distinct = true;
                rest = &rest[1..];
                if rest.first().is_some_and(|t| t.is_keyword("on")) {
                    rest = skip_parenthesized(&rest[1..]);
                }
            }
            Some(t) if t.is_keyword("all") => rest = &rest[1..],
            Some(t) if t.is_keyword("top") => {
                rest = &rest[1..];
                if rest.first().is_some_and(|t| t.kind == TokenKind::LParen) {
                    rest = skip_parenthesized(rest);
                } else if !rest.is_empty() {
                    rest = &rest[1..];
                }
            }
            _ => return (distinct, rest),
        }
    }
}

fn skip_parenthesized(tokens: &[Token]) -> &[Token] {
    match tokens.first() {
        Some(open) if open.kind == TokenKind::LParen => {
            let depth = open.depth;
            let close = tokens
                .iter()
                .skip(1)
                .position(|t| t.kind == TokenKind::RParen && t.depth == depth)
                .map(|p| p + 2)
                .unwrap_or(tokens.len());
            &tokens[close..]
        }
        _ => tokens,
    }
}

/// Split on commas at `depth`
pub fn split_items(tokens: &[Token], depth: usize) -> Vec<&[Token]> {
    let mut items = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        if token.kind == TokenKind::Comma && token.depth == depth {
            items.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    if start < tokens.len() {
        items.push(&tokens[start..]);
    }
    items
}

fn span_text(sql: &str, tokens: &[Token]) -> Option<String> {
    let first = tokens.first()?;
    let last = tokens.last()?;
    Some(sql[first.start..last.end].trim().to_string())
}

fn parse_select_item(sql: &str, tokens: &[Token]) -> SelectItem {
    let len = tokens.len();
    let (expr, alias, alias_kind) = if len >= 3
        && tokens[len - 2].is_keyword("as")
        && tokens[len - 1].is_identifier_like()
    {
        (
            &tokens[..len - 2],
            Some(tokens[len - 1].ident()),
            Some(AliasKind::Explicit),
        )
    } else if len >= 2 && is_implicit_alias(&tokens[len - 2], &tokens[len - 1]) {
        (
            &tokens[..len - 1],
            Some(tokens[len - 1].ident()),
            Some(AliasKind::Implicit),
        )
    } else {
        (tokens, None, None)
    };

    let is_wildcard = expr.last().is_some_and(|t| t.kind == TokenKind::Star)
        && expr
            .iter()
            .all(|t| matches!(t.kind, TokenKind::Star | TokenKind::Dot) || t.is_identifier_like());

    SelectItem {
        expression: span_text(sql, expr).unwrap_or_default(),
        normalized: normalize(expr),
        alias,
        alias_kind,
        is_aggregate: contains_aggregate(expr),
        is_opaque: expr
            .iter()
            .any(|t| t.is_keyword("over") || t.is_keyword("select")),
        is_wildcard,
        tokens: expr.to_vec(),
    }
}

fn is_implicit_alias(prev: &Token, last: &Token) -> bool {
    let last_ok = match last.kind {
        TokenKind::QuotedIdent => true,
        TokenKind::Word => !is_reserved(&last.text),
        _ => false,
    };
    let prev_ok = match prev.kind {
        TokenKind::RParen | TokenKind::QuotedIdent | TokenKind::Number | TokenKind::StringLit => true,
        TokenKind::Word => {
            !is_reserved(&prev.text)
                || VALUE_WORDS.iter().any(|w| prev.text.eq_ignore_ascii_case(w))
        }
        _ => false,
    };
    last_ok && prev_ok
}

fn parse_order_item(sql: &str, tokens: &[Token], select_items: &[SelectItem]) -> OrderByItem {
    let mut expr = tokens;
    let mut direction = None;

    if expr.len() >= 2
        && expr[expr.len() - 2].is_keyword("nulls")
        && (expr[expr.len() - 1].is_keyword("first") || expr[expr.len() - 1].is_keyword("last"))
    {
        expr = &expr[..expr.len() - 2];
    }
    match expr.last() {
        Some(t) if t.is_keyword("asc") => {
            direction = Some(SortDirection::Asc);
            expr = &expr[..expr.len() - 1];
        }
        Some(t) if t.is_keyword("desc") => {
            direction = Some(SortDirection::Desc);
            expr = &expr[..expr.len() - 1];
        }
        _ => {}
    }

    let kind = if let [single] = expr {
        if single.kind == TokenKind::Number {
            match single.text.parse::<usize>() {
                Ok(position) => OrderByKind::Ordinal { position },
                Err(_) => OrderByKind::Expression,
            }
        } else if single.is_identifier_like() && select_alias(select_items, &single.ident()).is_some() {
            OrderByKind::Alias {
                name: single.ident(),
            }
        } else {
            column_ref(expr)
                .map(|column| OrderByKind::Column { column })
                .unwrap_or(OrderByKind::Expression)
        }
    } else {
        column_ref(expr)
            .map(|column| OrderByKind::Column { column })
            .unwrap_or(OrderByKind::Expression)
    };

    OrderByItem {
        expression: span_text(sql, expr).unwrap_or_default(),
        normalized: normalize(expr),
        kind,
        direction,
        tokens: expr.to_vec(),
    }
}

/// Select item whose alias equals `name` (case-insensitive)
pub fn select_alias<'a>(items: &'a [SelectItem], name: &str) -> Option<&'a SelectItem> {
    items.iter().find(|item| {
        item.alias
            .as_deref()
            .is_some_and(|alias| alias.eq_ignore_ascii_case(name))
    })
}

/// `name`, `t.name` or `schema.t.name`
pub fn column_ref(tokens: &[Token]) -> Option<ColumnRef> {
    let mut parts = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let expect_ident = i % 2 == 0;
        if expect_ident {
            if token.kind == TokenKind::QuotedIdent
                || (token.kind == TokenKind::Word && !is_reserved(&token.text))
            {
                parts.push(token.ident().to_lowercase());
            } else {
                return None;
            }
        } else if token.kind != TokenKind::Dot {
            return None;
        }
    }
    if parts.is_empty() || tokens.len() % 2 == 0 {
        return None;
    }
    let name = parts.pop()?;
    Some(ColumnRef {
        qualifier: parts.pop(),
        name,
    })
}

/// True when an aggregate call appears outside any nested SELECT
pub fn contains_aggregate(tokens: &[Token]) -> bool {
    let subquery_depth = tokens
        .iter()
        .filter(|t| t.is_keyword("select"))
        .map(|t| t.depth)
        .min();
    tokens.windows(2).any(|pair| {
        pair[0].kind == TokenKind::Word
            && is_aggregate_name(&pair[0].text)
            && pair[1].kind == TokenKind::LParen
            && subquery_depth.map_or(true, |d| pair[0].depth < d)
    })
}

/// Comparison form of an expression: lower-cased, unquoted, whitespace
/// collapsed and redundant outer parentheses removed.
pub fn normalize(tokens: &[Token]) -> String {
    let mut tokens = tokens;
    while tokens.len() >= 2
        && tokens[0].kind == TokenKind::LParen
        && tokens[tokens.len() - 1].kind == TokenKind::RParen
        && tokens[1..tokens.len() - 1]
            .iter()
            .all(|t| t.depth > tokens[0].depth)
    {
        tokens = &tokens[1..tokens.len() - 1];
    }

    let mut out = String::new();
    let mut prev_wordlike = false;
    for token in tokens {
        let (piece, wordlike) = match token.kind {
            TokenKind::Word => (token.text.to_lowercase(), true),
            TokenKind::QuotedIdent => (token.ident().to_lowercase(), true),
            TokenKind::Number => (token.text.to_lowercase(), true),
            TokenKind::StringLit => (token.text.clone(), true),
            _ => (token.text.clone(), false),
        };
        if prev_wordlike && wordlike {
            out.push(' ');
        }
        out.push_str(&piece);
        prev_wordlike = wordlike;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse(sql: &str) -> SelectStatement {
        let lexed = tokenize(sql);
        parse_final_select(sql, &lexed.tokens).unwrap()
    }

    #[test]
    fn test_clause_split() {
        let stmt = parse(
            "SELECT category, COUNT(*) AS n FROM t WHERE x > 1 GROUP BY category HAVING COUNT(*) > 2 ORDER BY n DESC LIMIT 5",
        );
        assert_eq!(stmt.select_items.len(), 2);
        assert_eq!(stmt.where_clause.as_deref(), Some("x > 1"));
        assert_eq!(stmt.group_by.len(), 1);
        assert_eq!(stmt.having.as_deref(), Some("COUNT(*) > 2"));
        assert_eq!(stmt.order_by.len(), 1);
        assert_eq!(stmt.order_by[0].direction, Some(SortDirection::Desc));
        assert_eq!(
            stmt.order_by[0].kind,
            OrderByKind::Alias {
                name: "n".to_string()
            }
        );
    }

    #[test]
    fn test_final_select_after_ctes() {
        let stmt = parse(
            "WITH a AS (SELECT x FROM t WHERE y = 1), \"B\" (c) AS (SELECT c FROM a) SELECT c FROM b ORDER BY c",
        );
        assert_eq!(stmt.cte_names, vec!["a".to_string(), "b".to_string()]);
        assert!(stmt.where_clause.is_none());
        assert_eq!(stmt.select_items[0].expression, "c");
    }

    #[test]
    fn test_aliases() {
        let stmt = parse("SELECT COUNT(*) total, t.name, 'x' label, a + b AS s FROM t");
        let aliases: Vec<_> = stmt
            .select_items
            .iter()
            .map(|i| (i.alias.clone(), i.alias_kind))
            .collect();
        assert_eq!(
            aliases,
            vec![
                (Some("total".to_string()), Some(AliasKind::Implicit)),
                (None, None),
                (Some("label".to_string()), Some(AliasKind::Implicit)),
                (Some("s".to_string()), Some(AliasKind::Explicit)),
            ]
        );
        assert!(stmt.select_items[0].is_aggregate);
        assert!(!stmt.select_items[1].is_aggregate);
    }

    #[test]
    fn test_case_end_implicit_alias() {
        let stmt = parse("SELECT CASE WHEN age < 18 THEN 'child' ELSE 'adult' END age_group FROM p");
        assert_eq!(stmt.select_items[0].alias.as_deref(), Some("age_group"));
    }

    #[test]
    fn test_normalize_collapses_whitespace_quotes_and_parens() {
        let a = tokenize("(\"Category\"  )");
        let b = tokenize("category");
        assert_eq!(normalize(&a.tokens), normalize(&b.tokens));

        let c = tokenize("CASE  WHEN age<18 THEN 'child' END");
        let d = tokenize("case when age < 18 then 'child' end");
        assert_eq!(normalize(&c.tokens), normalize(&d.tokens));
    }

    #[test]
    fn test_order_by_kinds() {
        let stmt = parse("SELECT a, b AS bee FROM t ORDER BY 1, bee ASC, t.a DESC NULLS LAST, a + 1");
        let kinds: Vec<_> = stmt.order_by.iter().map(|o| o.kind.clone()).collect();
        assert_eq!(kinds[0], OrderByKind::Ordinal { position: 1 });
        assert_eq!(
            kinds[1],
            OrderByKind::Alias {
                name: "bee".to_string()
            }
        );
        assert_eq!(
            kinds[2],
            OrderByKind::Column {
                column: ColumnRef {
                    qualifier: Some("t".to_string()),
                    name: "a".to_string()
                }
            }
        );
        assert_eq!(kinds[3], OrderByKind::Expression);
    }

    #[test]
    fn test_keywords_in_function_args_do_not_split() {
        let stmt = parse("SELECT EXTRACT(YEAR FROM created_at) y FROM t WHERE a IS DISTINCT FROM b");
        assert_eq!(stmt.select_items.len(), 1);
        assert_eq!(stmt.where_clause.as_deref(), Some("a IS DISTINCT FROM b"));
    }

    #[test]
    fn test_all_where_clauses() {
        let sql = "WITH base AS (SELECT * FROM t WHERE tier = 'VIP' GROUP BY 1) SELECT * FROM base WHERE x = 1";
        let lexed = tokenize(sql);
        let clauses = all_where_clauses(sql, &lexed.tokens);
        assert_eq!(clauses, vec!["tier = 'VIP'".to_string(), "x = 1".to_string()]);
    }
}
