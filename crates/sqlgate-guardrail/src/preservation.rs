//! Post-generation checks: did the filters and snippets survive into the SQL?

use crate::filters::ResidualFilter;
use regex::Regex;
use sqlgate_catalog::Snippet;
use std::collections::BTreeSet;

const COMPARISON: &str = r"(?:=|!=|<>|>=|<=|>|<|\bnot\s+in\b|\bin\b|\bnot\s+like\b|\bi?like\b|\bbetween\b|\bis\b)";

/// Spellings under which `field` may appear in SQL, each flagged when it only
/// counts behind a table qualifier
fn field_variants(field: &str) -> BTreeSet<(String, bool)> {
    let field = field.trim().to_lowercase().replace(['"', '[', ']', '`'], "");
    let mut variants = BTreeSet::new();
    if field.is_empty() {
        return variants;
    }

    let column = field.rsplit('.').next().unwrap_or(&field).to_string();
    variants.insert((field.clone(), false));
    variants.insert((column.clone(), false));

    // patient_gender may be spelled p.gender once the table alias carries the prefix
    let parts: Vec<&str> = column.split('_').filter(|p| !p.is_empty()).collect();
    for start in 1..parts.len() {
        let suffix = parts[start..].join("_");
        if suffix.len() >= 4 {
            variants.insert((suffix, true));
        }
    }
    variants
}

fn variant_pattern(variant: &str, qualified: bool) -> Option<Regex> {
    let name = variant
        .split('.')
        .map(|segment| format!(r#"["\[`]?{}["\]`]?"#, regex::escape(segment)))
        .collect::<Vec<_>>()
        .join(r"\.");
    let qualifiers = if qualified { "+" } else { "*" };
    let column = format!(r#"(?:[\w"\[\]`]+\.){qualifiers}{name}"#);
    let pattern = format!(
        r"(?i)(?:^|[^\w.]){column}\s*{COMPARISON}|{COMPARISON}\s*(?:[\w]+\()?\s*{column}(?:$|[^\w.])"
    );
    Regex::new(&pattern).ok()
}

/// Whether `field` appears beside a comparison operator in any WHERE clause
pub fn field_in_where(field: &str, where_clauses: &[String]) -> bool {
    field_variants(field)
        .iter()
        .filter_map(|(v, qualified)| variant_pattern(v, *qualified))
        .any(|re| where_clauses.iter().any(|clause| re.is_match(clause)))
}

pub fn filter_preserved(filter: &ResidualFilter, where_clauses: &[String]) -> bool {
    field_in_where(&filter.field, where_clauses)
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let pattern = format!(r"(?i)(?:^|[^\w]){}(?:$|[^\w])", regex::escape(word));
    Regex::new(&pattern).is_ok_and(|re| re.is_match(haystack))
}

/// A snippet counts as used when one of its outputs appears in the SQL, or at
/// least half of its keyword vocabulary does
pub fn snippet_present(snippet: &Snippet, sql: &str) -> bool {
    if snippet.outputs.iter().any(|o| contains_word(sql, o)) {
        return true;
    }
    let keywords = &snippet.template.keywords;
    if keywords.is_empty() {
        return false;
    }
    let matched = keywords.iter().filter(|k| contains_word(sql, k)).count();
    matched * 2 >= keywords.len()
}
