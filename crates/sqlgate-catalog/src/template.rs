//! Template and snippet model, placeholder rendering

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RenderError {
    #[error("No value for required placeholder: {0}")]
    MissingValue(String),

    #[error("Invalid value for placeholder {name}: expected {expected}, got {value}")]
    InvalidValue {
        name: String,
        expected: PlaceholderType,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderType {
    Int,
    String,
    Date,
    Boolean,
    Decimal,
    Identifier,
}

impl std::fmt::Display for PlaceholderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlaceholderType::Int => "int",
            PlaceholderType::String => "string",
            PlaceholderType::Date => "date",
            PlaceholderType::Boolean => "boolean",
            PlaceholderType::Decimal => "decimal",
            PlaceholderType::Identifier => "identifier",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PlaceholderType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Draft,
    Approved,
    Deprecated,
}

/// An approved, versioned SQL pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub sql: String,
    #[serde(default)]
    pub placeholders: Vec<Placeholder>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub status: ApprovalStatus,
}

/// Reusable fragment: a template plus the logical names it consumes and produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    #[serde(flatten)]
    pub template: Template,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A catalog record after load-time validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogEntry {
    Template(Template),
    Snippet(Snippet),
}

impl CatalogEntry {
    pub fn template(&self) -> &Template {
        match self {
            CatalogEntry::Template(t) => t,
            CatalogEntry::Snippet(s) => &s.template,
        }
    }

    pub fn as_snippet(&self) -> Option<&Snippet> {
        match self {
            CatalogEntry::Snippet(s) => Some(s),
            CatalogEntry::Template(_) => None,
        }
    }

    pub fn is_snippet(&self) -> bool {
        matches!(self, CatalogEntry::Snippet(_))
    }

    pub fn id(&self) -> &str {
        &self.template().id
    }
}

fn placeholder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").ok())
        .as_ref()
}

fn is_identifier(s: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(s))
}

impl Template {
    /// Placeholder names referenced as `{{name}}` in the SQL
    pub fn referenced_placeholders(&self) -> BTreeSet<String> {
        placeholder_pattern()
            .map(|re| re.captures_iter(&self.sql).map(|c| c[1].to_string()).collect())
            .unwrap_or_default()
    }

    pub fn placeholder(&self, name: &str) -> Option<&Placeholder> {
        self.placeholders.iter().find(|p| p.name == name)
    }

    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }

    /// SHA-256 over the SQL and placeholder declarations. Two records with the
    /// same id and version must agree on it.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sql.as_bytes());
        for p in &self.placeholders {
            hasher.update(b"\0");
            hasher.update(p.name.as_bytes());
            hasher.update(p.kind.to_string().as_bytes());
            hasher.update([p.required as u8]);
            if let Some(default) = &p.default {
                hasher.update(default.to_string().as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Substitute typed placeholder values into the SQL
    pub fn render(&self, values: &BTreeMap<String, Value>) -> Result<String, RenderError> {
        let Some(pattern) = placeholder_pattern() else {
            return Ok(self.sql.clone());
        };
        let mut rendered = String::with_capacity(self.sql.len());
        let mut last = 0;

        for caps in pattern.captures_iter(&self.sql) {
            let Some(whole) = caps.get(0) else { continue };
            let name = &caps[1];
            rendered.push_str(&self.sql[last..whole.start()]);

            let declared = self.placeholder(name);
            let value = values
                .get(name)
                .or_else(|| declared.and_then(|p| p.default.as_ref()));
            let literal = match (declared, value) {
                (Some(p), Some(v)) => render_value(p, v)?,
                (Some(p), None) if !p.required => "NULL".to_string(),
                (Some(_), None) | (None, None) => return Err(RenderError::MissingValue(name.to_string())),
                // Undeclared placeholders are rejected at load time; treat as text
                (None, Some(v)) => quote_string(&value_text(v)),
            };
            rendered.push_str(&literal);
            last = whole.end();
        }
        rendered.push_str(&self.sql[last..]);
        Ok(rendered)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn render_value(placeholder: &Placeholder, value: &Value) -> Result<String, RenderError> {
    let invalid = || RenderError::InvalidValue {
        name: placeholder.name.clone(),
        expected: placeholder.kind,
        value: value.to_string(),
    };

    match placeholder.kind {
        PlaceholderType::Int => match value {
            Value::Number(n) if n.as_i64().is_some() => Ok(n.to_string()),
            Value::String(s) => s.trim().parse::<i64>().map(|n| n.to_string()).map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        PlaceholderType::Decimal => match value {
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|_| trimmed.to_string())
                    .ok_or_else(invalid)
            }
            _ => Err(invalid()),
        },
        PlaceholderType::Date => match value {
            Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(|d| format!("'{}'", d.format("%Y-%m-%d")))
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        PlaceholderType::Boolean => match value {
            Value::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok("TRUE".to_string()),
                "false" | "no" | "0" => Ok("FALSE".to_string()),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        },
        PlaceholderType::String => match value {
            Value::String(s) => Ok(quote_string(s)),
            Value::Number(n) => Ok(quote_string(&n.to_string())),
            _ => Err(invalid()),
        },
        PlaceholderType::Identifier => match value {
            Value::String(s) if is_identifier(s.trim()) => Ok(s.trim().to_string()),
            _ => Err(invalid()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(sql: &str, placeholders: Vec<Placeholder>) -> Template {
        Template {
            id: "t".to_string(),
            name: "t".to_string(),
            version: 1,
            intent: "temporal_proximity_query".to_string(),
            description: None,
            sql: sql.to_string(),
            placeholders,
            keywords: vec![],
            tags: vec![],
            examples: vec![],
            status: ApprovalStatus::Approved,
        }
    }

    fn ph(name: &str, kind: PlaceholderType, required: bool) -> Placeholder {
        Placeholder {
            name: name.to_string(),
            kind,
            required,
            default: None,
            description: None,
        }
    }

    #[test]
    fn test_referenced_placeholders() {
        let t = template("SELECT * FROM {{ table }} WHERE weeks = {{weeks}} AND x = {{weeks}}", vec![]);
        let names: Vec<_> = t.referenced_placeholders().into_iter().collect();
        assert_eq!(names, vec!["table".to_string(), "weeks".to_string()]);
    }

    #[test]
    fn test_render_typed_values() {
        let t = template(
            "SELECT * FROM {{tbl}} WHERE w = {{weeks}} AND r >= {{pct}} AND d > {{since}} AND n = {{name}} AND a = {{active}}",
            vec![
                ph("tbl", PlaceholderType::Identifier, true),
                ph("weeks", PlaceholderType::Int, true),
                ph("pct", PlaceholderType::Decimal, true),
                ph("since", PlaceholderType::Date, true),
                ph("name", PlaceholderType::String, true),
                ph("active", PlaceholderType::Boolean, true),
            ],
        );
        let values = BTreeMap::from([
            ("tbl".to_string(), json!("rpt.assessment")),
            ("weeks".to_string(), json!("12")),
            ("pct".to_string(), json!(0.3)),
            ("since".to_string(), json!("2024-01-05")),
            ("name".to_string(), json!("O'Brien")),
            ("active".to_string(), json!(true)),
        ]);
        let sql = t.render(&values).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM rpt.assessment WHERE w = 12 AND r >= 0.3 AND d > '2024-01-05' AND n = 'O''Brien' AND a = TRUE"
        );
    }

    #[test]
    fn test_render_rejects_bad_values() {
        let t = template(
            "SELECT * FROM {{tbl}} WHERE w = {{weeks}}",
            vec![
                ph("tbl", PlaceholderType::Identifier, true),
                ph("weeks", PlaceholderType::Int, true),
            ],
        );
        let values = BTreeMap::from([
            ("tbl".to_string(), json!("x; DROP TABLE y")),
            ("weeks".to_string(), json!(12)),
        ]);
        assert!(matches!(t.render(&values), Err(RenderError::InvalidValue { .. })));

        let values = BTreeMap::from([("tbl".to_string(), json!("x"))]);
        assert_eq!(t.render(&values), Err(RenderError::MissingValue("weeks".to_string())));
    }

    #[test]
    fn test_optional_and_default_placeholders() {
        let mut limit = ph("limit", PlaceholderType::Int, true);
        limit.default = Some(json!(100));
        let t = template(
            "SELECT * FROM t WHERE c = {{clinic}} LIMIT {{limit}}",
            vec![ph("clinic", PlaceholderType::String, false), limit],
        );
        assert_eq!(t.render(&BTreeMap::new()).unwrap(), "SELECT * FROM t WHERE c = NULL LIMIT 100");
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = template("SELECT 1", vec![]);
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.sql = "SELECT 2".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
