//! Database catalog extraction: schema fields for the guardrails and a
//! lexical discovery adapter over table and column names

use async_trait::async_trait;
use duckdb::{Connection, Result as DuckResult};
use serde::{Deserialize, Serialize};
use sqlgate_guardrail::{FieldType, FilterOperator, InMemorySchemaCatalog, ResidualFilter, SchemaField};
use sqlgate_orchestrator::{
    CollaboratorError, ContextBundle, DiscoveryService, FieldCandidate, FormCandidate,
    IntentSummary, JoinPath, Question, TerminologyMapping,
};
use std::sync::Arc;
use strsim::normalized_levenshtein;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Text columns with at most this many distinct values are treated as enums
const LOW_CARDINALITY: usize = 20;
const FIELD_MATCH: f64 = 0.8;
const MAX_FIELDS: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub tables: Vec<TableInfo>,
}

impl DatabaseSchema {
    /// Read every table in the `main` schema
    pub fn from_connection(conn: &Connection) -> DuckResult<Self> {
        let mut stmt = conn.prepare(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'main' ORDER BY table_name",
        )?;
        let table_names: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<DuckResult<Vec<_>>>()?;

        let mut tables = Vec::with_capacity(table_names.len());
        for name in table_names {
            tables.push(Self::extract_table_info(conn, &name)?);
        }
        info!(tables = tables.len(), "Database schema loaded");
        Ok(Self { tables })
    }

    fn extract_table_info(conn: &Connection, table_name: &str) -> DuckResult<TableInfo> {
        let mut stmt = conn.prepare(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = 'main' AND table_name = ? ORDER BY ordinal_position",
        )?;
        let raw: Vec<(String, String)> = stmt
            .query_map([table_name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<DuckResult<Vec<_>>>()?;

        let row_count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote(table_name)), [], |row| row.get(0))?;
        let row_count = usize::try_from(row_count).unwrap_or(0);

        let mut columns = Vec::with_capacity(raw.len());
        for (name, data_type) in raw {
            let (field_type, allowed_values) = classify(conn, table_name, &name, &data_type, row_count)?;
            debug!(table = table_name, column = %name, data_type = %data_type, field_type = %field_type, "Column classified");
            columns.push(ColumnInfo {
                name,
                data_type,
                field_type,
                allowed_values,
            });
        }

        Ok(TableInfo {
            name: table_name.to_string(),
            columns,
            row_count,
        })
    }

    /// Field catalog for the filter guardrails
    pub fn schema_catalog(&self) -> InMemorySchemaCatalog {
        let mut catalog = InMemorySchemaCatalog::default();
        for table in &self.tables {
            for column in &table.columns {
                let mut field = SchemaField::new(&column.name, column.field_type)
                    .with_table(&table.name);
                if let Some(values) = &column.allowed_values {
                    field = field.with_allowed_values(values.iter().cloned());
                }
                catalog.insert(field);
            }
        }
        catalog
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn base_type(data_type: &str) -> FieldType {
    let upper = data_type.trim().to_ascii_uppercase();
    let head = upper.split('(').next().unwrap_or_default().trim();
    match head {
        "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
        | "USMALLINT" | "UINTEGER" | "UBIGINT" | "UHUGEINT" => FieldType::Integer,
        "FLOAT" | "REAL" | "DOUBLE" | "DECIMAL" | "NUMERIC" => FieldType::Decimal,
        "DATE" => FieldType::Date,
        "BOOLEAN" | "BOOL" => FieldType::Boolean,
        "ENUM" => FieldType::Enum,
        h if h.starts_with("TIMESTAMP") => FieldType::Timestamp,
        _ => FieldType::Text,
    }
}

/// Values of an inline `ENUM('a', 'b')` type
pub fn enum_values(data_type: &str) -> Option<Vec<String>> {
    let trimmed = data_type.trim();
    if !trimmed.to_ascii_uppercase().starts_with("ENUM(") {
        return None;
    }
    let inner = trimmed.get(5..trimmed.len().checked_sub(1)?)?;
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, in_quote) {
            ('\'', true) if chars.peek() == Some(&'\'') => {
                current.push('\'');
                chars.next();
            }
            ('\'', true) => {
                values.push(std::mem::take(&mut current));
                in_quote = false;
            }
            ('\'', false) => in_quote = true,
            (c, true) => current.push(c),
            _ => {}
        }
    }
    Some(values)
}

fn classify(
    conn: &Connection,
    table: &str,
    column: &str,
    data_type: &str,
    row_count: usize,
) -> DuckResult<(FieldType, Option<Vec<String>>)> {
    if let Some(values) = enum_values(data_type) {
        return Ok((FieldType::Enum, Some(values)));
    }
    let field_type = base_type(data_type);
    if field_type != FieldType::Text || row_count == 0 {
        return Ok((field_type, None));
    }

    let sql = format!(
        "SELECT DISTINCT CAST({col} AS VARCHAR) FROM {table} WHERE {col} IS NOT NULL ORDER BY 1 LIMIT {limit}",
        col = quote(column),
        table = quote(table),
        limit = LOW_CARDINALITY + 1
    );
    let mut stmt = conn.prepare(&sql)?;
    let values: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<DuckResult<Vec<_>>>()?;

    // Enum-like only when values repeat; identifier columns stay free text
    if !values.is_empty() && values.len() <= LOW_CARDINALITY && values.len() * 2 <= row_count {
        Ok((FieldType::Enum, Some(values)))
    } else {
        Ok((FieldType::Text, None))
    }
}

fn question_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

fn name_score(name: &str, question: &str, tokens: &[String]) -> f64 {
    let lowered = name.to_lowercase();
    if question.contains(&lowered.replace('_', " ")) || tokens.iter().any(|t| *t == lowered) {
        return 1.0;
    }
    let parts: Vec<&str> = lowered.split('_').filter(|p| p.len() >= 3).collect();
    if parts.is_empty() {
        return 0.0;
    }
    let total: f64 = parts
        .iter()
        .map(|part| {
            tokens
                .iter()
                .map(|t| normalized_levenshtein(t, part))
                .fold(0.0, f64::max)
        })
        .sum();
    total / parts.len() as f64
}

/// Stand-in for an external semantic discovery pipeline, matching question
/// words against table names, column names and known column values
pub struct SchemaDiscovery {
    schema: Arc<DatabaseSchema>,
}

impl SchemaDiscovery {
    pub fn new(schema: Arc<DatabaseSchema>) -> Self {
        Self { schema }
    }

    pub fn context_for(&self, question: &Question) -> ContextBundle {
        let text = question.text.to_lowercase();
        let tokens = question_tokens(&question.text);

        let mut fields = Vec::new();
        let mut forms = Vec::new();
        let mut terminology = Vec::new();
        let mut filters = Vec::new();

        for table in &self.schema.tables {
            let mut table_best = name_score(&table.name, &text, &tokens);
            let mut matched = Vec::new();

            for column in &table.columns {
                let score = name_score(&column.name, &text, &tokens);
                if score >= FIELD_MATCH {
                    table_best = table_best.max(score);
                    matched.push(column.name.clone());
                    fields.push(FieldCandidate {
                        name: column.name.clone(),
                        table: Some(table.name.clone()),
                        data_type: Some(column.data_type.clone()),
                        score,
                    });
                }

                for value in column.allowed_values.iter().flatten() {
                    let lowered = value.to_lowercase();
                    if lowered.len() >= 3 && tokens.iter().any(|t| *t == lowered) {
                        terminology.push(TerminologyMapping {
                            term: value.clone(),
                            field: format!("{}.{}", table.name, column.name),
                            value: serde_json::Value::String(value.clone()),
                            confidence: 0.9,
                        });
                        filters.push(
                            ResidualFilter::new(&column.name, FilterOperator::Eq, serde_json::Value::String(value.clone()))
                                .with_original_text(value)
                                .with_confidence(0.9),
                        );
                    }
                }
            }

            if table_best >= FIELD_MATCH {
                forms.push(FormCandidate {
                    name: table.name.clone(),
                    fields: matched,
                    score: table_best,
                });
            }
        }

        fields.sort_by(|a, b| b.score.total_cmp(&a.score));
        fields.truncate(MAX_FIELDS);
        forms.sort_by(|a, b| b.score.total_cmp(&a.score));

        let top: Vec<f64> = fields.iter().take(3).map(|f| f.score).collect();
        let overall_confidence = if top.is_empty() {
            0.0
        } else {
            top.iter().sum::<f64>() / top.len() as f64
        };

        ContextBundle {
            customer_id: question.customer_id.clone(),
            intent: IntentSummary {
                intent_type: "unknown".to_string(),
                filters,
                confidence: overall_confidence,
            },
            join_paths: self.join_paths(&forms),
            forms,
            fields,
            terminology,
            overall_confidence,
        }
    }

    /// Shared `*_id` columns between candidate tables
    fn join_paths(&self, forms: &[FormCandidate]) -> Vec<JoinPath> {
        let tables: Vec<&TableInfo> = forms
            .iter()
            .filter_map(|f| self.schema.tables.iter().find(|t| t.name == f.name))
            .collect();

        let mut paths = Vec::new();
        for (i, left) in tables.iter().enumerate() {
            for right in tables.iter().skip(i + 1) {
                for column in left.columns.iter().filter(|c| c.name.ends_with("_id")) {
                    if right.columns.iter().any(|c| c.name == column.name) {
                        paths.push(JoinPath {
                            from: left.name.clone(),
                            to: right.name.clone(),
                            on: format!("{}.{} = {}.{}", left.name, column.name, right.name, column.name),
                        });
                    }
                }
            }
        }
        paths
    }
}

#[async_trait]
impl DiscoveryService for SchemaDiscovery {
    async fn discover(
        &self,
        question: &Question,
        cancel: &CancellationToken,
    ) -> Result<ContextBundle, CollaboratorError> {
        if cancel.is_cancelled() {
            return Err(CollaboratorError::Cancelled);
        }
        let context = self.context_for(question);
        info!(
            customer_id = %question.customer_id,
            fields = context.fields.len(),
            confidence = context.overall_confidence,
            "Discovery completed"
        );
        Ok(context)
    }
}
