//! Schema field metadata consulted by filter validation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Enum,
    Text,
    Integer,
    Decimal,
    Date,
    Timestamp,
    Boolean,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Decimal)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Timestamp)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::Enum => "enum",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Date => "date",
            FieldType::Timestamp => "timestamp",
            FieldType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            table: None,
            field_type,
            allowed_values: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_allowed_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Field lookups are case-insensitive
pub trait SchemaCatalog: Send + Sync {
    fn field(&self, name: &str) -> Option<SchemaField>;

    /// Known values of an enum field; `None` when they cannot be verified
    fn allowed_values(&self, field: &str) -> Option<Vec<String>> {
        self.field(field)?.allowed_values
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySchemaCatalog {
    fields: HashMap<String, SchemaField>,
}

impl InMemorySchemaCatalog {
    pub fn new(fields: impl IntoIterator<Item = SchemaField>) -> Self {
        let mut catalog = Self::default();
        for field in fields {
            catalog.insert(field);
        }
        catalog
    }

    pub fn insert(&mut self, field: SchemaField) {
        if let Some(table) = &field.table {
            self.fields.insert(
                format!("{}.{}", table, field.name).to_lowercase(),
                field.clone(),
            );
        }
        self.fields.insert(field.name.to_lowercase(), field);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl SchemaCatalog for InMemorySchemaCatalog {
    fn field(&self, name: &str) -> Option<SchemaField> {
        let key = name.trim().to_lowercase();
        self.fields
            .get(&key)
            .or_else(|| key.rsplit('.').next().and_then(|last| self.fields.get(last)))
            .cloned()
    }
}
