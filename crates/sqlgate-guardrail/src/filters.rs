//! Residual filters and pre-generation validation against schema metadata

use crate::schema::{FieldType, SchemaCatalog, SchemaField};
use crate::{IssueCode, Severity};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
#[error("Unknown filter operator: {0}")]
pub struct UnknownOperator(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    Like,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Ne => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Gte => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Lte => "<=",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not in",
            FilterOperator::Between => "between",
            FilterOperator::Like => "like",
            FilterOperator::IsNull => "is null",
            FilterOperator::IsNotNull => "is not null",
        }
    }

    fn is_comparison(&self) -> bool {
        matches!(
            self,
            FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte
        )
    }

    fn is_null_check(&self) -> bool {
        matches!(self, FilterOperator::IsNull | FilterOperator::IsNotNull)
    }

    fn is_membership(&self) -> bool {
        matches!(self, FilterOperator::In | FilterOperator::NotIn)
    }

    /// Whether this operator may be applied to a field of `field_type`
    pub fn legal_for(&self, field_type: FieldType) -> bool {
        use FilterOperator::*;
        if self.is_null_check() {
            return true;
        }
        match field_type {
            FieldType::Enum => matches!(self, Eq | Ne | In | NotIn),
            FieldType::Integer | FieldType::Decimal | FieldType::Date | FieldType::Timestamp => {
                matches!(self, Eq | Ne | Between) || self.is_comparison()
            }
            FieldType::Boolean => matches!(self, Eq),
            FieldType::Text => matches!(self, Eq | Ne | Like | In | NotIn),
        }
    }
}

impl FromStr for FilterOperator {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        let op = match normalized.as_str() {
            "=" | "==" | "eq" | "equals" => FilterOperator::Eq,
            "!=" | "<>" | "ne" | "neq" | "not equals" => FilterOperator::Ne,
            ">" | "gt" => FilterOperator::Gt,
            ">=" | "gte" => FilterOperator::Gte,
            "<" | "lt" => FilterOperator::Lt,
            "<=" | "lte" => FilterOperator::Lte,
            "in" => FilterOperator::In,
            "not in" | "not_in" | "nin" => FilterOperator::NotIn,
            "between" => FilterOperator::Between,
            "like" | "ilike" | "contains" => FilterOperator::Like,
            "is null" | "is_null" => FilterOperator::IsNull,
            "is not null" | "is_not_null" => FilterOperator::IsNotNull,
            _ => return Err(UnknownOperator(s.to_string())),
        };
        Ok(op)
    }
}

impl TryFrom<String> for FilterOperator {
    type Error = UnknownOperator;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterOperator> for String {
    fn from(op: FilterOperator) -> Self {
        op.as_str().to_string()
    }
}

impl std::fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate constraint extracted from the question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualFilter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub original_text: String,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    1.0
}

impl ResidualFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            required: true,
            confidence: 1.0,
            original_text: String::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_original_text(mut self, text: impl Into<String>) -> Self {
        self.original_text = text.into();
        self
    }

    /// Short label for diagnostics: original text when known, else `field op value`
    pub fn label(&self) -> String {
        if !self.original_text.is_empty() {
            self.original_text.clone()
        } else {
            format!("{} {} {}", self.field, self.operator, self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterIssue {
    pub code: IssueCode,
    pub severity: Severity,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedFilter {
    pub filter: ResidualFilter,
    pub issues: Vec<FilterIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterValidationReport {
    pub valid: Vec<ResidualFilter>,
    pub rejected: Vec<RejectedFilter>,
    pub warnings: Vec<FilterIssue>,
}

impl FilterValidationReport {
    pub fn all_valid(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Validate each filter; failing filters are excluded from `valid` but kept in `rejected`.
pub fn validate_filters(
    filters: &[ResidualFilter],
    schema: &dyn SchemaCatalog,
) -> FilterValidationReport {
    let mut report = FilterValidationReport::default();

    for filter in filters {
        let issues = validate_filter(filter, schema);
        let (errors, warnings): (Vec<_>, Vec<_>) = issues
            .into_iter()
            .partition(|i| i.severity == Severity::Error);

        report.warnings.extend(warnings);
        if errors.is_empty() {
            report.valid.push(filter.clone());
        } else {
            debug!(field = %filter.field, issues = errors.len(), "Filter rejected");
            report.rejected.push(RejectedFilter {
                filter: filter.clone(),
                issues: errors,
            });
        }
    }

    report
}

pub fn validate_filter(filter: &ResidualFilter, schema: &dyn SchemaCatalog) -> Vec<FilterIssue> {
    let issue = |code: IssueCode, severity: Severity, message: String| FilterIssue {
        code,
        severity,
        field: filter.field.clone(),
        message,
    };

    let Some(field) = schema.field(&filter.field) else {
        return vec![issue(
            IssueCode::FieldNotFound,
            Severity::Error,
            format!("Field '{}' does not exist in the schema", filter.field),
        )];
    };

    if !filter.operator.legal_for(field.field_type) {
        return vec![issue(
            IssueCode::OperatorInvalidForType,
            Severity::Error,
            format!(
                "Operator '{}' is not valid for {} field '{}'",
                filter.operator, field.field_type, field.name
            ),
        )];
    }

    if filter.operator.is_null_check() {
        return Vec::new();
    }

    let values = match shape_values(filter) {
        Ok(values) => values,
        Err(message) => return vec![issue(IssueCode::ValueTypeMismatch, Severity::Error, message)],
    };

    let mut issues = Vec::new();
    for value in &values {
        if !value_matches_type(value, field.field_type) {
            issues.push(issue(
                IssueCode::ValueTypeMismatch,
                Severity::Error,
                format!("Value {} is not a valid {} for '{}'", value, field.field_type, field.name),
            ));
        }
    }
    if !issues.is_empty() {
        return issues;
    }

    if field.field_type == FieldType::Enum {
        issues.extend(check_enum_values(filter, &field, &values, schema));
    }
    issues
}

/// Split the filter value into the scalar operands its operator expects
fn shape_values(filter: &ResidualFilter) -> Result<Vec<&Value>, String> {
    match (&filter.operator, &filter.value) {
        (op, Value::Array(items)) if op.is_membership() => {
            if items.is_empty() {
                Err(format!("Operator '{op}' requires a non-empty list"))
            } else {
                Ok(items.iter().collect())
            }
        }
        (op, _) if op.is_membership() => Err(format!("Operator '{op}' requires a list of values")),
        (FilterOperator::Between, Value::Array(items)) if items.len() == 2 => {
            Ok(items.iter().collect())
        }
        (FilterOperator::Between, _) => Err("Operator 'between' requires exactly two values".to_string()),
        (_, Value::Array(_)) => Err(format!(
            "Operator '{}' requires a single value",
            filter.operator
        )),
        (_, Value::Null) => Err("Filter value is missing".to_string()),
        (_, value) => Ok(vec![value]),
    }
}

fn value_matches_type(value: &Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::Integer => match value {
            Value::Number(n) => n.as_i64().is_some() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            Value::String(s) => s.trim().parse::<i64>().is_ok(),
            _ => false,
        },
        FieldType::Decimal => match value {
            Value::Number(_) => true,
            Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().is_ok(),
            _ => false,
        },
        FieldType::Date | FieldType::Timestamp => match value {
            Value::String(s) => parses_as_date(s.trim()),
            _ => false,
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => true,
            Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "false"),
            _ => false,
        },
        FieldType::Enum => matches!(value, Value::String(_)),
        FieldType::Text => matches!(value, Value::String(_) | Value::Number(_)),
    }
}

fn parses_as_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || DateTime::parse_from_rfc3339(s).is_ok()
}

fn check_enum_values(
    filter: &ResidualFilter,
    field: &SchemaField,
    values: &[&Value],
    schema: &dyn SchemaCatalog,
) -> Vec<FilterIssue> {
    let Some(allowed) = field
        .allowed_values
        .clone()
        .or_else(|| schema.allowed_values(&filter.field))
    else {
        return vec![FilterIssue {
            code: IssueCode::EnumValueNotFound,
            severity: Severity::Warning,
            field: filter.field.clone(),
            message: format!("Allowed values for '{}' could not be verified", field.name),
        }];
    };

    values
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|v| !allowed.iter().any(|a| a.eq_ignore_ascii_case(v.trim())))
        .map(|v| FilterIssue {
            code: IssueCode::EnumValueNotFound,
            severity: Severity::Error,
            field: filter.field.clone(),
            message: format!(
                "Value '{}' is not one of the allowed values for '{}': {}",
                v,
                field.name,
                allowed.join(", ")
            ),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::InMemorySchemaCatalog;
    use serde_json::json;

    fn schema() -> InMemorySchemaCatalog {
        InMemorySchemaCatalog::new([
            SchemaField::new("wound_type", FieldType::Enum)
                .with_allowed_values(["Diabetic Foot Ulcer", "Venous Leg Ulcer", "Pressure Injury"]),
            SchemaField::new("etiology", FieldType::Enum),
            SchemaField::new("area_reduction", FieldType::Decimal),
            SchemaField::new("weeks", FieldType::Integer),
            SchemaField::new("assessment_date", FieldType::Date),
            SchemaField::new("is_healed", FieldType::Boolean),
            SchemaField::new("clinic_name", FieldType::Text),
        ])
    }

    fn codes(filter: ResidualFilter) -> Vec<IssueCode> {
        validate_filter(&filter, &schema()).into_iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("==".parse::<FilterOperator>(), Ok(FilterOperator::Eq));
        assert_eq!("NOT   IN".parse::<FilterOperator>(), Ok(FilterOperator::NotIn));
        assert!("~".parse::<FilterOperator>().is_err());
        let op: FilterOperator = serde_json::from_value(json!(">=")).unwrap();
        assert_eq!(op, FilterOperator::Gte);
    }

    #[test]
    fn test_field_and_operator_checks() {
        assert_eq!(
            codes(ResidualFilter::new("vip_status", FilterOperator::Eq, json!("vip"))),
            vec![IssueCode::FieldNotFound]
        );
        assert_eq!(
            codes(ResidualFilter::new("is_healed", FilterOperator::Gt, json!(true))),
            vec![IssueCode::OperatorInvalidForType]
        );
        assert_eq!(
            codes(ResidualFilter::new("wound_type", FilterOperator::Lt, json!("x"))),
            vec![IssueCode::OperatorInvalidForType]
        );
        assert!(codes(ResidualFilter::new("WEEKS", FilterOperator::Gte, json!("12"))).is_empty());
    }

    #[test]
    fn test_value_shapes() {
        assert_eq!(
            codes(ResidualFilter::new("assessment_date", FilterOperator::Gt, json!("last spring"))),
            vec![IssueCode::ValueTypeMismatch]
        );
        assert!(codes(ResidualFilter::new("assessment_date", FilterOperator::Gt, json!("2024-01-01"))).is_empty());
        assert_eq!(
            codes(ResidualFilter::new("wound_type", FilterOperator::In, json!("Pressure Injury"))),
            vec![IssueCode::ValueTypeMismatch]
        );
        assert!(codes(ResidualFilter::new("area_reduction", FilterOperator::Between, json!([0.3, "0.5"]))).is_empty());
        assert!(codes(ResidualFilter::new("area_reduction", FilterOperator::Gte, json!("30%"))).is_empty());
        assert!(codes(ResidualFilter::new("clinic_name", FilterOperator::IsNull, Value::Null)).is_empty());
    }

    #[test]
    fn test_enum_values() {
        assert!(codes(ResidualFilter::new("wound_type", FilterOperator::Eq, json!("pressure injury"))).is_empty());
        assert_eq!(
            codes(ResidualFilter::new("wound_type", FilterOperator::In, json!(["Burn", "Venous Leg Ulcer"]))),
            vec![IssueCode::EnumValueNotFound]
        );

        let issues = validate_filter(
            &ResidualFilter::new("etiology", FilterOperator::Eq, json!("trauma")),
            &schema(),
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_report_keeps_rejected_filters() {
        let filters = vec![
            ResidualFilter::new("weeks", FilterOperator::Eq, json!(12)),
            ResidualFilter::new("vip", FilterOperator::Eq, json!(true)).with_original_text("VIP patients"),
            ResidualFilter::new("etiology", FilterOperator::Eq, json!("trauma")),
        ];
        let report = validate_filters(&filters, &schema());
        assert_eq!(report.valid.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].filter.original_text, "VIP patients");
        assert_eq!(report.warnings.len(), 1);
        assert!(!report.all_valid());
    }
}
