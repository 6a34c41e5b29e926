//! Data exchanged with the discovery, generation and execution collaborators

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgate_guardrail::ResidualFilter;
use std::collections::BTreeMap;

/// Question as asked, scoped to one customer's dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub customer_id: String,
}

impl Question {
    pub fn new(text: impl Into<String>, customer_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            customer_id: customer_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentSummary {
    #[serde(rename = "type")]
    pub intent_type: String,
    #[serde(default)]
    pub filters: Vec<ResidualFilter>,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormCandidate {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCandidate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminologyMapping {
    pub term: String,
    pub field: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPath {
    pub from: String,
    pub to: String,
    pub on: String,
}

/// Opaque discovery snapshot for one question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub customer_id: String,
    #[serde(default)]
    pub intent: IntentSummary,
    #[serde(default)]
    pub forms: Vec<FormCandidate>,
    #[serde(default)]
    pub fields: Vec<FieldCandidate>,
    #[serde(default)]
    pub terminology: Vec<TerminologyMapping>,
    #[serde(default)]
    pub join_paths: Vec<JoinPath>,
    #[serde(default)]
    pub overall_confidence: f64,
}

impl ContextBundle {
    /// Fallback used when discovery fails: no candidates, zero confidence
    pub fn minimal(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            intent: IntentSummary {
                intent_type: "unknown".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    /// Snippets form a valid chain and must appear in the SQL
    Chain,
    /// Snippets are advisory; composition problems are surfaced as warnings
    Guided,
    TemplateOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateReference {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub intent: String,
    /// Template SQL with placeholder values substituted where possible
    pub sql: String,
    #[serde(default)]
    pub placeholder_values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetReference {
    pub id: String,
    pub sql: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// Everything the generation collaborator gets for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub question: Question,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateReference>,
    #[serde(default)]
    pub snippets: Vec<SnippetReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition_mode: Option<CompositionMode>,
    /// Validated filters the SQL must apply
    #[serde(default)]
    pub filters: Vec<ResidualFilter>,
    /// Free-form answers from a previous clarification round
    #[serde(default)]
    pub clarifications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationResponse {
    Sql {
        sql: String,
        #[serde(default)]
        confidence: f64,
        #[serde(default)]
        assumptions: Vec<String>,
    },
    Clarification {
        clarification_needed: String,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        reasoning: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderFill {
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub missing: Vec<String>,
}

/// A concrete filter the generation collaborator proposes for an ambiguous phrase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedOption {
    pub label: String,
    pub filter: ResidualFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSuggestion {
    pub original_text: String,
    #[serde(default)]
    pub options: Vec<SuggestedOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResidualExtraction {
    #[serde(default)]
    pub filters: Vec<ResidualFilter>,
    #[serde(default)]
    pub suggestions: Vec<FilterSuggestion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generation_response_shapes() {
        let sql: GenerationResponse =
            serde_json::from_value(json!({"sql": "SELECT 1", "confidence": 0.9})).unwrap();
        assert!(matches!(sql, GenerationResponse::Sql { .. }));

        let clarify: GenerationResponse = serde_json::from_value(json!({
            "clarification_needed": "Which clinic?",
            "options": ["North", "South"],
            "reasoning": "Two clinics match"
        }))
        .unwrap();
        assert!(matches!(clarify, GenerationResponse::Clarification { ref options, .. } if options.len() == 2));
    }

    #[test]
    fn test_minimal_context() {
        let context = ContextBundle::minimal("acme");
        assert_eq!(context.customer_id, "acme");
        assert_eq!(context.overall_confidence, 0.0);
        assert!(context.fields.is_empty());
    }
}
