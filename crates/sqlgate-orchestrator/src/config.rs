//! Routing thresholds

use serde::{Deserialize, Serialize};
use sqlgate_catalog::known_intents;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Minimum score for a full template
    #[serde(default = "default_template_threshold")]
    pub template_threshold: f64,

    /// Minimum score for snippet/fragment templates and for snippet matching
    #[serde(default = "default_snippet_threshold")]
    pub snippet_threshold: f64,

    #[serde(default = "default_allowed_intents")]
    pub allowed_intents: Vec<String>,

    /// Filters below this confidence are put to the user
    #[serde(default = "default_filter_confidence_threshold")]
    pub filter_confidence_threshold: f64,

    #[serde(default = "default_max_snippets")]
    pub max_snippets: usize,
}

fn default_template_threshold() -> f64 {
    0.35
}

fn default_snippet_threshold() -> f64 {
    0.30
}

fn default_allowed_intents() -> Vec<String> {
    known_intents().map(str::to_string).collect()
}

fn default_filter_confidence_threshold() -> f64 {
    0.6
}

fn default_max_snippets() -> usize {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            template_threshold: default_template_threshold(),
            snippet_threshold: default_snippet_threshold(),
            allowed_intents: default_allowed_intents(),
            filter_confidence_threshold: default_filter_confidence_threshold(),
            max_snippets: default_max_snippets(),
        }
    }
}

impl OrchestratorConfig {
    pub fn allows_intent(&self, intent: &str) -> bool {
        self.allowed_intents.iter().any(|i| i == intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: OrchestratorConfig = serde_json::from_str(r#"{"template_threshold": 0.5}"#).unwrap();
        assert_eq!(config.template_threshold, 0.5);
        assert_eq!(config.snippet_threshold, 0.30);
        assert_eq!(config.max_snippets, 5);
        assert!(config.allows_intent("temporal_proximity_query"));
        assert!(!config.allows_intent("made_up"));
    }
}
