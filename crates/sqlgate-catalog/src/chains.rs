//! Curated composition chains: which snippets serve an intent, in what order

use crate::catalog::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub snippet_id: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionChain {
    pub id: String,
    pub intent: String,
    pub steps: Vec<ChainStep>,
    /// Snippet input name -> output name of the step that produces it
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub order_required: bool,
}

impl CompositionChain {
    pub fn index_of(&self, snippet_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.snippet_id == snippet_id)
    }

    pub fn required_steps(&self) -> impl Iterator<Item = &ChainStep> {
        self.steps.iter().filter(|s| !s.optional)
    }
}

fn step(snippet_id: &str, optional: bool) -> ChainStep {
    ChainStep {
        snippet_id: snippet_id.to_string(),
        optional,
    }
}

pub fn builtin_chains() -> Vec<CompositionChain> {
    vec![CompositionChain {
        id: "temporal_proximity_outcome".to_string(),
        intent: "temporal_proximity_query".to_string(),
        steps: vec![
            step("baseline_wound_selection", false),
            step("proximity_window_assessment", false),
            step("area_reduction_calculation", false),
            step("threshold_filter", true),
        ],
        bindings: BTreeMap::from([
            ("baseline_date".to_string(), "baseline_date".to_string()),
            ("baseline_area".to_string(), "baseline_area".to_string()),
            ("window_area".to_string(), "window_area".to_string()),
            ("area_reduction".to_string(), "area_reduction".to_string()),
        ]),
        order_required: true,
    }]
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChainFile {
    List(Vec<CompositionChain>),
    Document { chains: Vec<CompositionChain> },
}

/// Chains indexed by intent
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    by_intent: HashMap<String, CompositionChain>,
}

impl ChainRegistry {
    pub fn new(chains: Vec<CompositionChain>) -> Self {
        let by_intent = chains.into_iter().map(|c| (c.intent.clone(), c)).collect();
        Self { by_intent }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_chains())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, CatalogError> {
        let chains = match serde_yaml::from_str::<ChainFile>(content)? {
            ChainFile::List(chains) => chains,
            ChainFile::Document { chains } => chains,
        };
        Ok(Self::new(chains))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn for_intent(&self, intent: &str) -> Option<&CompositionChain> {
        self.by_intent.get(intent)
    }

    pub fn len(&self) -> usize {
        self.by_intent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_intent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_chain_order() {
        let registry = ChainRegistry::builtin();
        let chain = registry.for_intent("temporal_proximity_query").unwrap();
        assert!(chain.order_required);
        assert_eq!(chain.index_of("baseline_wound_selection"), Some(0));
        assert_eq!(chain.index_of("threshold_filter"), Some(3));
        assert_eq!(chain.required_steps().count(), 3);
    }

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
chains:
  - id: c
    intent: outcome_analysis
    steps:
      - snippet_id: a
      - snippet_id: b
        optional: true
"#;
        let registry = ChainRegistry::from_yaml_str(yaml).unwrap();
        let chain = registry.for_intent("outcome_analysis").unwrap();
        assert_eq!(chain.steps.len(), 2);
        assert!(!chain.order_required);
        assert!(chain.steps[1].optional);
    }
}
