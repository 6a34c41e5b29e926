//! Merged filter state across template placeholders, semantic mapping,
//! residual extraction and user clarification

use crate::filters::ResidualFilter;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSource {
    TemplatePlaceholder,
    SemanticMapping,
    ResidualExtraction,
    UserClarification,
}

/// A concrete replacement offered to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationChoice {
    pub option_id: String,
    pub label: String,
    pub filter: ResidualFilter,
}

/// Outstanding question about one filter, carried in the state across a round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingClarification {
    pub id: String,
    #[serde(default)]
    pub choices: Vec<ClarificationChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedFilter {
    pub filter: ResidualFilter,
    pub sources: Vec<FilterSource>,
    pub confidence: f64,
    /// Resolved filters are neither re-validated nor re-asked
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingClarification>,
}

impl MergedFilter {
    fn key(&self) -> String {
        filter_key(&self.filter)
    }

    pub fn has_source(&self, source: FilterSource) -> bool {
        self.sources.contains(&source)
    }
}

fn filter_key(filter: &ResidualFilter) -> String {
    format!(
        "{}|{}|{}",
        filter.field.trim().to_lowercase(),
        filter.operator,
        normalize_value(&filter.value)
    )
}

fn normalize_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_lowercase(),
        Value::Array(items) => {
            let mut parts: Vec<String> = items.iter().map(normalize_value).collect();
            parts.sort();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn text_key(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedFilterState {
    filters: Vec<MergedFilter>,
}

impl MergedFilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one filter signal; duplicates keep the higher confidence and
    /// accumulate provenance. Returns the entry index.
    pub fn add(&mut self, filter: ResidualFilter, source: FilterSource, resolved: bool) -> usize {
        let key = filter_key(&filter);
        let text = text_key(&filter.original_text);

        let existing = self.filters.iter().position(|m| {
            m.key() == key || (!text.is_empty() && text_key(&m.filter.original_text) == text)
        });

        match existing {
            Some(index) => {
                let merged = &mut self.filters[index];
                if !merged.sources.contains(&source) {
                    merged.sources.push(source);
                }
                merged.filter.required |= filter.required;
                if filter.confidence > merged.confidence {
                    merged.confidence = filter.confidence;
                    let required = merged.filter.required;
                    let original_text = std::mem::take(&mut merged.filter.original_text);
                    merged.filter = filter;
                    merged.filter.required = required;
                    if merged.filter.original_text.is_empty() {
                        merged.filter.original_text = original_text;
                    }
                }
                merged.resolved |= resolved;
                index
            }
            None => {
                self.filters.push(MergedFilter {
                    confidence: filter.confidence,
                    filter,
                    sources: vec![source],
                    resolved,
                    pending: None,
                });
                self.filters.len() - 1
            }
        }
    }

    pub fn mark_resolved(&mut self, index: usize) {
        if let Some(entry) = self.filters.get_mut(index) {
            entry.resolved = true;
            entry.pending = None;
        }
    }

    /// Replace the filter at `index` with a user-supplied one
    pub fn replace(&mut self, index: usize, filter: ResidualFilter) {
        if let Some(entry) = self.filters.get_mut(index) {
            entry.confidence = filter.confidence;
            entry.filter = filter;
            if !entry.sources.contains(&FilterSource::UserClarification) {
                entry.sources.push(FilterSource::UserClarification);
            }
            entry.resolved = false;
            entry.pending = None;
        }
    }

    pub fn set_pending(&mut self, index: usize, pending: PendingClarification) {
        if let Some(entry) = self.filters.get_mut(index) {
            entry.pending = Some(pending);
        }
    }

    /// Index of the entry awaiting the clarification `id`
    pub fn find_pending(&self, id: &str) -> Option<usize> {
        self.filters
            .iter()
            .position(|m| m.pending.as_ref().is_some_and(|p| p.id == id))
    }

    pub fn remove(&mut self, index: usize) -> Option<MergedFilter> {
        (index < self.filters.len()).then(|| self.filters.remove(index))
    }

    /// Index of the entry whose original text matches `text`
    pub fn find_by_text(&self, text: &str) -> Option<usize> {
        let text = text_key(text);
        if text.is_empty() {
            return None;
        }
        self.filters
            .iter()
            .position(|m| text_key(&m.filter.original_text) == text)
    }

    /// Whether `text` (e.g. a phrase in the question) is already known
    pub fn covers_text(&self, text: &str) -> bool {
        self.find_by_text(text).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&MergedFilter> {
        self.filters.get(index)
    }

    pub fn entries(&self) -> &[MergedFilter] {
        &self.filters
    }

    /// Indices of entries still awaiting validation
    pub fn unresolved(&self) -> Vec<usize> {
        (0..self.filters.len())
            .filter(|&i| !self.filters[i].resolved)
            .collect()
    }

    pub fn resolved_filters(&self) -> Vec<ResidualFilter> {
        self.filters
            .iter()
            .filter(|m| m.resolved)
            .map(|m| m.filter.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
