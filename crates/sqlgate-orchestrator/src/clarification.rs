//! Clarification requests for unresolved filters and merging of the answers

use crate::types::FilterSuggestion;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlgate_guardrail::{
    ClarificationChoice, FilterIssue, MergedFilterState, PendingClarification, ResidualFilter,
};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

pub const REMOVE_OPTION: &str = "remove";
pub const CUSTOM_OPTION: &str = "custom";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ResidualFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationEntry {
    pub id: String,
    /// Phrase from the question the entry is about
    pub original_text: String,
    pub prompt: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub options: Vec<ClarificationOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub entries: Vec<ClarificationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// One answer: pick an offered option, drop the filter, supply a full
/// filter, or supply a bare value for the filter's field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClarificationAnswer {
    Choose { option_id: String },
    Remove { remove: bool },
    Filter(ResidualFilter),
    Value(Value),
}

/// Caller's reply to a clarification, re-entering with the returned state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClarificationReply {
    #[serde(default)]
    pub filter_state: MergedFilterState,
    #[serde(default)]
    pub answers: BTreeMap<String, ClarificationAnswer>,
}

/// Build one entry per unresolved filter and record it as pending in `state`.
/// Concrete suggestions are preferred; remove/custom options are always offered.
pub fn request_for_unresolved(
    state: &mut MergedFilterState,
    unresolved: &[(usize, Vec<FilterIssue>)],
    suggestions: &[FilterSuggestion],
) -> ClarificationRequest {
    let mut entries = Vec::with_capacity(unresolved.len());

    for (index, issues) in unresolved {
        let Some(merged) = state.get(*index) else { continue };
        let filter = merged.filter.clone();
        let id = Uuid::new_v4().to_string();
        let subject = filter.label();

        let choices: Vec<ClarificationChoice> = suggestions
            .iter()
            .filter(|s| s.original_text.eq_ignore_ascii_case(filter.original_text.trim()))
            .flat_map(|s| s.options.iter())
            .enumerate()
            .map(|(n, option)| ClarificationChoice {
                option_id: format!("option_{}", n + 1),
                label: option.label.clone(),
                filter: option.filter.clone(),
            })
            .collect();

        let mut options: Vec<ClarificationOption> = choices
            .iter()
            .map(|c| ClarificationOption {
                id: c.option_id.clone(),
                label: c.label.clone(),
                filter: Some(c.filter.clone()),
            })
            .collect();
        options.push(ClarificationOption {
            id: CUSTOM_OPTION.to_string(),
            label: format!("Supply a value for \"{subject}\""),
            filter: None,
        });
        options.push(ClarificationOption {
            id: REMOVE_OPTION.to_string(),
            label: format!("Remove \"{subject}\" from the question"),
            filter: None,
        });

        let mut reasons: Vec<String> = issues.iter().map(|i| i.message.clone()).collect();
        if reasons.is_empty() {
            reasons.push(format!("Low confidence ({:.2}) in how this was understood", merged.confidence));
        }

        state.set_pending(
            *index,
            PendingClarification {
                id: id.clone(),
                choices,
            },
        );
        entries.push(ClarificationEntry {
            id,
            original_text: filter.original_text.clone(),
            prompt: format!("What do you mean by \"{subject}\"?"),
            reasons,
            options,
        });
    }

    ClarificationRequest {
        entries,
        reasoning: None,
    }
}

/// Request built from a generation-side clarification
pub fn request_from_generation(question: &str, options: &[String], reasoning: &str) -> ClarificationRequest {
    let mut entry_options: Vec<ClarificationOption> = options
        .iter()
        .enumerate()
        .map(|(n, label)| ClarificationOption {
            id: format!("option_{}", n + 1),
            label: label.clone(),
            filter: None,
        })
        .collect();
    entry_options.push(ClarificationOption {
        id: CUSTOM_OPTION.to_string(),
        label: "Describe what you meant".to_string(),
        filter: None,
    });

    ClarificationRequest {
        entries: vec![ClarificationEntry {
            id: Uuid::new_v4().to_string(),
            original_text: String::new(),
            prompt: question.to_string(),
            reasons: Vec::new(),
            options: entry_options,
        }],
        reasoning: (!reasoning.is_empty()).then(|| reasoning.to_string()),
    }
}

/// Merge answers into `state`. Answers that match no pending filter are
/// returned as free-form notes for generation.
pub fn apply_answers(
    state: &mut MergedFilterState,
    answers: &BTreeMap<String, ClarificationAnswer>,
) -> Vec<String> {
    let mut notes = Vec::new();
    let mut removals = Vec::new();

    for (id, answer) in answers {
        let Some(index) = state.find_pending(id) else {
            match answer {
                ClarificationAnswer::Choose { option_id } => notes.push(option_id.clone()),
                ClarificationAnswer::Value(Value::String(s)) => notes.push(s.clone()),
                ClarificationAnswer::Value(v) => notes.push(v.to_string()),
                ClarificationAnswer::Filter(f) => notes.push(f.label()),
                ClarificationAnswer::Remove { .. } => {}
            }
            continue;
        };
        let Some(entry) = state.get(index) else { continue };
        let current = entry.filter.clone();
        let choices = entry
            .pending
            .as_ref()
            .map(|p| p.choices.clone())
            .unwrap_or_default();

        match answer {
            ClarificationAnswer::Remove { remove: true } => removals.push(index),
            ClarificationAnswer::Remove { remove: false } => {}
            ClarificationAnswer::Choose { option_id } if option_id == REMOVE_OPTION => removals.push(index),
            ClarificationAnswer::Choose { option_id } => {
                if let Some(choice) = choices.iter().find(|c| &c.option_id == option_id) {
                    state.replace(index, from_user(choice.filter.clone(), &current));
                }
            }
            ClarificationAnswer::Filter(filter) => {
                state.replace(index, from_user(filter.clone(), &current));
            }
            ClarificationAnswer::Value(value) => {
                let mut filter = current.clone();
                filter.value = value.clone();
                state.replace(index, from_user(filter, &current));
            }
        }
        debug!(clarification_id = %id, "Clarification answer applied");
    }

    removals.sort_unstable();
    for index in removals.into_iter().rev() {
        state.remove(index);
    }
    notes
}

/// User-confirmed filter: full confidence, original phrase preserved
fn from_user(mut filter: ResidualFilter, previous: &ResidualFilter) -> ResidualFilter {
    filter.confidence = 1.0;
    filter.required = previous.required || filter.required;
    if filter.original_text.is_empty() {
        filter.original_text = previous.original_text.clone();
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SuggestedOption;
    use serde_json::json;
    use sqlgate_guardrail::{FilterOperator, FilterSource, IssueCode, Severity};

    fn vip_state() -> (MergedFilterState, usize) {
        let mut state = MergedFilterState::new();
        let index = state.add(
            ResidualFilter::new("vip_status", FilterOperator::Eq, json!(true))
                .with_original_text("VIP patients")
                .with_confidence(0.4),
            FilterSource::ResidualExtraction,
            false,
        );
        (state, index)
    }

    fn not_found() -> Vec<FilterIssue> {
        vec![FilterIssue {
            code: IssueCode::FieldNotFound,
            severity: Severity::Error,
            field: "vip_status".to_string(),
            message: "Field 'vip_status' does not exist in the schema".to_string(),
        }]
    }

    #[test]
    fn test_entry_prefers_suggestions_and_keeps_fallbacks() {
        let (mut state, index) = vip_state();
        let suggestions = vec![FilterSuggestion {
            original_text: "vip patients".to_string(),
            options: vec![SuggestedOption {
                label: "Patients in the premium tier".to_string(),
                filter: ResidualFilter::new("patient_tier", FilterOperator::Eq, json!("premium")),
            }],
        }];

        let request = request_for_unresolved(&mut state, &[(index, not_found())], &suggestions);
        assert_eq!(request.entries.len(), 1);
        let entry = &request.entries[0];
        assert_eq!(entry.original_text, "VIP patients");
        let ids: Vec<&str> = entry.options.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["option_1", CUSTOM_OPTION, REMOVE_OPTION]);
        assert_eq!(state.find_pending(&entry.id), Some(index));
    }

    #[test]
    fn test_apply_choice_value_and_remove() {
        let (mut state, index) = vip_state();
        let suggestions = vec![FilterSuggestion {
            original_text: "VIP patients".to_string(),
            options: vec![SuggestedOption {
                label: "Premium tier".to_string(),
                filter: ResidualFilter::new("patient_tier", FilterOperator::Eq, json!("premium")),
            }],
        }];
        let request = request_for_unresolved(&mut state, &[(index, not_found())], &suggestions);
        let id = request.entries[0].id.clone();

        let mut chosen = state.clone();
        apply_answers(
            &mut chosen,
            &BTreeMap::from([(id.clone(), ClarificationAnswer::Choose { option_id: "option_1".to_string() })]),
        );
        let entry = chosen.get(index).unwrap();
        assert_eq!(entry.filter.field, "patient_tier");
        assert_eq!(entry.filter.original_text, "VIP patients");
        assert_eq!(entry.confidence, 1.0);
        assert!(!entry.resolved);
        assert!(entry.has_source(FilterSource::UserClarification));

        let mut valued = state.clone();
        apply_answers(&mut valued, &BTreeMap::from([(id.clone(), ClarificationAnswer::Value(json!(false)))]));
        assert_eq!(valued.get(index).unwrap().filter.value, json!(false));

        let mut removed = state.clone();
        let notes = apply_answers(
            &mut removed,
            &BTreeMap::from([
                (id, ClarificationAnswer::Remove { remove: true }),
                ("unknown".to_string(), ClarificationAnswer::Value(json!("last quarter only"))),
            ]),
        );
        assert!(removed.is_empty());
        assert_eq!(notes, vec!["last quarter only".to_string()]);
    }

    #[test]
    fn test_answer_shapes_deserialize() {
        let answers: BTreeMap<String, ClarificationAnswer> = serde_json::from_value(json!({
            "a": {"option_id": "option_2"},
            "b": {"remove": true},
            "c": {"field": "patient_tier", "operator": "=", "value": "VIP"},
            "d": 42
        }))
        .unwrap();
        assert!(matches!(answers["a"], ClarificationAnswer::Choose { .. }));
        assert!(matches!(answers["b"], ClarificationAnswer::Remove { remove: true }));
        assert!(matches!(answers["c"], ClarificationAnswer::Filter(_)));
        assert!(matches!(answers["d"], ClarificationAnswer::Value(_)));
    }
}
