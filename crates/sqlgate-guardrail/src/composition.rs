//! Snippet composition validation against a curated chain

use serde::{Deserialize, Serialize};
use sqlgate_catalog::{CompositionChain, Snippet};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    MissingStep,
    OutOfOrder,
    MixedIntent,
    UnsatisfiedInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionViolation {
    pub kind: ViolationKind,
    pub snippet_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionReport {
    pub valid: bool,
    pub violations: Vec<CompositionViolation>,
}

impl CompositionReport {
    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }
}

/// Inputs named `$name` or `ext.name` are supplied by the caller at run time
fn is_external(input: &str) -> bool {
    input.starts_with('$') || input.to_ascii_lowercase().starts_with("ext.")
}

/// Check `snippets`, in the order given, against `intent` and its chain
pub fn validate_composition(
    snippets: &[&Snippet],
    intent: &str,
    chain: Option<&CompositionChain>,
    user_tokens: &[String],
) -> CompositionReport {
    let mut violations = Vec::new();

    for snippet in snippets {
        if snippet.template.intent != intent {
            violations.push(CompositionViolation {
                kind: ViolationKind::MixedIntent,
                snippet_id: snippet.template.id.clone(),
                message: format!(
                    "Snippet {} serves intent {}, not {}",
                    snippet.template.id, snippet.template.intent, intent
                ),
                suggestion: Some(format!("Remove {} or pick a snippet for {}", snippet.template.id, intent)),
            });
        }
    }

    if let Some(chain) = chain {
        let chosen: HashSet<&str> = snippets.iter().map(|s| s.template.id.as_str()).collect();
        for step in chain.required_steps() {
            if !chosen.contains(step.snippet_id.as_str()) {
                violations.push(CompositionViolation {
                    kind: ViolationKind::MissingStep,
                    snippet_id: step.snippet_id.clone(),
                    message: format!("Required step {} of chain {} is missing", step.snippet_id, chain.id),
                    suggestion: Some(format!("Add snippet {}", step.snippet_id)),
                });
            }
        }

        if chain.order_required {
            let mut highest: Option<(usize, &str)> = None;
            for snippet in snippets {
                let Some(index) = chain.index_of(&snippet.template.id) else { continue };
                match highest {
                    Some((prev, prev_id)) if index < prev => {
                        violations.push(CompositionViolation {
                            kind: ViolationKind::OutOfOrder,
                            snippet_id: snippet.template.id.clone(),
                            message: format!(
                                "Snippet {} must come before {} in chain {}",
                                snippet.template.id, prev_id, chain.id
                            ),
                            suggestion: Some(format!("Move {} ahead of {}", snippet.template.id, prev_id)),
                        });
                    }
                    _ => highest = Some((index, snippet.template.id.as_str())),
                }
            }
        }
    }

    let user: HashSet<String> = user_tokens.iter().map(|t| t.to_lowercase()).collect();
    let mut produced: HashSet<&str> = HashSet::new();
    for snippet in snippets {
        for input in &snippet.inputs {
            let bound = chain
                .and_then(|c| c.bindings.get(input))
                .map(String::as_str)
                .unwrap_or(input.as_str());
            let satisfied = produced.contains(input.as_str())
                || produced.contains(bound)
                || user.contains(&input.to_lowercase())
                || is_external(input);
            if !satisfied {
                violations.push(CompositionViolation {
                    kind: ViolationKind::UnsatisfiedInput,
                    snippet_id: snippet.template.id.clone(),
                    message: format!(
                        "Input {} of snippet {} is not produced by an earlier snippet",
                        input, snippet.template.id
                    ),
                    suggestion: Some(format!("Add a snippet producing {input} before {}", snippet.template.id)),
                });
            }
        }
        produced.extend(snippet.outputs.iter().map(String::as_str));
    }

    CompositionReport {
        valid: violations.is_empty(),
        violations,
    }
}
