//! Static intent keyword table

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IntentDefinition {
    pub name: &'static str,
    pub keywords: &'static [&'static str],
    /// Whether templates of this intent are built from composable snippets
    pub supports_composition: bool,
}

pub const INTENTS: &[IntentDefinition] = &[
    IntentDefinition {
        name: "temporal_proximity_query",
        keywords: &[
            "weeks", "week", "days", "months", "at", "after", "baseline", "reduction", "healing",
            "timepoint", "since", "within",
        ],
        supports_composition: true,
    },
    IntentDefinition {
        name: "outcome_analysis",
        keywords: &["outcome", "healed", "healing", "rate", "success", "closure", "result"],
        supports_composition: false,
    },
    IntentDefinition {
        name: "cohort_comparison",
        keywords: &["compare", "comparison", "versus", "vs", "between", "cohort", "group"],
        supports_composition: false,
    },
    IntentDefinition {
        name: "aggregation_by_category",
        keywords: &["by", "per", "each", "count", "total", "breakdown", "category", "type"],
        supports_composition: false,
    },
    IntentDefinition {
        name: "trend_analysis",
        keywords: &["trend", "over", "time", "monthly", "weekly", "quarterly", "change"],
        supports_composition: false,
    },
    IntentDefinition {
        name: "assessment_correlation",
        keywords: &["correlation", "correlate", "relationship", "associated", "assessment"],
        supports_composition: false,
    },
    IntentDefinition {
        name: "workflow_status",
        keywords: &["status", "pending", "open", "completed", "workflow", "overdue"],
        supports_composition: false,
    },
    IntentDefinition {
        name: "patient_lookup",
        keywords: &["patient", "patients", "find", "show", "list", "lookup"],
        supports_composition: false,
    },
    IntentDefinition {
        name: "operational_metrics",
        keywords: &["visits", "volume", "utilization", "clinic", "staff", "throughput"],
        supports_composition: false,
    },
];

pub fn intent(name: &str) -> Option<&'static IntentDefinition> {
    INTENTS.iter().find(|i| i.name == name)
}

pub fn intent_keywords(name: &str) -> &'static [&'static str] {
    intent(name).map(|i| i.keywords).unwrap_or(&[])
}

pub fn supports_composition(name: &str) -> bool {
    intent(name).is_some_and(|i| i.supports_composition)
}

pub fn known_intents() -> impl Iterator<Item = &'static str> {
    INTENTS.iter().map(|i| i.name)
}
