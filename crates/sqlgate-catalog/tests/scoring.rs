//! Template scoring against catalog entries loaded from disk

use proptest::prelude::*;
use sqlgate_catalog::{
    ApprovalStatus, CatalogEntry, Template, TemplateCatalog, TemplateScorer,
};
use std::io::Write;

fn template(keywords: &[&str]) -> Template {
    Template {
        id: "area_reduction_at_timepoint".to_string(),
        name: "Area reduction at timepoint".to_string(),
        version: 1,
        intent: "temporal_proximity_query".to_string(),
        description: None,
        sql: "SELECT 1".to_string(),
        placeholders: vec![],
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        tags: vec![],
        examples: vec![],
        status: ApprovalStatus::Approved,
    }
}

#[test]
fn test_area_reduction_question_clears_template_threshold() {
    let scorer = TemplateScorer::default();
    let breakdown = scorer.score(
        "Show patients with 30% area reduction at 12 weeks",
        &template(&["area", "reduction", "weeks"]),
    );
    assert_eq!(breakdown.matched_keywords, 3);
    assert!(breakdown.total >= 0.35, "score {}", breakdown.total);
    assert!(breakdown.total <= 1.0);
}

#[test]
fn test_no_signal_scores_zero() {
    let scorer = TemplateScorer::default();
    let mut t = template(&["invoice", "billing"]);
    t.intent = "not_a_known_intent".to_string();
    let breakdown = scorer.score("Show patients with 30% area reduction at 12 weeks", &t);
    assert_eq!(breakdown.total, 0.0);
}

#[test]
fn test_empty_or_unapproved_catalog_has_no_match() {
    let scorer = TemplateScorer::default();
    let empty = TemplateCatalog::new();
    assert!(scorer.best_match("area reduction at 12 weeks", empty.approved()).is_none());

    let mut draft = template(&["area", "reduction", "weeks"]);
    draft.status = ApprovalStatus::Draft;
    let entries = [CatalogEntry::Template(draft)];
    assert!(scorer.best_match("area reduction at 12 weeks", entries.iter()).is_none());
}

#[test]
fn test_rank_prefers_closer_template_from_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
- id: area_reduction_at_timepoint
  intent: temporal_proximity_query
  status: approved
  sql: "SELECT * FROM wound_area WHERE weeks = {{{{weeks}}}}"
  placeholders:
    - name: weeks
      type: int
  keywords: [area, reduction, weeks]
  examples: ["patients with 50% area reduction at 4 weeks"]
- id: visits_by_clinic
  intent: operational_metrics
  status: approved
  sql: "SELECT clinic, COUNT(*) FROM visits GROUP BY clinic"
  keywords: [visits, clinic]
"#
    )
    .unwrap();

    let (catalog, report) = TemplateCatalog::load(file.path()).unwrap();
    assert_eq!(report.loaded, 2);

    let scorer = TemplateScorer::default();
    let ranked = scorer.rank("Show patients with 30% area reduction at 12 weeks", catalog.approved());
    assert_eq!(ranked[0].template().id, "area_reduction_at_timepoint");
    assert!(ranked[0].breakdown.example > 0.0);
    assert!(ranked.iter().all(|m| m.score > 0.0));
}

proptest! {
    #[test]
    fn prop_adding_matching_keyword_never_lowers_score(
        base in proptest::sample::subsequence(vec!["invoice", "billing", "area", "clinic", "reduction"], 0..5),
        extra in proptest::sample::select(vec!["area", "reduction", "weeks", "patients", "baseline"]),
    ) {
        let scorer = TemplateScorer::default();
        let question = "Show patients with 30% area reduction at 12 weeks from baseline";
        let before_template = template(&base);
        let mut with_extra = base.clone();
        with_extra.push(extra);
        let after_template = template(&with_extra);

        let before = scorer.score(question, &before_template).total;
        let after = scorer.score(question, &after_template).total;
        prop_assert!(after + 1e-12 >= before, "{before} -> {after}");
    }
}
