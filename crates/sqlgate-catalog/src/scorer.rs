//! Lexical template scoring
//!
//! Four weighted signals, each in [0, 1]: example similarity, keyword overlap,
//! tag/concept overlap and intent keyword overlap. The total is capped at 1.0.

use crate::intents::intent_keywords;
use crate::template::{CatalogEntry, Template};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "for", "with", "in", "on", "to", "and", "or", "our", "me", "my",
    "show", "list", "give", "what", "which", "who", "how", "many", "is", "are", "was", "were",
    "all", "from", "that", "this", "have", "has", "do", "does",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub example: f64,
    pub keyword: f64,
    pub tag: f64,
    pub intent: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            example: 0.25,
            keyword: 0.50,
            tag: 0.10,
            intent: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub example: f64,
    pub keyword: f64,
    pub tag: f64,
    pub intent: f64,
    pub total: f64,
    pub matched_keywords: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateMatch<'a> {
    pub entry: &'a CatalogEntry,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

impl TemplateMatch<'_> {
    pub fn template(&self) -> &Template {
        self.entry.template()
    }
}

/// Question text split into comparable forms
struct Question {
    normalized: String,
    tokens: Vec<String>,
    concepts: HashSet<String>,
}

impl Question {
    fn new(text: &str) -> Self {
        let tokens = tokenize(text);
        let content: Vec<&String> = tokens
            .iter()
            .filter(|t| !STOPWORDS.contains(&t.as_str()))
            .collect();

        let mut concepts: HashSet<String> = content.iter().map(|t| t.to_string()).collect();
        for pair in content.windows(2) {
            concepts.insert(format!("{}_{}", pair[0], pair[1]));
        }

        Self {
            normalized: tokens.join(" "),
            tokens,
            concepts,
        }
    }

    /// Word or phrase match, tolerant of plural forms
    fn contains(&self, keyword: &str) -> bool {
        let words = tokenize(keyword);
        if words.is_empty() || words.len() > self.tokens.len() {
            return false;
        }
        self.tokens
            .windows(words.len())
            .any(|window| window.iter().zip(&words).all(|(t, w)| same_word(t, w)))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn same_word(a: &str, b: &str) -> bool {
    let plural = |long: &str, short: &str| {
        long.strip_suffix("es") == Some(short) || long.strip_suffix('s') == Some(short)
    };
    a == b || plural(a, b) || plural(b, a)
}

#[derive(Debug, Clone, Default)]
pub struct TemplateScorer {
    weights: ScoreWeights,
}

impl TemplateScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    pub fn score(&self, question: &str, template: &Template) -> ScoreBreakdown {
        self.score_question(&Question::new(question), template)
    }

    fn score_question(&self, question: &Question, template: &Template) -> ScoreBreakdown {
        let example = example_similarity(question, &template.examples);
        let (keyword, matched_keywords) = keyword_overlap(question, &template.keywords);
        let tag = tag_overlap(question, &template.tags);
        let intent = intent_overlap(question, intent_keywords(&template.intent));

        let total = (self.weights.example * example
            + self.weights.keyword * keyword
            + self.weights.tag * tag
            + self.weights.intent * intent)
            .min(1.0);

        ScoreBreakdown {
            example,
            keyword,
            tag,
            intent,
            total,
            matched_keywords,
        }
    }

    /// Score approved entries, best first. Entries scoring zero are dropped.
    pub fn rank<'a, I>(&self, question: &str, entries: I) -> Vec<TemplateMatch<'a>>
    where
        I: IntoIterator<Item = &'a CatalogEntry>,
    {
        let question = Question::new(question);
        let mut matches: Vec<TemplateMatch<'a>> = entries
            .into_iter()
            .filter(|e| e.template().is_approved())
            .filter_map(|entry| {
                let breakdown = self.score_question(&question, entry.template());
                (breakdown.total > 0.0).then_some(TemplateMatch {
                    entry,
                    score: breakdown.total,
                    breakdown,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.id().cmp(b.entry.id()))
        });
        debug!(candidates = matches.len(), "Templates ranked");
        matches
    }

    pub fn best_match<'a, I>(&self, question: &str, entries: I) -> Option<TemplateMatch<'a>>
    where
        I: IntoIterator<Item = &'a CatalogEntry>,
    {
        self.rank(question, entries).into_iter().next()
    }
}

fn example_similarity(question: &Question, examples: &[String]) -> f64 {
    let best = examples
        .iter()
        .map(|e| strsim::normalized_levenshtein(&question.normalized, &tokenize(e).join(" ")))
        .fold(0.0_f64, f64::max);

    if best >= 0.9 {
        1.0
    } else if best >= 0.5 {
        best
    } else {
        0.0
    }
}

fn keyword_overlap(question: &Question, keywords: &[String]) -> (f64, usize) {
    if keywords.is_empty() {
        return (0.0, 0);
    }
    let matched = keywords.iter().filter(|k| question.contains(k)).count();
    let mut score = (matched as f64 / keywords.len() as f64).sqrt();
    if matched >= 3 {
        score = score.max(0.8);
    } else if matched >= 2 {
        score = score.max(0.6);
    }
    (score.clamp(0.0, 1.0), matched)
}

fn tag_overlap(question: &Question, tags: &[String]) -> f64 {
    let tags: HashSet<String> = tags
        .iter()
        .map(|t| t.to_lowercase().replace([' ', '-'], "_"))
        .filter(|t| t != "snippet" && t != "fragment")
        .collect();
    if tags.is_empty() {
        return 0.0;
    }
    let intersection = tags.intersection(&question.concepts).count();
    let union = tags.union(&question.concepts).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn intent_overlap(question: &Question, keywords: &[&str]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let matched = keywords.iter().filter(|k| question.contains(k)).count();
    (matched as f64 / keywords.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plural_and_phrase_matching() {
        let q = Question::new("Show wound area reductions over 12 weeks");
        assert!(q.contains("week"));
        assert!(q.contains("reduction"));
        assert!(q.contains("wound area"));
        assert!(!q.contains("area wound"));
    }

    #[test]
    fn test_keyword_floors() {
        let q = Question::new("area reduction weeks");
        let keywords: Vec<String> = ["area", "reduction", "weeks", "a", "b", "c", "d", "e", "f", "g"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (score, matched) = keyword_overlap(&q, &keywords);
        assert_eq!(matched, 3);
        assert!((score - 0.8).abs() < 1e-9);

        let (score, matched) = keyword_overlap(&q, &keywords[1..]);
        assert_eq!(matched, 2);
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_example_similarity_bands() {
        let q = Question::new("patients healed within 12 weeks");
        assert_eq!(example_similarity(&q, &["Patients healed within 12 weeks?".to_string()]), 1.0);
        assert_eq!(example_similarity(&q, &["total clinic revenue".to_string()]), 0.0);
        assert_eq!(example_similarity(&q, &[]), 0.0);
    }

    #[test]
    fn test_tag_jaccard() {
        let q = Question::new("wound area healing");
        let score = tag_overlap(&q, &["wound_area".to_string(), "snippet".to_string()]);
        assert!(score > 0.0 && score <= 1.0);
        assert_eq!(tag_overlap(&q, &["billing".to_string()]), 0.0);
    }
}
