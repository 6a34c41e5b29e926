//! sqlgate template catalog
//!
//! Versioned templates and composable snippets, the static intent and chain
//! tables, and the lexical scorer that matches questions to templates.

pub mod catalog;
pub mod chains;
pub mod intents;
pub mod scorer;
pub mod template;

pub use catalog::{CatalogError, LoadReport, SkippedEntry, TemplateCatalog};
pub use chains::{builtin_chains, ChainRegistry, ChainStep, CompositionChain};
pub use intents::{intent_keywords, known_intents, supports_composition, IntentDefinition, INTENTS};
pub use scorer::{ScoreBreakdown, ScoreWeights, TemplateMatch, TemplateScorer};
pub use template::{
    ApprovalStatus, CatalogEntry, Placeholder, PlaceholderType, RenderError, Snippet, Template,
};
