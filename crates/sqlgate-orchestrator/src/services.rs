//! Collaborator seams: discovery, generation and query execution

use crate::error::CollaboratorError;
use crate::types::{
    ContextBundle, GenerationRequest, GenerationResponse, PlaceholderFill, QueryResult, Question,
    ResidualExtraction,
};
use async_trait::async_trait;
use sqlgate_catalog::Template;
use sqlgate_guardrail::MergedFilterState;
use tokio_util::sync::CancellationToken;

/// Semantic discovery: candidate fields, joins and terminology for a question
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn discover(
        &self,
        question: &Question,
        cancel: &CancellationToken,
    ) -> Result<ContextBundle, CollaboratorError>;
}

/// Text generation: SQL, placeholder values and residual filters
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, CollaboratorError>;

    /// `cancel` fires as soon as the fill succeeds and the template path is
    /// committed; speculative work for the fallback path should watch it.
    async fn fill_placeholders(
        &self,
        question: &Question,
        template: &Template,
        cancel: &CancellationToken,
    ) -> Result<PlaceholderFill, CollaboratorError>;

    /// Constraints in the question not already captured by `known`
    async fn extract_filters(
        &self,
        question: &Question,
        known: &MergedFilterState,
        cancel: &CancellationToken,
    ) -> Result<ResidualExtraction, CollaboratorError>;
}

/// The only path SQL takes to a database
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute_query(&self, customer_id: &str, sql: &str) -> Result<QueryResult, CollaboratorError>;
}
