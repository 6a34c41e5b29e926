//! sqlgate orchestrator
//!
//! Routes a natural-language question either through an approved template or
//! through discovery and full generation, puts the generated SQL through the
//! guardrails, and only then executes it. Collaborators (discovery, generation,
//! execution) sit behind the traits in [`services`].

pub mod clarification;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod services;
pub mod trace;
pub mod types;

pub use clarification::{
    ClarificationAnswer, ClarificationEntry, ClarificationOption, ClarificationReply,
    ClarificationRequest, CUSTOM_OPTION, REMOVE_OPTION,
};
pub use config::OrchestratorConfig;
pub use error::{CollaboratorError, OrchestrationError};
pub use orchestrator::{AskRequest, ExecutionMode, OrchestrationResult, Orchestrator};
pub use services::{DiscoveryService, GenerationService, QueryExecutor};
pub use trace::{Stage, StepStatus, Trace, TraceStep};
pub use types::*;
