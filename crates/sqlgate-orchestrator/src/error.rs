//! Typed orchestration failures

use crate::trace::{Stage, Trace};
use sqlgate_guardrail::SqlValidationResult;
use std::fmt;
use thiserror::Error;

/// Failure reported by an external collaborator
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Every variant carries the trace collected up to the failure
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Cancelled before {stage}")]
    Cancelled { stage: Stage, trace: Trace },

    #[error("Generated SQL rejected: {}", reasons.join("; "))]
    ValidationRejected {
        sql: String,
        reasons: Vec<String>,
        validation: Box<SqlValidationResult>,
        trace: Trace,
    },

    #[error("{service} failed during {stage}: {source}")]
    Collaborator {
        stage: Stage,
        service: &'static str,
        #[source]
        source: CollaboratorError,
        trace: Trace,
    },

    #[error("Query execution failed: {source}")]
    Execution {
        sql: String,
        #[source]
        source: CollaboratorError,
        trace: Trace,
    },

    #[error("Internal error during {stage}: {message}")]
    Internal {
        stage: Stage,
        message: String,
        trace: Trace,
    },
}

impl OrchestrationError {
    pub fn stage(&self) -> Stage {
        match self {
            OrchestrationError::Cancelled { stage, .. }
            | OrchestrationError::Collaborator { stage, .. }
            | OrchestrationError::Internal { stage, .. } => *stage,
            OrchestrationError::ValidationRejected { .. } => Stage::Validation,
            OrchestrationError::Execution { .. } => Stage::Execution,
        }
    }

    pub fn trace(&self) -> &Trace {
        match self {
            OrchestrationError::Cancelled { trace, .. }
            | OrchestrationError::ValidationRejected { trace, .. }
            | OrchestrationError::Collaborator { trace, .. }
            | OrchestrationError::Execution { trace, .. }
            | OrchestrationError::Internal { trace, .. } => trace,
        }
    }

    pub fn validation(&self) -> Option<&SqlValidationResult> {
        match self {
            OrchestrationError::ValidationRejected { validation, .. } => Some(validation.as_ref()),
            _ => None,
        }
    }
}

/// Stage failure before the trace is attached at the outer boundary
#[derive(Debug)]
pub(crate) enum Failure {
    Cancelled(Stage),
    Rejected {
        sql: String,
        validation: Box<SqlValidationResult>,
    },
    Collaborator {
        stage: Stage,
        service: &'static str,
        source: CollaboratorError,
    },
    Execution {
        sql: String,
        source: CollaboratorError,
    },
    Internal {
        stage: Stage,
        message: String,
    },
}

impl Failure {
    pub(crate) fn stage(&self) -> Stage {
        match self {
            Failure::Cancelled(stage)
            | Failure::Collaborator { stage, .. }
            | Failure::Internal { stage, .. } => *stage,
            Failure::Rejected { .. } => Stage::Validation,
            Failure::Execution { .. } => Stage::Execution,
        }
    }

    pub(crate) fn into_error(self, trace: Trace) -> OrchestrationError {
        match self {
            Failure::Cancelled(stage) => OrchestrationError::Cancelled { stage, trace },
            Failure::Rejected { sql, validation } => OrchestrationError::ValidationRejected {
                reasons: validation.blocking_reasons(),
                sql,
                validation,
                trace,
            },
            Failure::Collaborator {
                stage,
                service,
                source,
            } => OrchestrationError::Collaborator {
                stage,
                service,
                source,
                trace,
            },
            Failure::Execution { sql, source } => OrchestrationError::Execution { sql, source, trace },
            Failure::Internal { stage, message } => OrchestrationError::Internal {
                stage,
                message,
                trace,
            },
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Cancelled(stage) => write!(f, "cancelled before {stage}"),
            Failure::Rejected { validation, .. } => {
                write!(f, "SQL rejected: {}", validation.blocking_reasons().join("; "))
            }
            Failure::Collaborator { service, source, .. } => write!(f, "{service} failed: {source}"),
            Failure::Execution { source, .. } => write!(f, "execution failed: {source}"),
            Failure::Internal { message, .. } => f.write_str(message),
        }
    }
}
