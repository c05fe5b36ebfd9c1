//! Typed error hierarchy for the round-table engine.
//!
//! Two top-level enums:
//! - `DiscussionError`: lifecycle, roster, phase and persistence failures
//! - `GenerationError`: failures reported by a text-generation backend

use thiserror::Error;
use uuid::Uuid;

use crate::roundtable::models::DiscussionStatus;

/// Errors surfaced by the discussion orchestration engine.
#[derive(Debug, Error)]
pub enum DiscussionError {
    #[error("Round table {id} not found")]
    NotFound { id: Uuid },

    #[error("Agent {id} not found")]
    AgentNotFound { id: Uuid },

    #[error("Round table {id} has no participants")]
    EmptyRoster { id: Uuid },

    #[error("Cannot {operation} round table {id}: status is {status}")]
    InvalidState {
        id: Uuid,
        status: DiscussionStatus,
        operation: &'static str,
    },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No saved conversation state found for round table {id}")]
    MissingState { id: Uuid },

    #[error("Duplicate participant display name '{name}' in round table {id}")]
    DuplicateDisplayName { id: Uuid, name: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Error running discussion {id} at turn {turn}: {source}")]
    GenerationFailure {
        id: Uuid,
        turn: u32,
        #[source]
        source: GenerationError,
    },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl DiscussionError {
    /// True for errors that mean the addressed record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::AgentNotFound { .. } | Self::EmptyRoster { .. }
        )
    }

    /// True for errors caused by the caller's request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::InvalidTransition { .. }
                | Self::MissingState { .. }
                | Self::DuplicateDisplayName { .. }
                | Self::InvalidConfig(_)
        )
    }
}

/// Database closures return `anyhow::Result`; typed errors raised inside them
/// are recovered here, everything else is a storage failure.
impl From<anyhow::Error> for DiscussionError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<DiscussionError>() {
            Ok(typed) => typed,
            Err(other) => Self::Database(other),
        }
    }
}

/// Errors from a text-generation backend.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Generation backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Generation backend returned no content")]
    EmptyResponse,

    #[error("Failed to decode generation response: {0}")]
    Decode(String),

    #[error("Generation backend unavailable: {0}")]
    Unavailable(String),
}
