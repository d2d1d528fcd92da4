//! Error types for run state manipulation.

use thiserror::Error;

/// Result type alias for type-level operations.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised when a run state would be put in an invalid shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// The requested status change is not an edge of the run state machine.
    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    /// A run id could not be parsed.
    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    /// A stage name is not part of the run's stage order.
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
}
