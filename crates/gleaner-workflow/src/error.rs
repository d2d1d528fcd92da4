//! Error types for the workflow crate.

use std::time::Duration;

use gleaner_store::StoreError;
use gleaner_types::{RunId, RunStatus, TypesError};
use thiserror::Error;

/// Result type alias using the workflow error type.
pub type Result<T> = std::result::Result<T, WorkflowError>;

// ─────────────────────────────────────────────────────────────────────────────
// Source Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Message fragments that mark a failure as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
    "try again",
];

/// Message fragments that mark a credential problem.
const CREDENTIAL_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid_grant",
    "invalid credentials",
    "authentication",
    "access denied",
];

/// Message fragments that mark an expired bearer token.
const TOKEN_EXPIRED_PATTERNS: &[&str] = &["token expired", "expired token", "invalid_token"];

/// Broad category of a collector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Non-success status from the remote side.
    Http,
    /// Could not reach the remote side.
    Network,
    /// Rate limit hit.
    RateLimited,
    /// Credentials rejected.
    Auth,
    /// Bearer token expired; one refresh may fix it.
    TokenExpired,
    /// The source answered with something unusable.
    InvalidResponse,
    Other,
}

impl std::fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::Network => "network",
            Self::RateLimited => "rate limited",
            Self::Auth => "auth",
            Self::TokenExpired => "token expired",
            Self::InvalidResponse => "invalid response",
            Self::Other => "error",
        };
        f.write_str(s)
    }
}

/// A classified failure reported by a stage collector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct SourceError {
    pub kind: SourceErrorKind,
    /// HTTP-style status, when the source has one.
    pub status: Option<u16>,
    pub message: String,
    /// How long the source asked us to wait, if it said.
    pub retry_after: Option<Duration>,
}

impl SourceError {
    fn new(kind: SourceErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Non-success status code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => SourceErrorKind::Auth,
            429 => SourceErrorKind::RateLimited,
            _ => SourceErrorKind::Http,
        };
        Self::new(kind, Some(status), message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Network, None, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(SourceErrorKind::RateLimited, Some(429), message)
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Auth, None, message)
    }

    pub fn token_expired(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::TokenExpired, Some(401), message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::InvalidResponse, None, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Other, None, message)
    }

    fn message_matches(&self, patterns: &[&str]) -> bool {
        let message = self.message.to_lowercase();
        patterns.iter().any(|p| message.contains(p))
    }

    /// Whether the token has expired (eligible for one refresh-and-retry).
    pub fn is_token_expired(&self) -> bool {
        self.kind == SourceErrorKind::TokenExpired || self.message_matches(TOKEN_EXPIRED_PATTERNS)
    }

    /// Authorization or credential failure. Never retried by backoff.
    pub fn is_credential_error(&self) -> bool {
        matches!(self.kind, SourceErrorKind::Auth | SourceErrorKind::TokenExpired)
            || matches!(self.status, Some(401) | Some(403))
            || self.message_matches(CREDENTIAL_PATTERNS)
            || self.is_token_expired()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == SourceErrorKind::RateLimited || self.status == Some(429)
    }

    /// Default retryability: timeouts, rate limits, server errors and
    /// transient-looking messages. Credential errors are excluded even when
    /// their message looks transient.
    pub fn is_retryable(&self) -> bool {
        if self.is_credential_error() {
            return false;
        }
        if matches!(
            self.kind,
            SourceErrorKind::Network | SourceErrorKind::RateLimited
        ) {
            return true;
        }
        if let Some(status) = self.status
            && (status == 408 || status == 429 || (500..=599).contains(&status))
        {
            return true;
        }
        self.message_matches(TRANSIENT_PATTERNS)
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
                SourceError::network(err.to_string())
            }
            ErrorKind::PermissionDenied => SourceError::auth(err.to_string()),
            _ => SourceError::other(err.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The host would exceed its pending-timer quota.
    #[error("Timer quota exhausted: {armed} of {capacity} timers armed")]
    QuotaExceeded { armed: usize, capacity: usize },

    /// The delivery channel is gone.
    #[error("Timer host is shut down")]
    Closed,
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflow Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for orchestrator operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Precondition: nothing to collect from.
    #[error("No usable sources: {}", .details.join("; "))]
    NoUsableSources { details: Vec<String> },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// Operation not legal in the run's current status.
    #[error("Cannot {operation} run {run_id} in status {status}")]
    InvalidState {
        run_id: RunId,
        status: RunStatus,
        operation: &'static str,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("State error: {0}")]
    State(#[from] TypesError),

    #[error("Source {source_name} failed: {error}")]
    Source {
        source_name: String,
        error: SourceError,
    },

    #[error("Output sink error: {0}")]
    Sink(String),

    #[error("Artifact store error: {0}")]
    Artifact(String),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkflowError {
    /// A checkpoint save lost a compare-and-swap race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage Failures
// ─────────────────────────────────────────────────────────────────────────────

/// Why a stage routine stopped without an outcome.
#[derive(Debug, Error)]
pub enum StageFailure {
    /// The source itself failed after retries. The stage is recorded as
    /// failed and the run moves on.
    #[error("Source {source_name} failed: {error}")]
    Source {
        source_name: String,
        error: SourceError,
    },

    /// Infrastructure failed; the run cannot continue.
    #[error(transparent)]
    Run(#[from] WorkflowError),
}

impl From<StoreError> for StageFailure {
    fn from(err: StoreError) -> Self {
        Self::Run(err.into())
    }
}

impl From<TypesError> for StageFailure {
    fn from(err: TypesError) -> Self {
        Self::Run(err.into())
    }
}
