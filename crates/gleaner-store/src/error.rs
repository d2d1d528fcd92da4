use gleaner_types::RunId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error("Run already exists: {0}")]
    AlreadyExists(RunId),

    /// The stored version moved on since this state was loaded.
    #[error("Checkpoint conflict on run {run_id}: expected version {expected}, found {found}")]
    Conflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this is a lost compare-and-swap race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
