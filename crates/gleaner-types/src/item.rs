//! Items flowing from collectors to the output sink.

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// An item exactly as a stage collector returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Source-scoped identifier; the dedup key within a run.
    pub id: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
}

impl RawItem {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// A normalized row destined for the output sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub source: String,
    pub item_id: String,
    pub fields: serde_json::Value,
    pub collected_at: Timestamp,
}
