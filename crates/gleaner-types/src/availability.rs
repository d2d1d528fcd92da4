//! Source availability snapshots.
//!
//! Whether a source is usable is decided once, when a run starts (or is
//! retried), and the snapshot travels with the run. The precondition check and
//! the later skip decisions therefore always agree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Availability of a single source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Whether the source is configured and authorized.
    pub usable: bool,
    /// Why the source is unusable (e.g. which setting is missing).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

impl Availability {
    /// A usable source.
    pub fn usable() -> Self {
        Self {
            usable: true,
            reason: None,
        }
    }

    /// An unusable source with an actionable reason.
    pub fn unusable(reason: impl Into<String>) -> Self {
        Self {
            usable: false,
            reason: Some(reason.into()),
        }
    }
}

/// Snapshot of every known source's availability, keyed by source name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceAvailability {
    sources: BTreeMap<String, Availability>,
}

impl SourceAvailability {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a source's availability.
    pub fn insert(&mut self, source: impl Into<String>, availability: Availability) {
        self.sources.insert(source.into(), availability);
    }

    /// Builder-style insert.
    pub fn with(mut self, source: impl Into<String>, availability: Availability) -> Self {
        self.insert(source, availability);
        self
    }

    /// Whether `source` is known and usable. Unknown sources are unusable.
    pub fn is_usable(&self, source: &str) -> bool {
        self.sources.get(source).is_some_and(|a| a.usable)
    }

    /// Availability entry for a source.
    pub fn get(&self, source: &str) -> Option<&Availability> {
        self.sources.get(source)
    }

    /// True if at least one source is usable.
    pub fn any_usable(&self) -> bool {
        self.sources.values().any(|a| a.usable)
    }

    /// Names of usable sources (sorted).
    pub fn usable_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|(_, a)| a.usable)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Human-readable lines describing every unusable source.
    pub fn unusable_details(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|(_, a)| !a.usable)
            .map(|(name, a)| match &a.reason {
                Some(reason) => format!("{name}: {reason}"),
                None => format!("{name}: not usable"),
            })
            .collect()
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Availability)> {
        self.sources.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
