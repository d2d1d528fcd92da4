//! Structured collection plans.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Who produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    /// The external planner answered.
    Planner,
    /// The planner was unreachable; derived from text heuristics.
    Heuristic,
}

/// Output of the planner: how much to collect from each source and how.
///
/// Immutable once stored, except for per-source expansion of
/// `query_strategy` when a stage under-delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Target item count per source.
    pub target_counts: BTreeMap<String, u32>,
    /// Source-specific query parameters, opaque to the orchestrator.
    #[serde(default)]
    pub query_strategy: BTreeMap<String, serde_json::Value>,
    /// Search terms extracted from the instruction.
    #[serde(default)]
    pub search_terms: Vec<String>,
    pub origin: PlanOrigin,
}

impl Plan {
    /// Create an empty plan.
    pub fn new(origin: PlanOrigin) -> Self {
        Self {
            target_counts: BTreeMap::new(),
            query_strategy: BTreeMap::new(),
            search_terms: Vec::new(),
            origin,
        }
    }

    /// Set a source's target.
    pub fn with_target(mut self, source: impl Into<String>, target: u32) -> Self {
        self.target_counts.insert(source.into(), target);
        self
    }

    /// Set search terms.
    pub fn with_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_terms = terms.into_iter().map(Into::into).collect();
        self
    }

    /// Target for a source; zero when the plan does not mention it.
    pub fn target_for(&self, source: &str) -> u32 {
        self.target_counts.get(source).copied().unwrap_or(0)
    }

    /// Query strategy for a source, if any.
    pub fn strategy_for(&self, source: &str) -> Option<&serde_json::Value> {
        self.query_strategy.get(source)
    }

    /// Replace a source's query strategy.
    pub fn set_strategy(&mut self, source: impl Into<String>, strategy: serde_json::Value) {
        self.query_strategy.insert(source.into(), strategy);
    }
}
