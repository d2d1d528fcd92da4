//! Planner interface and the heuristic fallback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gleaner_types::{Plan, PlanOrigin};
use tracing::warn;

use crate::collector::SourceInfo;
use crate::error::Result;

/// Turns a free-form instruction into a structured plan.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, instruction: &str, sources: &[SourceInfo]) -> Result<Plan>;
}

const STOPWORDS: &[&str] = &[
    "about", "all", "and", "any", "are", "can", "collect", "each", "fetch", "find", "for",
    "from", "gather", "get", "into", "me", "most", "of", "on", "per", "please", "some", "than",
    "that", "the", "their", "them", "this", "with",
];

/// Count units that apply to every source ("50 items").
const GENERIC_UNITS: &[&str] = &["items", "results", "posts", "articles", "entries", "records"];

// ─────────────────────────────────────────────────────────────────────────────
// Heuristic Planner
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic planner built on simple text heuristics.
///
/// - `N <source>` sets that source's target ("20 news")
/// - `N items` (or results, posts, ...) sets every other source's target
/// - remaining words of three letters or more become search terms
#[derive(Debug, Clone, Default)]
pub struct HeuristicPlanner;

impl HeuristicPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Build the plan synchronously.
    pub fn plan_sync(&self, instruction: &str, sources: &[SourceInfo]) -> Plan {
        let tokens: Vec<String> = instruction
            .split_whitespace()
            .map(|t| {
                t.trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
                    .to_lowercase()
            })
            .filter(|t| !t.is_empty())
            .collect();

        let mut explicit: BTreeMap<String, u32> = BTreeMap::new();
        let mut global = None;
        for pair in tokens.windows(2) {
            let Ok(count) = pair[0].parse::<u32>() else {
                continue;
            };
            if let Some(source) = source_for(sources, &pair[1]) {
                explicit.insert(source.name.clone(), count);
            } else if GENERIC_UNITS.contains(&pair[1].as_str()) {
                global = Some(count);
            }
        }

        let mut terms: Vec<String> = Vec::new();
        for token in &tokens {
            let skip = token.len() < 3
                || token.parse::<u64>().is_ok()
                || STOPWORDS.contains(&token.as_str())
                || GENERIC_UNITS.contains(&token.as_str())
                || source_for(sources, token).is_some()
                || terms.contains(token);
            if !skip {
                terms.push(token.clone());
            }
        }

        let mut plan = Plan::new(PlanOrigin::Heuristic).with_terms(terms);
        for source in sources {
            let target = explicit
                .get(&source.name)
                .copied()
                .or(global)
                .unwrap_or(source.default_target);
            plan.target_counts.insert(source.name.clone(), target);
        }
        plan
    }
}

/// Source named by `token`, accepting a plural form.
fn source_for<'a>(sources: &'a [SourceInfo], token: &str) -> Option<&'a SourceInfo> {
    sources
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(token))
        .or_else(|| {
            let singular = token.strip_suffix('s')?;
            sources.iter().find(|s| s.name.eq_ignore_ascii_case(singular))
        })
}

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(&self, instruction: &str, sources: &[SourceInfo]) -> Result<Plan> {
        Ok(self.plan_sync(instruction, sources))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fallback Planner
// ─────────────────────────────────────────────────────────────────────────────

/// Asks a primary planner and falls back to heuristics when it errors or
/// does not answer within the timeout. Never fails.
pub struct FallbackPlanner {
    primary: Arc<dyn Planner>,
    fallback: HeuristicPlanner,
    timeout: Duration,
}

impl FallbackPlanner {
    pub fn new(primary: Arc<dyn Planner>, timeout: Duration) -> Self {
        Self {
            primary,
            fallback: HeuristicPlanner::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Planner for FallbackPlanner {
    async fn plan(&self, instruction: &str, sources: &[SourceInfo]) -> Result<Plan> {
        match tokio::time::timeout(self.timeout, self.primary.plan(instruction, sources)).await {
            Ok(Ok(plan)) => return Ok(plan),
            Ok(Err(e)) => warn!(error = %e, "Planner failed, using heuristic plan"),
            Err(_) => warn!(
                timeout_ms = self.timeout.as_millis() as u64,
                "Planner timed out, using heuristic plan"
            ),
        }
        Ok(self.fallback.plan_sync(instruction, sources))
    }
}
