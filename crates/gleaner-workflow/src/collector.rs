//! Stage collector contract and the ordered registry of collectors.
//!
//! A collector fetches items from one source. It is pure with respect to run
//! state: cursors, dedup ledgers and counters all live in `RunState` and are
//! maintained by the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use gleaner_types::{Availability, OutputRow, Plan, RawItem, SourceAvailability, now};

use crate::error::{Result, SourceError, WorkflowError};

/// Target used when neither the plan nor the source configuration gives one.
pub const DEFAULT_TARGET: u32 = 25;

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectPage {
    pub items: Vec<RawItem>,
    /// Cursor to resume after this page.
    pub next_cursor: Option<String>,
    /// Whether the source has more pages for the current query.
    pub has_more: bool,
}

impl CollectPage {
    /// A final page.
    pub fn last(items: Vec<RawItem>) -> Self {
        Self {
            items,
            next_cursor: None,
            has_more: false,
        }
    }
}

/// What the planner needs to know about a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub name: String,
    pub default_target: u32,
}

/// One data source.
#[async_trait]
pub trait StageCollector: Send + Sync {
    /// Source name; also the stage name.
    fn name(&self) -> &str;

    /// Whether the source is configured and authorized.
    fn usable(&self) -> Availability;

    /// Target when the plan gives none.
    fn default_target(&self) -> u32 {
        DEFAULT_TARGET
    }

    /// Fetch up to `max_items` items after `cursor`.
    async fn collect(
        &self,
        plan: &Plan,
        cursor: Option<&str>,
        max_items: usize,
    ) -> std::result::Result<CollectPage, SourceError>;

    /// Widen the query after the source ran dry below target.
    ///
    /// Returns `None` when the query cannot be widened any further.
    fn expand(&self, plan: &Plan, collected: u32, target: u32) -> Option<Plan>;

    /// Map a raw item to an output row.
    fn normalize(&self, item: &RawItem) -> OutputRow {
        OutputRow {
            source: self.name().to_string(),
            item_id: item.id.clone(),
            fields: item.payload.clone(),
            collected_at: now(),
        }
    }

    /// Refresh expired credentials. Returns whether a retry makes sense.
    async fn refresh_credentials(&self) -> bool {
        false
    }
}

/// Registered collectors in stage order.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: Vec<Arc<dyn StageCollector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a collector as the next stage. Names must be unique.
    pub fn register(&mut self, collector: Arc<dyn StageCollector>) -> Result<()> {
        if self.get(collector.name()).is_some() {
            return Err(WorkflowError::Config(format!(
                "duplicate collector for source '{}'",
                collector.name()
            )));
        }
        self.collectors.push(collector);
        Ok(())
    }

    /// Builder-style register.
    pub fn with(mut self, collector: Arc<dyn StageCollector>) -> Result<Self> {
        self.register(collector)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn StageCollector>> {
        self.collectors.iter().find(|c| c.name() == name)
    }

    /// Stage order.
    pub fn names(&self) -> Vec<String> {
        self.collectors.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn source_infos(&self) -> Vec<SourceInfo> {
        self.collectors
            .iter()
            .map(|c| SourceInfo {
                name: c.name().to_string(),
                default_target: c.default_target(),
            })
            .collect()
    }

    /// Ask every collector whether it is usable, right now.
    pub fn snapshot(&self) -> SourceAvailability {
        let mut availability = SourceAvailability::new();
        for collector in &self.collectors {
            availability.insert(collector.name(), collector.usable());
        }
        availability
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}
