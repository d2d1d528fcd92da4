//! Scripted collector for tests.
//!
//! Pages are returned exactly as scripted, whatever `max_items` asks for, so
//! tests can exercise over-delivery and pagination overlap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use gleaner_types::{Availability, Plan, RawItem};
use parking_lot::Mutex;
use serde_json::json;

use crate::collector::{CollectPage, DEFAULT_TARGET, StageCollector};
use crate::error::SourceError;

/// A recorded `collect` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub expansion: usize,
    pub cursor: Option<String>,
    pub max_items: usize,
}

/// In-memory collector driven by a script of pages.
///
/// `levels[0]` holds the pages of the original query; each expansion moves
/// to the next level.
pub struct ScriptedCollector {
    name: String,
    availability: Availability,
    default_target: u32,
    levels: Vec<Vec<Vec<RawItem>>>,
    page_delay: Duration,
    queued_failures: Mutex<VecDeque<SourceError>>,
    persistent_failure: Option<SourceError>,
    refresh_succeeds: bool,
    calls: Mutex<Vec<ScriptedCall>>,
    refreshes: AtomicU32,
}

impl ScriptedCollector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            availability: Availability::usable(),
            default_target: DEFAULT_TARGET,
            levels: vec![Vec::new()],
            page_delay: Duration::ZERO,
            queued_failures: Mutex::new(VecDeque::new()),
            persistent_failure: None,
            refresh_succeeds: false,
            calls: Mutex::new(Vec::new()),
            refreshes: AtomicU32::new(0),
        }
    }

    /// Items with the given ids and a small payload.
    pub fn page<I, S>(ids: I) -> Vec<RawItem>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ids.into_iter()
            .map(|id| {
                let id = id.into();
                let payload = json!({ "id": id, "title": format!("item {id}") });
                RawItem::new(id, payload)
            })
            .collect()
    }

    /// Items `{prefix}{n}` for `n` in `range`.
    pub fn numbered(prefix: &str, range: std::ops::Range<usize>) -> Vec<RawItem> {
        Self::page(range.map(|n| format!("{prefix}{n}")))
    }

    /// Pages of the original query.
    pub fn with_pages(mut self, pages: Vec<Vec<RawItem>>) -> Self {
        self.levels[0] = pages;
        self
    }

    /// Pages served after one more expansion.
    pub fn with_expansion_pages(mut self, pages: Vec<Vec<RawItem>>) -> Self {
        self.levels.push(pages);
        self
    }

    pub fn unusable(mut self, reason: impl Into<String>) -> Self {
        self.availability = Availability::unusable(reason);
        self
    }

    pub fn with_default_target(mut self, target: u32) -> Self {
        self.default_target = target;
        self
    }

    /// Simulated latency of every page fetch.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Every call fails with `error`.
    pub fn failing(mut self, error: SourceError) -> Self {
        self.persistent_failure = Some(error);
        self
    }

    /// Whether `refresh_credentials` succeeds.
    pub fn with_refresh(mut self, succeeds: bool) -> Self {
        self.refresh_succeeds = succeeds;
        self
    }

    /// The next call fails with `error` before any page is served.
    pub fn fail_next(&self, error: SourceError) {
        self.queued_failures.lock().push_back(error);
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().clone()
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn level_of(&self, plan: &Plan) -> usize {
        plan.strategy_for(&self.name)
            .and_then(|s| s.get("expansion"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(0)
    }
}

#[async_trait]
impl StageCollector for ScriptedCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn usable(&self) -> Availability {
        self.availability.clone()
    }

    fn default_target(&self) -> u32 {
        self.default_target
    }

    async fn collect(
        &self,
        plan: &Plan,
        cursor: Option<&str>,
        max_items: usize,
    ) -> Result<CollectPage, SourceError> {
        let expansion = self.level_of(plan);
        self.calls.lock().push(ScriptedCall {
            expansion,
            cursor: cursor.map(str::to_string),
            max_items,
        });

        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        if let Some(err) = self.queued_failures.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = &self.persistent_failure {
            return Err(err.clone());
        }

        let pages = self.levels.get(expansion).map(Vec::as_slice).unwrap_or(&[]);
        let index = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| SourceError::invalid_response(format!("bad cursor '{c}'")))?,
            None => 0,
        };

        let Some(items) = pages.get(index) else {
            return Ok(CollectPage::last(Vec::new()));
        };
        let has_more = index + 1 < pages.len();
        Ok(CollectPage {
            items: items.clone(),
            next_cursor: Some((index + 1).to_string()),
            has_more,
        })
    }

    fn expand(&self, plan: &Plan, _collected: u32, _target: u32) -> Option<Plan> {
        let next = self.level_of(plan) + 1;
        if next >= self.levels.len() {
            return None;
        }
        let mut expanded = plan.clone();
        expanded.set_strategy(self.name.clone(), json!({ "expansion": next }));
        Some(expanded)
    }

    async fn refresh_credentials(&self) -> bool {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.refresh_succeeds
    }
}
