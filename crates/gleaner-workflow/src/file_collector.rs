//! JSONL-backed collector.
//!
//! Each line of the input file is one JSON object with an `id` field. The
//! cursor is the line offset to resume from. Items are filtered by keyword:
//! the source's `query_strategy.keywords` when present, else the plan's
//! search terms. An item matches when any keyword appears in its payload.
//! Expansion drops the narrowest (longest) keyword.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gleaner_config::SourceSection;
use gleaner_types::{Availability, Plan, RawItem};
use serde_json::{Value, json};
use tracing::warn;

use crate::collector::{CollectPage, StageCollector};
use crate::error::SourceError;

#[derive(Debug, Clone)]
pub struct FileCollector {
    name: String,
    path: Option<PathBuf>,
    enabled: bool,
    default_target: u32,
}

impl FileCollector {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
            enabled: true,
            default_target: crate::collector::DEFAULT_TARGET,
        }
    }

    /// Build from a `[[sources]]` entry. Relative paths resolve against `base_dir`.
    pub fn from_section(section: &SourceSection, base_dir: &Path) -> Self {
        let path = section.path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                base_dir.join(p)
            }
        });
        Self {
            name: section.name.clone(),
            path,
            enabled: section.enabled,
            default_target: section.default_target,
        }
    }

    pub fn with_default_target(mut self, target: u32) -> Self {
        self.default_target = target;
        self
    }

    /// Active keywords for this source.
    fn keywords(&self, plan: &Plan) -> Vec<String> {
        match plan
            .strategy_for(&self.name)
            .and_then(|s| s.get("keywords"))
            .and_then(Value::as_array)
        {
            Some(list) => list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_lowercase)
                .collect(),
            None => plan.search_terms.iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    fn expansions(&self, plan: &Plan) -> u64 {
        plan.strategy_for(&self.name)
            .and_then(|s| s.get("expansion"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

fn matches(payload: &Value, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let haystack = payload.to_string().to_lowercase();
    keywords.iter().any(|k| haystack.contains(k.as_str()))
}

fn item_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl StageCollector for FileCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn usable(&self) -> Availability {
        if !self.enabled {
            return Availability::unusable(format!(
                "disabled (sources.{}.enabled = false)",
                self.name
            ));
        }
        match &self.path {
            None => Availability::unusable(format!("missing setting sources.{}.path", self.name)),
            Some(path) if !path.is_file() => {
                Availability::unusable(format!("input file not found: {}", path.display()))
            }
            Some(_) => Availability::usable(),
        }
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
        let path = self.path.as_ref().ok_or_else(|| {
            SourceError::other(format!("missing setting sources.{}.path", self.name))
        })?;
        let start = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| SourceError::invalid_response(format!("bad cursor '{c}'")))?,
            None => 0,
        };

        let contents = tokio::fs::read_to_string(path).await?;
        let lines: Vec<&str> = contents.lines().collect();
        let keywords = self.keywords(plan);

        let mut items = Vec::new();
        let mut offset = start;
        while offset < lines.len() && items.len() < max_items {
            let line = lines[offset].trim();
            offset += 1;
            if line.is_empty() {
                continue;
            }
            let payload: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(source = %self.name, line = offset, error = %e, "Skipping malformed line");
                    continue;
                }
            };
            let Some(id) = item_id(&payload) else {
                warn!(source = %self.name, line = offset, "Skipping line without id");
                continue;
            };
            if matches(&payload, &keywords) {
                items.push(RawItem::new(id, payload));
            }
        }

        Ok(CollectPage {
            items,
            next_cursor: Some(offset.to_string()),
            has_more: offset < lines.len(),
        })
    }

    fn expand(&self, plan: &Plan, _collected: u32, _target: u32) -> Option<Plan> {
        let mut keywords = self.keywords(plan);
        if keywords.is_empty() {
            return None;
        }
        let narrowest = keywords
            .iter()
            .enumerate()
            .max_by_key(|(_, k)| k.len())
            .map(|(i, _)| i)?;
        keywords.remove(narrowest);

        let mut expanded = plan.clone();
        expanded.set_strategy(
            self.name.clone(),
            json!({ "keywords": keywords, "expansion": self.expansions(plan) + 1 }),
        );
        Some(expanded)
    }
}
