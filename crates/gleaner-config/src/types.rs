//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [workflow]        # time budget, batching, expansion
//! [retry]           # backoff policy for outbound calls
//! [retention]       # housekeeping
//! [storage]         # checkpoint database and data directory
//! [logging]         # log file location
//! [[sources]]       # one table per source, in stage order
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Application name for directory resolution.
pub(crate) const APP_NAME: &str = "gleaner";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GleanerConfig {
    pub workflow: Option<WorkflowSection>,
    pub retry: Option<RetrySection>,
    pub retention: Option<RetentionSection>,
    pub storage: Option<StorageSection>,
    pub logging: Option<LoggingSection>,
    /// Sources in stage order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceSection>,
}

impl GleanerConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: GleanerConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sources merge by name: a later table replaces an earlier one in place,
    /// new names are appended to the stage order.
    pub fn merge(&mut self, other: GleanerConfig) {
        if other.workflow.is_some() {
            self.workflow = other.workflow;
        }
        if other.retry.is_some() {
            self.retry = other.retry;
        }
        if other.retention.is_some() {
            self.retention = other.retention;
        }
        if other.storage.is_some() {
            self.storage = other.storage;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
        for source in other.sources {
            match self.sources.iter_mut().find(|s| s.name == source.name) {
                Some(existing) => *existing = source,
                None => self.sources.push(source),
            }
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let workflow = self.workflow();
        if workflow.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "workflow.batch_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if workflow.safety_margin_secs >= workflow.host_execution_limit_secs {
            return Err(ConfigError::Invalid {
                field: "workflow.safety_margin_secs".into(),
                reason: format!(
                    "must be below host_execution_limit_secs ({})",
                    workflow.host_execution_limit_secs
                ),
            });
        }
        if workflow.max_pending_timers == 0 {
            return Err(ConfigError::Invalid {
                field: "workflow.max_pending_timers".into(),
                reason: "must be at least 1".into(),
            });
        }

        let retry = self.retry();
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay_ms".into(),
                reason: "must not exceed retry.max_delay_ms".into(),
            });
        }

        for (i, source) in self.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: format!("sources[{i}].name"),
                    reason: "must not be empty".into(),
                });
            }
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
        }
        Ok(())
    }

    /// Workflow section or its defaults.
    pub fn workflow(&self) -> WorkflowSection {
        self.workflow.clone().unwrap_or_default()
    }

    /// Retry section or its defaults.
    pub fn retry(&self) -> RetrySection {
        self.retry.clone().unwrap_or_default()
    }

    /// Retention section or its defaults.
    pub fn retention(&self) -> RetentionSection {
        self.retention.clone().unwrap_or_default()
    }

    /// Storage section or its defaults.
    pub fn storage(&self) -> StorageSection {
        self.storage.clone().unwrap_or_default()
    }

    /// Look up a source by name.
    pub fn source(&self, name: &str) -> Option<&SourceSection> {
        self.sources.iter().find(|s| s.name == name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflow Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Orchestrator timing and batching.
///
/// ```toml
/// [workflow]
/// host_execution_limit_secs = 360
/// safety_margin_secs = 60
/// batch_size = 25
/// max_expansions = 2
/// continuation_delay_secs = 5
/// max_pending_timers = 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    /// Hard wall-clock limit the host enforces on one invocation.
    pub host_execution_limit_secs: u64,
    /// Reserved at the end of every invocation for checkpointing and
    /// finalization.
    pub safety_margin_secs: u64,
    /// Items requested per page and rows per sink append.
    pub batch_size: usize,
    /// Query widening attempts per stage before a shortfall is accepted.
    pub max_expansions: u32,
    /// Delay of the one-shot continuation callback.
    pub continuation_delay_secs: u64,
    /// Maximum timers the host lets us keep armed.
    pub max_pending_timers: usize,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            host_execution_limit_secs: 360,
            safety_margin_secs: 60,
            batch_size: 25,
            max_expansions: 2,
            continuation_delay_secs: 5,
            max_pending_timers: 20,
        }
    }
}

impl WorkflowSection {
    /// Usable time per invocation: the host limit minus the safety margin.
    pub fn budget(&self) -> Duration {
        Duration::from_secs(
            self.host_execution_limit_secs
                .saturating_sub(self.safety_margin_secs),
        )
    }

    pub fn continuation_delay(&self) -> Duration {
        Duration::from_secs(self.continuation_delay_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Backoff policy for outbound calls.
///
/// ```toml
/// [retry]
/// max_retries = 3
/// base_delay_ms = 1000
/// max_delay_ms = 30000
/// max_jitter_ms = 250
/// rate_limit_pause_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter_ms: u64,
    /// Extra fixed sleep inserted before retrying a rate-limited call.
    pub rate_limit_pause_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_jitter_ms: 250,
            rate_limit_pause_ms: 5000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retention / Storage / Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Housekeeping policy.
///
/// ```toml
/// [retention]
/// keep_runs = 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    /// Most recent runs to keep; older terminal runs are deleted.
    pub keep_runs: usize,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self { keep_runs: 20 }
    }
}

/// Where run state and outputs live.
///
/// ```toml
/// [storage]
/// database = "runs.db"
/// data_dir = "/var/lib/gleaner"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Checkpoint database. Relative paths are resolved from the data directory.
    pub database: Option<PathBuf>,
    /// Root for sinks and artifacts.
    pub data_dir: Option<PathBuf>,
}

impl StorageSection {
    /// Data directory: configured, else the platform data dir, else `./.gleaner`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|d| d.join(APP_NAME)))
            .unwrap_or_else(|| PathBuf::from(".gleaner"))
    }

    /// Checkpoint database path.
    pub fn resolved_database(&self) -> PathBuf {
        let data_dir = self.resolved_data_dir();
        match &self.database {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => data_dir.join(path),
            None => data_dir.join("runs.db"),
        }
    }
}

/// Logging configuration.
///
/// ```toml
/// [logging]
/// directory = "/var/log/gleaner"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for the rotating JSON log file.
    pub directory: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

/// One data source.
///
/// ```toml
/// [[sources]]
/// name = "news"
/// path = "fixtures/news.jsonl"
/// default_target = 50
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSection {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Input file for file-backed sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Target when the planner does not give one.
    #[serde(default = "default_target")]
    pub default_target: u32,
}

fn default_true() -> bool {
    true
}

fn default_target() -> u32 {
    25
}

impl SourceSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            path: None,
            default_target: default_target(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_default_target(mut self, target: u32) -> Self {
        self.default_target = target;
        self
    }

    /// Settings that must be filled in before the source is usable.
    pub fn missing_settings(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.path.is_none() {
            missing.push(format!("sources.{}.path", self.name));
        }
        missing
    }
}
