//! Configuration system for the Gleaner collection workflow.
//!
//! Provides TOML-based configuration with:
//! - Workflow timing (host execution limit, safety margin, batch size)
//! - Retry policy for outbound calls
//! - Run retention for housekeeping
//! - Ordered `[[sources]]` tables, one per collection stage
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, user_config_dir,
};
pub use error::{ConfigError, Result};
pub use types::*;
