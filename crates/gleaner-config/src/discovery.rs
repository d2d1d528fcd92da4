//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/gleaner/config.toml` (user config dir)
//! 2. `./gleaner.toml` (project-local)
//! 3. CLI arguments (handled externally)

use std::path::{Path, PathBuf};

use crate::types::APP_NAME;
use crate::{ConfigError, GleanerConfig, Result};

const PROJECT_CONFIG_FILE: &str = "gleaner.toml";
const USER_CONFIG_FILE: &str = "config.toml";

/// Overrides the user config directory.
const CONFIG_DIR_ENV: &str = "GLEANER_CONFIG_DIR";

/// Merged configuration plus anything that went wrong on the way.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: GleanerConfig,
    /// Problems with individual layers; loading continues past them.
    pub warnings: Vec<String>,
}

/// Discover and merge the user and project layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], with `config_dir` replacing the user config directory.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = GleanerConfig::new();
    let mut warnings = Vec::new();

    let user_dir = config_dir.map(Path::to_path_buf).or_else(user_config_dir);
    if let Some(dir) = user_dir {
        merge_layer(&mut config, &dir.join(USER_CONFIG_FILE), &mut warnings);
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    merge_layer(&mut config, &project_path, &mut warnings);

    // Layers are valid on their own; the merge may still conflict.
    config.validate()?;

    Ok(LoadedConfig { config, warnings })
}

/// Load one config file, no discovery.
pub fn load_config_file(path: &Path) -> Result<GleanerConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    GleanerConfig::from_toml(&contents)
}

/// `GLEANER_CONFIG_DIR`, else the platform config directory.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn merge_layer(config: &mut GleanerConfig, path: &Path, warnings: &mut Vec<String>) {
    if !path.is_file() {
        return;
    }
    match load_config_file(path) {
        Ok(layer) => config.merge(layer),
        Err(e) => warnings.push(format!("Failed to load {}: {}", path.display(), e)),
    }
}
