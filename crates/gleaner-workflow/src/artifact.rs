//! Artifact archival: raw item payloads and run manifests.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use gleaner_types::RunId;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Result, WorkflowError};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create (or reopen) a container for a run. `scope` names a
    /// per-source sub-container; `None` is the run's root container.
    async fn create_container(&self, run_id: &RunId, scope: Option<&str>) -> Result<String>;

    /// Write one artifact. Writing the same id twice overwrites it.
    async fn write_artifact(&self, container_id: &str, item_id: &str, payload: &Value)
    -> Result<()>;
}

/// Replace anything that is not safe in a file name.
fn file_stem(item_id: &str) -> String {
    item_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem
// ─────────────────────────────────────────────────────────────────────────────

/// A directory per run, a sub-directory per source, one JSON file per item.
///
/// Container ids are paths relative to the root.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn container_path(&self, container_id: &str) -> PathBuf {
        self.root.join(container_id)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn create_container(&self, run_id: &RunId, scope: Option<&str>) -> Result<String> {
        let id = match scope {
            Some(scope) => format!("{run_id}/{}", file_stem(scope)),
            None => run_id.to_string(),
        };
        let path = self.container_path(&id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| WorkflowError::Artifact(format!("{}: {e}", path.display())))?;
        Ok(id)
    }

    async fn write_artifact(
        &self,
        container_id: &str,
        item_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let path = self
            .container_path(container_id)
            .join(format!("{}.json", file_stem(item_id)));
        let bytes = serde_json::to_vec_pretty(payload)
            .map_err(|e| WorkflowError::Artifact(format!("{}: {e}", path.display())))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| WorkflowError::Artifact(format!("{}: {e}", path.display())))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory artifact store for tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    containers: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    created: Mutex<usize>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifact(&self, container_id: &str, item_id: &str) -> Option<Value> {
        self.containers
            .lock()
            .get(container_id)
            .and_then(|c| c.get(item_id).cloned())
    }

    /// Number of artifacts in a container.
    pub fn count(&self, container_id: &str) -> usize {
        self.containers.lock().get(container_id).map_or(0, |c| c.len())
    }

    /// Number of `create_container` calls.
    pub fn created_count(&self) -> usize {
        *self.created.lock()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn create_container(&self, run_id: &RunId, scope: Option<&str>) -> Result<String> {
        let id = match scope {
            Some(scope) => format!("{run_id}/{scope}"),
            None => run_id.to_string(),
        };
        self.containers.lock().entry(id.clone()).or_default();
        *self.created.lock() += 1;
        Ok(id)
    }

    async fn write_artifact(
        &self,
        container_id: &str,
        item_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let mut containers = self.containers.lock();
        let container = containers.get_mut(container_id).ok_or_else(|| {
            WorkflowError::Artifact(format!("unknown container '{container_id}'"))
        })?;
        container.insert(item_id.to_string(), payload.clone());
        Ok(())
    }
}
