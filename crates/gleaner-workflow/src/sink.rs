//! Output sinks: where normalized rows end up.
//!
//! Rows are always appended in batches; a sink never sees single-row writes
//! from the orchestrator unless the batch happens to hold one row.
//!
//! Appends are idempotent on `(source, item_id)`: a row already in the sink
//! is dropped. A checkpoint can lag behind the sink (the save after an append
//! lost a race, or the process died in between), and the re-fetched rows
//! must not land twice.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use gleaner_types::{OutputRow, RunId};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Result, WorkflowError};

/// A created sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkHandle {
    pub id: String,
    /// Where a human can find the output.
    pub location: String,
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Create the sink for a run.
    async fn create_sink(&self, run_id: &RunId) -> Result<SinkHandle>;

    /// Human-facing location of an existing sink (e.g. one the caller supplied).
    fn location(&self, sink_id: &str) -> String;

    /// Append a batch of rows from one source, skipping rows whose
    /// `(source, item_id)` the sink already holds.
    async fn append_rows(&self, sink_id: &str, source: &str, rows: &[OutputRow]) -> Result<()>;

    /// Close the sink. Idempotent.
    async fn finalize(&self, sink_id: &str) -> Result<()>;
}

fn sink_err(path: &Path, err: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Sink(format!("{}: {err}", path.display()))
}

type RowKey = (String, String);

fn row_key(row: &OutputRow) -> RowKey {
    (row.source.clone(), row.item_id.clone())
}

/// Rows of `rows` that are neither in `known` nor repeated earlier in the batch.
fn unseen<'a>(rows: &'a [OutputRow], known: Option<&HashSet<RowKey>>) -> Vec<&'a OutputRow> {
    let mut batch = HashSet::new();
    rows.iter()
        .filter(|row| {
            let key = row_key(row);
            !known.is_some_and(|k| k.contains(&key)) && batch.insert(key)
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// JSONL Sink
// ─────────────────────────────────────────────────────────────────────────────

/// One JSONL file per run under a directory.
///
/// Finalizing writes a `<id>.jsonl.done` marker holding the row count.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    dir: PathBuf,
    /// Keys already in each sink file, read from disk on first append.
    written: Arc<Mutex<HashMap<String, HashSet<RowKey>>>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Load the keys of an existing sink file unless they are cached.
    async fn load_keys(&self, sink_id: &str, path: &Path) -> Result<()> {
        if self.written.lock().contains_key(sink_id) {
            return Ok(());
        }
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(sink_err(path, e)),
        };
        let keys: HashSet<RowKey> = contents
            .lines()
            .filter_map(|line| serde_json::from_str::<OutputRow>(line).ok())
            .map(|row| row_key(&row))
            .collect();
        self.written
            .lock()
            .entry(sink_id.to_string())
            .or_insert(keys);
        Ok(())
    }

    fn path_for(&self, sink_id: &str) -> PathBuf {
        self.dir.join(format!("{sink_id}.jsonl"))
    }

    fn marker_for(&self, sink_id: &str) -> PathBuf {
        self.dir.join(format!("{sink_id}.jsonl.done"))
    }
}

#[async_trait]
impl OutputSink for JsonlSink {
    async fn create_sink(&self, run_id: &RunId) -> Result<SinkHandle> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| sink_err(&self.dir, e))?;

        let id = run_id.to_string();
        let path = self.path_for(&id);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| sink_err(&path, e))?;

        Ok(SinkHandle {
            location: path.display().to_string(),
            id,
        })
    }

    fn location(&self, sink_id: &str) -> String {
        self.path_for(sink_id).display().to_string()
    }

    async fn append_rows(&self, sink_id: &str, source: &str, rows: &[OutputRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let path = self.path_for(sink_id);
        self.load_keys(sink_id, &path).await?;

        let fresh = unseen(rows, self.written.lock().get(sink_id));
        if fresh.len() < rows.len() {
            debug!(
                sink_id,
                source,
                skipped = rows.len() - fresh.len(),
                "Skipping rows already in sink"
            );
        }
        if fresh.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for row in &fresh {
            serde_json::to_writer(&mut buf, row).map_err(|e| sink_err(&path, e))?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| sink_err(&path, e))?;
        file.write_all(&buf).await.map_err(|e| sink_err(&path, e))?;
        file.flush().await.map_err(|e| sink_err(&path, e))?;

        self.written
            .lock()
            .entry(sink_id.to_string())
            .or_default()
            .extend(fresh.into_iter().map(row_key));
        Ok(())
    }

    async fn finalize(&self, sink_id: &str) -> Result<()> {
        let marker = self.marker_for(sink_id);
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            return Ok(());
        }
        let path = self.path_for(sink_id);
        let rows = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(sink_err(&path, e)),
        };
        tokio::fs::write(&marker, format!("{rows}\n"))
            .await
            .map_err(|e| sink_err(&marker, e))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Sink
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct MemorySinkRecord {
    rows: Vec<OutputRow>,
    appends: usize,
    finalized: bool,
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    sinks: Mutex<BTreeMap<String, MemorySinkRecord>>,
    created: Mutex<usize>,
    fail_appends: Mutex<bool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows appended to a sink, in order.
    pub fn rows(&self, sink_id: &str) -> Vec<OutputRow> {
        self.sinks
            .lock()
            .get(sink_id)
            .map(|r| r.rows.clone())
            .unwrap_or_default()
    }

    /// Number of `append_rows` calls for a sink.
    pub fn append_calls(&self, sink_id: &str) -> usize {
        self.sinks.lock().get(sink_id).map_or(0, |r| r.appends)
    }

    pub fn is_finalized(&self, sink_id: &str) -> bool {
        self.sinks.lock().get(sink_id).is_some_and(|r| r.finalized)
    }

    /// Number of sinks created through `create_sink`.
    pub fn created_count(&self) -> usize {
        *self.created.lock()
    }

    /// Make every subsequent append fail.
    pub fn fail_appends(&self, fail: bool) {
        *self.fail_appends.lock() = fail;
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn create_sink(&self, run_id: &RunId) -> Result<SinkHandle> {
        let id = format!("mem-{run_id}");
        self.sinks.lock().entry(id.clone()).or_default();
        *self.created.lock() += 1;
        Ok(SinkHandle {
            location: self.location(&id),
            id,
        })
    }

    fn location(&self, sink_id: &str) -> String {
        format!("memory://{sink_id}")
    }

    async fn append_rows(&self, sink_id: &str, _source: &str, rows: &[OutputRow]) -> Result<()> {
        if *self.fail_appends.lock() {
            return Err(WorkflowError::Sink(format!("{sink_id}: append rejected")));
        }
        if rows.is_empty() {
            return Ok(());
        }
        let mut sinks = self.sinks.lock();
        let record = sinks.entry(sink_id.to_string()).or_default();
        let known: HashSet<RowKey> = record.rows.iter().map(row_key).collect();
        let fresh: Vec<OutputRow> = unseen(rows, Some(&known)).into_iter().cloned().collect();
        record.rows.extend(fresh);
        record.appends += 1;
        Ok(())
    }

    async fn finalize(&self, sink_id: &str) -> Result<()> {
        self.sinks
            .lock()
            .entry(sink_id.to_string())
            .or_default()
            .finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_types::now;

    fn row(id: &str) -> OutputRow {
        OutputRow {
            source: "news".into(),
            item_id: id.into(),
            fields: serde_json::json!({ "id": id }),
            collected_at: now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path().join("out"));
        let run_id = RunId::generate();

        let handle = sink.create_sink(&run_id).await.unwrap();
        assert!(handle.location.ends_with(".jsonl"));
        sink.append_rows(&handle.id, "news", &[row("a"), row("b")])
            .await
            .unwrap();
        sink.append_rows(&handle.id, "news", &[row("c")]).await.unwrap();
        sink.append_rows(&handle.id, "news", &[]).await.unwrap();

        let contents = std::fs::read_to_string(&handle.location).unwrap();
        let ids: Vec<String> = contents
            .lines()
            .map(|l| serde_json::from_str::<OutputRow>(l).unwrap().item_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        sink.finalize(&handle.id).await.unwrap();
        sink.finalize(&handle.id).await.unwrap();
        let marker = std::fs::read_to_string(format!("{}.done", handle.location)).unwrap();
        assert_eq!(marker.trim(), "3");
    }

    #[tokio::test]
    async fn test_jsonl_sink_skips_rows_it_already_holds() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::new(dir.path());
        let handle = sink.create_sink(&RunId::generate()).await.unwrap();

        sink.append_rows(&handle.id, "news", &[row("a"), row("b"), row("a")])
            .await
            .unwrap();
        sink.append_rows(&handle.id, "news", &[row("b"), row("c")])
            .await
            .unwrap();

        // A fresh instance sees what an earlier process wrote.
        let reopened = JsonlSink::new(dir.path());
        reopened
            .append_rows(&handle.id, "news", &[row("a"), row("d")])
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&handle.location).unwrap();
        let ids: Vec<String> = contents
            .lines()
            .map(|l| serde_json::from_str::<OutputRow>(l).unwrap().item_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_same_id_from_another_source_is_kept() {
        let sink = MemorySink::new();
        let handle = sink.create_sink(&RunId::generate()).await.unwrap();
        let mut forum_row = row("a");
        forum_row.source = "forum".into();

        sink.append_rows(&handle.id, "news", &[row("a")]).await.unwrap();
        sink.append_rows(&handle.id, "forum", &[forum_row]).await.unwrap();
        sink.append_rows(&handle.id, "news", &[row("a")]).await.unwrap();

        assert_eq!(sink.rows(&handle.id).len(), 2);
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        let handle = sink.create_sink(&RunId::generate()).await.unwrap();
        sink.append_rows(&handle.id, "news", &[row("a"), row("b")])
            .await
            .unwrap();
        assert_eq!(sink.rows(&handle.id).len(), 2);
        assert_eq!(sink.append_calls(&handle.id), 1);

        sink.fail_appends(true);
        assert!(sink.append_rows(&handle.id, "news", &[row("c")]).await.is_err());

        sink.finalize(&handle.id).await.unwrap();
        assert!(sink.is_finalized(&handle.id));
        assert_eq!(sink.created_count(), 1);
    }
}
