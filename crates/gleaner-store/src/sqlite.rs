use std::path::Path;

use chrono::{DateTime, Utc};
use gleaner_types::{RunId, RunOptions, RunState, RunStatus, now};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::store::{CheckpointStore, RunSummary};
use crate::{Result, StoreError};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// SQLite-backed checkpoint store.
///
/// The full `RunState` is stored as JSON next to a few indexed columns used
/// for listing. Thread-safe via an internal mutex around the connection.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, state: &RunState) -> Result<()> {
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO runs
                (run_id, status, status_json, has_lease, state_json, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                state.run_id.as_str(),
                state.status.label(),
                serde_json::to_string(&state.status)?,
                state.lease.is_some() as i32,
                serde_json::to_string(state)?,
                state.version as i64,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(state.run_id.clone()));
        }
        Ok(())
    }

    fn stored_version(conn: &Connection, run_id: &RunId) -> Result<Option<u64>> {
        Ok(conn
            .query_row(
                "SELECT version FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(|v| v as u64))
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn create(&self, run_id: RunId, instruction: &str, options: RunOptions) -> Result<RunState> {
        let state = RunState::new(run_id, instruction, options);
        self.insert(&state)?;
        debug!(run_id = %state.run_id, "Created run checkpoint");
        Ok(state)
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunState>> {
        let json: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT state_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    fn save(&self, state: &mut RunState) -> Result<()> {
        let mut next = state.clone();
        next.version = state.version + 1;
        next.updated_at = now();

        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE runs
             SET status = ?1, status_json = ?2, has_lease = ?3, state_json = ?4,
                 version = ?5, updated_at = ?6
             WHERE run_id = ?7 AND version = ?8",
            params![
                next.status.label(),
                serde_json::to_string(&next.status)?,
                next.lease.is_some() as i32,
                serde_json::to_string(&next)?,
                next.version as i64,
                next.updated_at.to_rfc3339(),
                next.run_id.as_str(),
                state.version as i64,
            ],
        )?;

        if updated == 0 {
            return match Self::stored_version(&conn, &state.run_id)? {
                Some(found) => Err(StoreError::Conflict {
                    run_id: state.run_id.clone(),
                    expected: state.version,
                    found,
                }),
                None => Err(StoreError::NotFound(state.run_id.clone())),
            };
        }

        *state = next;
        Ok(())
    }

    fn delete(&self, run_id: &RunId) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM runs WHERE run_id = ?1", params![run_id.as_str()])?;
        Ok(deleted > 0)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, status_json, has_lease, created_at, updated_at
             FROM runs ORDER BY run_id DESC LIMIT ?1",
        )?;
        let iter = stmt.query_map(params![limit], row_to_summary)?;

        let mut rows = Vec::new();
        for r in iter {
            rows.push(r?);
        }
        Ok(rows)
    }

    fn list_pending(&self) -> Result<Vec<RunId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id FROM runs
             WHERE has_lease = 1 AND status NOT IN ('completed', 'failed')
             ORDER BY run_id ASC",
        )?;
        let iter = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for id in iter {
            ids.push(RunId::parse(&id?).map_err(|e| {
                StoreError::Corrupt(e.to_string())
            })?);
        }
        Ok(ids)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunSummary> {
    let run_id: String = row.get(0)?;
    let status_json: String = row.get(1)?;
    let status: RunStatus = serde_json::from_str(&status_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let run_id = RunId::parse(&run_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(RunSummary {
        run_id,
        status,
        pending: row.get::<_, i32>(2)? != 0,
        created_at: parse_dt(&row.get::<_, String>(3)?),
        updated_at: parse_dt(&row.get::<_, String>(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_types::ContinuationLease;

    fn test_store() -> SqliteCheckpointStore {
        SqliteCheckpointStore::open_in_memory().expect("failed to open in-memory store")
    }

    #[test]
    fn test_migrations_run() {
        let _store = test_store();
    }

    #[test]
    fn test_create_load_roundtrip() {
        let store = test_store();
        let run_id = RunId::generate();
        let created = store
            .create(run_id.clone(), "collect rust news", RunOptions::default())
            .unwrap();
        assert_eq!(created.status, RunStatus::Created);

        let loaded = store.load(&run_id).unwrap().unwrap();
        assert_eq!(loaded.instruction, "collect rust news");
        assert_eq!(loaded.version, 0);
    }

    #[test]
    fn test_create_twice_fails() {
        let store = test_store();
        let run_id = RunId::generate();
        store.create(run_id.clone(), "a", RunOptions::default()).unwrap();
        let err = store.create(run_id, "b", RunOptions::default()).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_save_bumps_version_and_updated_at() {
        let store = test_store();
        let mut state = store
            .create(RunId::generate(), "x", RunOptions::default())
            .unwrap();
        let before = state.updated_at;
        state.transition(RunStatus::Planning).unwrap();
        store.save(&mut state).unwrap();
        assert_eq!(state.version, 1);
        assert!(state.updated_at >= before);

        let loaded = store.load(&state.run_id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Planning);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_stale_save_conflicts() {
        let store = test_store();
        let run_id = RunId::generate();
        store.create(run_id.clone(), "x", RunOptions::default()).unwrap();

        let mut first = store.load(&run_id).unwrap().unwrap();
        let mut second = store.load(&run_id).unwrap().unwrap();

        first.set_message("first writer");
        store.save(&mut first).unwrap();

        second.set_message("second writer");
        let err = store.save(&mut second).unwrap_err();
        assert!(err.is_conflict());
        // The loser's copy is untouched
        assert_eq!(second.version, 0);

        let stored = store.load(&run_id).unwrap().unwrap();
        assert_eq!(stored.last_message.as_deref(), Some("first writer"));
    }

    #[test]
    fn test_save_missing_run() {
        let store = test_store();
        let mut state = RunState::new(RunId::generate(), "x", RunOptions::default());
        let err = store.save(&mut state).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_delete() {
        let store = test_store();
        let run_id = RunId::generate();
        store.create(run_id.clone(), "x", RunOptions::default()).unwrap();
        assert!(store.delete(&run_id).unwrap());
        assert!(!store.delete(&run_id).unwrap());
        assert!(store.load(&run_id).unwrap().is_none());
    }

    #[test]
    fn test_list_pending_only_leased_and_active() {
        let store = test_store();

        let mut leased = store
            .create(RunId::generate(), "a", RunOptions::default())
            .unwrap();
        leased.lease = Some(ContinuationLease::new("t-1"));
        store.save(&mut leased).unwrap();

        let mut finished = store
            .create(RunId::generate(), "b", RunOptions::default())
            .unwrap();
        finished.lease = Some(ContinuationLease::new("t-2"));
        finished.status = RunStatus::Completed;
        store.save(&mut finished).unwrap();

        store
            .create(RunId::generate(), "c", RunOptions::default())
            .unwrap();

        assert_eq!(store.list_pending().unwrap(), vec![leased.run_id]);
    }

    #[test]
    fn test_on_disk_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let run_id = RunId::generate();
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.create(run_id.clone(), "x", RunOptions::default()).unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert!(store.load(&run_id).unwrap().is_some());
    }
}
