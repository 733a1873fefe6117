//! SQLite-backed release ledger.
//!
//! One row per commit SHA; the UNIQUE constraint on `commit_sha` is what
//! decides claim races, and the `status = 'running'` guard on updates is what
//! makes terminal writes at-most-once. All mutations run as transactions so
//! the exclusivity and idempotency invariants hold even with multiple
//! service instances sharing the database file.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::error::StoreError;
use crate::models::{
    CancelOutcome, ClaimOutcome, QueueEntry, ReleaseRecord, ReleaseState, StateMetrics,
};

const SCHEMA_VERSION: i64 = 2;

#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Opens (or creates) the database at `db_path` and migrates it to the
    /// current schema version.
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn =
            Connection::open(db_path).map_err(|e| StoreError::storage("open ledger", e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| StoreError::storage("enable foreign keys", e))?;
        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        ensure_migration_table(&conn)?;
        let current = current_schema_version(&conn)?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::Storage(format!(
                "schema version {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "release_log_table")?;
        }
        if current < 2 {
            apply_migration_v2(&conn)?;
            record_migration(&conn, 2, "release_priority")?;
        }
        Ok(())
    }

    /// Atomic claim for a new release request (§ Lock Manager).
    ///
    /// Exactly one of three things happens, inside a single transaction:
    /// the commit is already tracked (idempotent re-trigger, no new work);
    /// nothing is running, so the record is created directly in `running`;
    /// or a release is in flight and the record is enqueued with `priority`.
    pub fn claim(
        &self,
        commit_sha: &str,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin claim tx", e))?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM release_log WHERE commit_sha = ?1",
                params![commit_sha],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("read existing claim", e))?;
        if let Some(status) = existing {
            return Ok(ClaimOutcome::AlreadyTracked(ReleaseState::parse(&status)));
        }

        let running: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM release_log WHERE status = 'running'",
                [],
                |r| r.get(0),
            )
            .map_err(|e| StoreError::storage("count running releases", e))?;

        let (status, started_at_ms) = if running == 0 {
            (ReleaseState::Running, Some(dt_to_ms(now)))
        } else {
            (ReleaseState::Queued, None)
        };

        let inserted = tx.execute(
            "INSERT INTO release_log (commit_sha, status, priority, queued_at_ms, started_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                commit_sha,
                status.as_str(),
                priority,
                dt_to_ms(now),
                started_at_ms
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                // Lost the race for an unseen commit: another caller inserted
                // between our read and write. Report the winner's state.
                let winner: String = tx
                    .query_row(
                        "SELECT status FROM release_log WHERE commit_sha = ?1",
                        params![commit_sha],
                        |r| r.get(0),
                    )
                    .map_err(|e| StoreError::storage("read claim race winner", e))?;
                return Ok(ClaimOutcome::AlreadyTracked(ReleaseState::parse(&winner)));
            }
            Err(e) => return Err(StoreError::storage("insert claim", e)),
        }

        tx.commit()
            .map_err(|e| StoreError::storage("commit claim tx", e))?;
        Ok(match status {
            ReleaseState::Running => ClaimOutcome::Started,
            _ => ClaimOutcome::Queued,
        })
    }

    /// Atomically promotes the head of the queue to `running` and returns its
    /// commit SHA, or `None` when the queue is empty or a release is already
    /// running anywhere.
    ///
    /// Ordering key: `(priority DESC, queued_at ASC, id ASC)` — the id
    /// tie-break keeps same-millisecond submissions FIFO.
    pub fn dequeue_next(&self, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin dequeue tx", e))?;

        let running: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM release_log WHERE status = 'running'",
                [],
                |r| r.get(0),
            )
            .map_err(|e| StoreError::storage("count running releases", e))?;
        if running > 0 {
            return Ok(None);
        }

        let head: Option<String> = tx
            .query_row(
                "SELECT commit_sha FROM release_log
                 WHERE status = 'queued'
                 ORDER BY priority DESC, queued_at_ms ASC, id ASC
                 LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("read queue head", e))?;
        let Some(commit_sha) = head else {
            return Ok(None);
        };

        let promoted = tx
            .execute(
                "UPDATE release_log
                 SET status = 'running', started_at_ms = ?2
                 WHERE commit_sha = ?1 AND status = 'queued'",
                params![commit_sha, dt_to_ms(now)],
            )
            .map_err(|e| StoreError::storage("promote queue head", e))?;
        if promoted == 0 {
            // Concurrent dequeue won the head; treat as empty.
            return Ok(None);
        }

        tx.commit()
            .map_err(|e| StoreError::storage("commit dequeue tx", e))?;
        Ok(Some(commit_sha))
    }

    /// Deletes a record iff it is still `queued` (§ Queue cancellation).
    pub fn cancel(&self, commit_sha: &str) -> Result<CancelOutcome, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin cancel tx", e))?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM release_log WHERE commit_sha = ?1",
                params![commit_sha],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("read cancel target", e))?;
        let Some(status) = status else {
            return Ok(CancelOutcome::NotFound);
        };
        let state = ReleaseState::parse(&status);
        if state != ReleaseState::Queued {
            return Ok(CancelOutcome::Conflict(state));
        }

        tx.execute(
            "DELETE FROM release_log WHERE commit_sha = ?1 AND status = 'queued'",
            params![commit_sha],
        )
        .map_err(|e| StoreError::storage("delete queued release", e))?;
        tx.commit()
            .map_err(|e| StoreError::storage("commit cancel tx", e))?;
        Ok(CancelOutcome::Cancelled)
    }

    /// Writes the terminal state for a `running` record, stamping `ended_at`.
    ///
    /// The `status = 'running'` guard makes this at-most-once: whichever of
    /// the racing completion signals commits first wins, the other sees zero
    /// affected rows and is reported as a no-op (`Ok(false)`).
    pub fn finish(
        &self,
        commit_sha: &str,
        state: ReleaseState,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        debug_assert!(state.is_terminal());
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let updated = conn
            .execute(
                "UPDATE release_log
                 SET status = ?2, ended_at_ms = ?3
                 WHERE commit_sha = ?1 AND status = 'running'",
                params![commit_sha, state.as_str(), dt_to_ms(ended_at)],
            )
            .map_err(|e| StoreError::storage("write terminal state", e))?;
        Ok(updated > 0)
    }

    /// Marks every `running` record `failed` with `ended_at = now`.
    ///
    /// Only meaningful before any executor has started in this process:
    /// leftover `running` rows can only come from an unclean shutdown.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        conn.execute(
            "UPDATE release_log
             SET status = 'failed', ended_at_ms = ?1
             WHERE status = 'running'",
            params![dt_to_ms(now)],
        )
        .map_err(|e| StoreError::storage("recover interrupted releases", e))
    }

    /// Deletes terminal records queued more than `days` days before `now`.
    /// `queued` and `running` rows are never purged, irrespective of age.
    pub fn purge_older_than(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = dt_to_ms(now) - days.saturating_mul(86_400_000);
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        conn.execute(
            "DELETE FROM release_log
             WHERE queued_at_ms < ?1
               AND status IN ('success', 'failed', 'timeout')",
            params![cutoff],
        )
        .map_err(|e| StoreError::storage("purge old releases", e))
    }

    /// Per-state counts and average run duration for records queued within
    /// the last `days` days, ordered by state name.
    pub fn metrics_since(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateMetrics>, StoreError> {
        let cutoff = dt_to_ms(now) - days.saturating_mul(86_400_000);
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let mut stmt = conn
            .prepare(
                "SELECT status,
                        COUNT(*),
                        AVG(CASE
                              WHEN started_at_ms IS NOT NULL AND ended_at_ms IS NOT NULL
                                THEN (ended_at_ms - started_at_ms) / 60000.0
                              ELSE NULL
                            END)
                 FROM release_log
                 WHERE queued_at_ms >= ?1
                 GROUP BY status
                 ORDER BY status ASC",
            )
            .map_err(|e| StoreError::storage("prepare metrics query", e))?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                Ok(StateMetrics {
                    state: ReleaseState::parse(&row.get::<_, String>(0)?),
                    count: row.get(1)?,
                    avg_duration_minutes: row.get(2)?,
                })
            })
            .map_err(|e| StoreError::storage("query metrics", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::storage("scan metrics row", e))?);
        }
        Ok(out)
    }

    pub fn get(&self, commit_sha: &str) -> Result<Option<ReleaseRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        conn.query_row(
            "SELECT commit_sha, status, priority, queued_at_ms, started_at_ms, ended_at_ms
             FROM release_log WHERE commit_sha = ?1",
            params![commit_sha],
            map_row_to_record,
        )
        .optional()
        .map_err(|e| StoreError::storage("read release record", e))
    }

    /// Snapshot of all `queued` records in scheduling order.
    pub fn queue_snapshot(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let mut stmt = conn
            .prepare(
                "SELECT commit_sha, queued_at_ms, priority
                 FROM release_log
                 WHERE status = 'queued'
                 ORDER BY priority DESC, queued_at_ms ASC, id ASC",
            )
            .map_err(|e| StoreError::storage("prepare queue snapshot", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(QueueEntry {
                    commit_sha: row.get(0)?,
                    queued_at: ms_to_dt(row.get(1)?),
                    priority: row.get(2)?,
                })
            })
            .map_err(|e| StoreError::storage("query queue snapshot", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::storage("scan queue row", e))?);
        }
        Ok(out)
    }

    /// Whether any record is `running`. This is the source of truth for the
    /// "a release is in flight" condition; there is no in-memory flag.
    pub fn is_release_running(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM release_log WHERE status = 'running'",
                [],
                |r| r.get(0),
            )
            .map_err(|e| StoreError::storage("count running releases", e))?;
        Ok(count > 0)
    }

    pub fn queue_length(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::poisoned())?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM release_log WHERE status = 'queued'",
                [],
                |r| r.get(0),
            )
            .map_err(|e| StoreError::storage("count queued releases", e))?;
        Ok(count as usize)
    }
}

fn map_row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ReleaseRecord> {
    Ok(ReleaseRecord {
        commit_sha: row.get(0)?,
        state: ReleaseState::parse(&row.get::<_, String>(1)?),
        priority: row.get(2)?,
        queued_at: ms_to_dt(row.get(3)?),
        started_at: row.get::<_, Option<i64>>(4)?.map(ms_to_dt),
        ended_at: row.get::<_, Option<i64>>(5)?.map(ms_to_dt),
    })
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn ensure_migration_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StoreError::storage("init migration table", e))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )
    .map_err(|e| StoreError::storage("read schema version", e))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at_ms)
         VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| StoreError::storage("record migration", e))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS release_log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          commit_sha TEXT NOT NULL UNIQUE,
          status TEXT NOT NULL,
          queued_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER NULL,
          ended_at_ms INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_release_log_status ON release_log(status);
        CREATE INDEX IF NOT EXISTS idx_release_log_queued_at ON release_log(queued_at_ms);
        "#,
    )
    .map_err(|e| StoreError::storage("apply migration v1", e))?;
    Ok(())
}

fn apply_migration_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        ALTER TABLE release_log ADD COLUMN priority INTEGER NOT NULL DEFAULT 0;
        CREATE INDEX IF NOT EXISTS idx_release_log_dispatch
          ON release_log(status, priority DESC, queued_at_ms ASC);
        "#,
    )
    .map_err(|e| StoreError::storage("apply migration v2", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chrono::{Duration, Utc};
    use rusqlite::Connection;

    use super::*;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("release-gate-{}-{}.db", name, uuid::Uuid::new_v4()))
    }

    fn open_temp(name: &str) -> (SqliteLedger, PathBuf) {
        let path = temp_db_path(name);
        let ledger = SqliteLedger::open(&path.to_string_lossy()).expect("open ledger");
        (ledger, path)
    }

    fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
        let pragma = format!("PRAGMA table_info({})", table);
        let mut stmt = conn.prepare(&pragma).expect("prepare pragma table_info");
        let mut rows = stmt.query([]).expect("query pragma table_info");
        while let Some(row) = rows.next().expect("scan pragma row") {
            let col_name: String = row.get(1).expect("column name");
            if col_name == column {
                return true;
            }
        }
        false
    }

    fn migration_version(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |r| r.get(0),
        )
        .expect("read migration version")
    }

    #[test]
    fn clean_init_reaches_latest_schema_version() {
        let (_ledger, path) = open_temp("schema-clean");
        let conn = Connection::open(&path).expect("open raw db");
        assert_eq!(migration_version(&conn), SCHEMA_VERSION);
        assert!(column_exists(&conn, "release_log", "priority"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn v1_database_upgrades_in_place() {
        let path = temp_db_path("schema-upgrade");
        {
            let conn = Connection::open(&path).expect("open raw db");
            ensure_migration_table(&conn).expect("ensure migration table");
            apply_migration_v1(&conn).expect("apply v1");
            record_migration(&conn, 1, "release_log_table").expect("record v1");
            assert!(!column_exists(&conn, "release_log", "priority"));
        }
        let _ledger = SqliteLedger::open(&path.to_string_lossy()).expect("reopen and migrate");
        let conn = Connection::open(&path).expect("open upgraded db");
        assert_eq!(migration_version(&conn), SCHEMA_VERSION);
        assert!(column_exists(&conn, "release_log", "priority"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn first_claim_starts_immediately() {
        let (ledger, path) = open_temp("claim-fast-path");
        let now = Utc::now();
        assert_eq!(ledger.claim("aaaa111", 0, now).unwrap(), ClaimOutcome::Started);
        let record = ledger.get("aaaa111").unwrap().expect("record exists");
        assert_eq!(record.state, ReleaseState::Running);
        assert!(record.started_at.is_some());
        assert!(ledger.is_release_running().unwrap());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn claim_is_idempotent_per_commit() {
        let (ledger, path) = open_temp("claim-idempotent");
        let now = Utc::now();
        assert_eq!(ledger.claim("aaaa111", 0, now).unwrap(), ClaimOutcome::Started);
        assert_eq!(
            ledger.claim("aaaa111", 5, now).unwrap(),
            ClaimOutcome::AlreadyTracked(ReleaseState::Running)
        );
        // Still a single record, still a single running row.
        assert_eq!(ledger.queue_length().unwrap(), 0);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn claims_queue_while_a_release_is_running() {
        let (ledger, path) = open_temp("claim-queues");
        let now = Utc::now();
        assert_eq!(ledger.claim("aaaa111", 0, now).unwrap(), ClaimOutcome::Started);
        assert_eq!(ledger.claim("bbbb222", 0, now).unwrap(), ClaimOutcome::Queued);
        assert_eq!(ledger.claim("cccc333", 0, now).unwrap(), ClaimOutcome::Queued);
        assert_eq!(ledger.queue_length().unwrap(), 2);
        // The queued rows have no started_at yet.
        let queued = ledger.get("bbbb222").unwrap().unwrap();
        assert_eq!(queued.state, ReleaseState::Queued);
        assert!(queued.started_at.is_none());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn at_most_one_running_record() {
        let (ledger, path) = open_temp("single-running");
        let now = Utc::now();
        ledger.claim("aaaa111", 0, now).unwrap();
        for sha in ["bbbb222", "cccc333", "dddd444"] {
            ledger.claim(sha, 0, now).unwrap();
        }
        // No dequeue can promote while aaaa111 runs.
        assert_eq!(ledger.dequeue_next(now).unwrap(), None);
        let conn = Connection::open(&path).expect("open raw db");
        let running: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM release_log WHERE status = 'running'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(running, 1);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn dequeue_respects_priority_then_fifo() {
        let (ledger, path) = open_temp("priority-order");
        let t0 = Utc::now();
        ledger.claim("eeee000", 0, t0).unwrap(); // running
        ledger.claim("aaaa111", 0, t0 + Duration::milliseconds(1)).unwrap();
        ledger.claim("bbbb222", 5, t0 + Duration::milliseconds(2)).unwrap();
        ledger.claim("cccc333", 0, t0 + Duration::milliseconds(3)).unwrap();

        ledger.finish("eeee000", ReleaseState::Success, Utc::now()).unwrap();
        assert_eq!(ledger.dequeue_next(Utc::now()).unwrap().as_deref(), Some("bbbb222"));
        ledger.finish("bbbb222", ReleaseState::Success, Utc::now()).unwrap();
        assert_eq!(ledger.dequeue_next(Utc::now()).unwrap().as_deref(), Some("aaaa111"));
        ledger.finish("aaaa111", ReleaseState::Success, Utc::now()).unwrap();
        assert_eq!(ledger.dequeue_next(Utc::now()).unwrap().as_deref(), Some("cccc333"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn dequeue_stamps_started_at() {
        let (ledger, path) = open_temp("dequeue-stamps");
        let t0 = Utc::now();
        ledger.claim("aaaa111", 0, t0).unwrap();
        ledger.claim("bbbb222", 0, t0).unwrap();
        ledger.finish("aaaa111", ReleaseState::Success, t0).unwrap();
        let started = t0 + Duration::seconds(1);
        assert_eq!(ledger.dequeue_next(started).unwrap().as_deref(), Some("bbbb222"));
        let record = ledger.get("bbbb222").unwrap().unwrap();
        assert_eq!(record.state, ReleaseState::Running);
        assert_eq!(record.started_at.map(|t| t.timestamp_millis()), Some(started.timestamp_millis()));
        assert!(record.queued_at <= record.started_at.unwrap());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn cancel_only_removes_queued_records() {
        let (ledger, path) = open_temp("cancel");
        let now = Utc::now();
        ledger.claim("aaaa111", 0, now).unwrap(); // running
        ledger.claim("bbbb222", 0, now).unwrap(); // queued

        assert_eq!(ledger.cancel("bbbb222").unwrap(), CancelOutcome::Cancelled);
        assert!(ledger.get("bbbb222").unwrap().is_none());

        assert_eq!(
            ledger.cancel("aaaa111").unwrap(),
            CancelOutcome::Conflict(ReleaseState::Running)
        );
        assert!(ledger.get("aaaa111").unwrap().is_some());

        assert_eq!(ledger.cancel("ffff999").unwrap(), CancelOutcome::NotFound);

        ledger.finish("aaaa111", ReleaseState::Failed, now).unwrap();
        assert_eq!(
            ledger.cancel("aaaa111").unwrap(),
            CancelOutcome::Conflict(ReleaseState::Failed)
        );
        let _ = fs::remove_file(path);
    }

    #[test]
    fn finish_is_at_most_once() {
        let (ledger, path) = open_temp("finish-once");
        let now = Utc::now();
        ledger.claim("aaaa111", 0, now).unwrap();
        assert!(ledger.finish("aaaa111", ReleaseState::Timeout, now).unwrap());
        // Second terminal write is a no-op; the first outcome stands.
        assert!(!ledger.finish("aaaa111", ReleaseState::Success, now).unwrap());
        let record = ledger.get("aaaa111").unwrap().unwrap();
        assert_eq!(record.state, ReleaseState::Timeout);
        assert!(record.ended_at.is_some());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn recovery_fails_orphaned_running_rows() {
        let (ledger, path) = open_temp("recovery");
        let now = Utc::now();
        ledger.claim("aaaa111", 0, now).unwrap(); // left running by a "crash"
        ledger.claim("bbbb222", 0, now).unwrap(); // queued survivor

        let repaired = ledger.recover_interrupted(now).unwrap();
        assert_eq!(repaired, 1);
        let record = ledger.get("aaaa111").unwrap().unwrap();
        assert_eq!(record.state, ReleaseState::Failed);
        assert!(record.ended_at.is_some());
        // The queued record is untouched and now dequeueable.
        assert_eq!(ledger.dequeue_next(now).unwrap().as_deref(), Some("bbbb222"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn purge_removes_only_old_terminal_records() {
        let (ledger, path) = open_temp("purge");
        let now = Utc::now();
        let old = now - Duration::days(40);

        ledger.claim("aaaa111", 0, old).unwrap();
        ledger.finish("aaaa111", ReleaseState::Success, old).unwrap();
        ledger.claim("bbbb222", 0, old).unwrap(); // old but running
        ledger.claim("cccc333", 0, old).unwrap(); // old but queued
        ledger.claim("dddd444", 0, now).unwrap(); // recent, queued
        ledger.finish("bbbb222", ReleaseState::Failed, now).unwrap();

        let removed = ledger.purge_older_than(30, now).unwrap();
        assert_eq!(removed, 2); // aaaa111 and bbbb222: old queued_at, terminal
        assert!(ledger.get("cccc333").unwrap().is_some());
        assert!(ledger.get("dddd444").unwrap().is_some());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn metrics_average_durations_per_state() {
        let (ledger, path) = open_temp("metrics");
        let now = Utc::now();
        // success, 2 minutes
        ledger.claim("aaaa111", 0, now - Duration::minutes(10)).unwrap();
        ledger
            .finish(
                "aaaa111",
                ReleaseState::Success,
                now - Duration::minutes(8),
            )
            .unwrap();
        // failed, 3 minutes
        ledger.claim("bbbb222", 0, now - Duration::minutes(6)).unwrap();
        ledger
            .finish("bbbb222", ReleaseState::Failed, now - Duration::minutes(3))
            .unwrap();

        let metrics = ledger.metrics_since(1, now).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].state, ReleaseState::Failed);
        assert_eq!(metrics[0].count, 1);
        assert!((metrics[0].avg_duration_minutes.unwrap() - 3.0).abs() < 0.1);
        assert_eq!(metrics[1].state, ReleaseState::Success);
        assert_eq!(metrics[1].count, 1);
        assert!((metrics[1].avg_duration_minutes.unwrap() - 2.0).abs() < 0.1);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn queue_snapshot_is_in_scheduling_order() {
        let (ledger, path) = open_temp("snapshot");
        let t0 = Utc::now();
        ledger.claim("eeee000", 0, t0).unwrap(); // running
        ledger.claim("aaaa111", 0, t0 + Duration::milliseconds(1)).unwrap();
        ledger.claim("bbbb222", 5, t0 + Duration::milliseconds(2)).unwrap();
        ledger.claim("cccc333", 0, t0 + Duration::milliseconds(3)).unwrap();

        let snapshot = ledger.queue_snapshot().unwrap();
        let order: Vec<&str> = snapshot.iter().map(|e| e.commit_sha.as_str()).collect();
        assert_eq!(order, vec!["bbbb222", "aaaa111", "cccc333"]);
        let _ = fs::remove_file(path);
    }
}
