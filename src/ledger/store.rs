//! SQLite-backed ledger persistence.
//!
//! Key properties:
//! - WAL mode for concurrent reads during appends
//! - One write transaction per append: event + running state + optional
//!   checkpoint land together or not at all
//! - Prepared statement caching on the hot read paths
//! - (instance_id, seq_no) primary keys, so a duplicate sequence number is
//!   a constraint violation rather than silent corruption

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::checkpoint::Checkpoint;
use crate::ledger::events::{EventType, LedgerEvent};
use crate::ledger::lifecycle::{LifecycleState, Transition};
use crate::ledger::notary::NotaryReceipt;
use crate::ledger::state::RunningState;

const SCHEMA_SQL: &str = r#"
-- WAL so bundle generation can read while appends write
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;  -- 16MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS instances (
    instance_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    lifecycle_state TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS events (
    instance_id TEXT NOT NULL,
    seq_no INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    prev_hash TEXT NOT NULL,
    hash TEXT NOT NULL,
    PRIMARY KEY (instance_id, seq_no)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_type
    ON events(instance_id, event_type, seq_no);

CREATE TABLE IF NOT EXISTS checkpoints (
    instance_id TEXT NOT NULL,
    seq_no INTEGER NOT NULL,
    state_json TEXT NOT NULL,
    hmac TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (instance_id, seq_no)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS running_state (
    instance_id TEXT PRIMARY KEY,
    state_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS lifecycle_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL,
    prior_state TEXT NOT NULL,
    next_state TEXT NOT NULL,
    reason TEXT NOT NULL,
    at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lifecycle_log_instance
    ON lifecycle_log(instance_id, at_ms);

CREATE TABLE IF NOT EXISTS notary_receipts (
    instance_id TEXT NOT NULL,
    seq_no INTEGER NOT NULL,
    provider TEXT NOT NULL,
    receipt_json TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (instance_id, seq_no, provider)
) WITHOUT ROWID;
"#;

/// Registry row for one monitored instance.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRow {
    pub instance_id: String,
    pub display_name: String,
    pub lifecycle_state: LifecycleState,
    pub created_at: DateTime<Utc>,
}

/// Ledger persistence over a single SQLite connection.
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open ledger database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize ledger schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Ledger database ready at {} ({} events)", db_path, events);

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory store for tests. The WAL pragma is a no-op here, which is
    /// expected, so no journal-mode warning is emitted.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize ledger schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    // ===== INSTANCE REGISTRY =====

    /// Register an instance if it is not already known. New instances start
    /// in LIVE_MONITORING: the first appended event is already live data.
    pub fn ensure_instance(&self, instance_id: &str, display_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO instances (instance_id, display_name, lifecycle_state, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                instance_id,
                display_name,
                LifecycleState::LiveMonitoring.as_str(),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn instance(&self, instance_id: &str) -> Result<Option<InstanceRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT instance_id, display_name, lifecycle_state, created_at_ms
             FROM instances WHERE instance_id = ?1",
        )?;
        let row = stmt
            .query_map(params![instance_id], Self::row_to_instance)?
            .next()
            .transpose()?;
        Ok(row)
    }

    pub fn instances(&self) -> Result<Vec<InstanceRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT instance_id, display_name, lifecycle_state, created_at_ms
             FROM instances ORDER BY created_at_ms",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ===== EVENT CHAIN =====

    /// Sequence number and hash of the newest stored event, if any.
    pub fn head(&self, instance_id: &str) -> Result<Option<(u64, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT seq_no, hash FROM events
             WHERE instance_id = ?1 ORDER BY seq_no DESC LIMIT 1",
        )?;
        let row = stmt
            .query_map(params![instance_id], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })?
            .next()
            .transpose()?;
        Ok(row)
    }

    pub fn max_seq_no(&self, instance_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(seq_no) FROM events WHERE instance_id = ?1",
            params![instance_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    pub fn running_state(&self, instance_id: &str) -> Result<Option<RunningState>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT state_json FROM running_state WHERE instance_id = ?1")?;
        let json = stmt
            .query_map(params![instance_id], |row| row.get::<_, String>(0))?
            .next()
            .transpose()?;
        match json {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Corrupt running_state row")?,
            )),
            None => Ok(None),
        }
    }

    /// Persist one appended event, the state after it, and its checkpoint
    /// when one is due, all inside a single immediate transaction. If any
    /// statement fails the transaction rolls back on drop and the chain is
    /// untouched.
    pub fn append_atomic(
        &self,
        event: &LedgerEvent,
        state: &RunningState,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<()> {
        let payload_json = serde_json::to_string(&event.payload)?;
        let state_json = serde_json::to_string(state)?;
        let checkpoint_json = checkpoint
            .map(|c| serde_json::to_string(&c.state))
            .transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO events (instance_id, seq_no, event_type, payload_json, timestamp_ms, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &event.instance_id,
                event.seq_no as i64,
                event.event_type.as_str(),
                payload_json,
                event.timestamp.timestamp_millis(),
                &event.prev_hash,
                &event.hash,
            ],
        )
        .with_context(|| format!("Failed to insert event seq_no={}", event.seq_no))?;

        tx.execute(
            "INSERT INTO running_state (instance_id, state_json) VALUES (?1, ?2)
             ON CONFLICT(instance_id) DO UPDATE SET state_json = excluded.state_json",
            params![&event.instance_id, state_json],
        )?;

        if let (Some(checkpoint), Some(checkpoint_json)) = (checkpoint, checkpoint_json) {
            tx.execute(
                "INSERT INTO checkpoints (instance_id, seq_no, state_json, hmac, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    &checkpoint.instance_id,
                    checkpoint.seq_no as i64,
                    checkpoint_json,
                    &checkpoint.hmac,
                    checkpoint.created_at.timestamp_millis(),
                ],
            )
            .with_context(|| format!("Failed to insert checkpoint seq_no={}", checkpoint.seq_no))?;
        }

        tx.commit().context("Failed to commit append")?;
        Ok(())
    }

    pub fn events_in_range(
        &self,
        instance_id: &str,
        from_seq_no: u64,
        to_seq_no: u64,
    ) -> Result<Vec<LedgerEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT instance_id, seq_no, event_type, payload_json, timestamp_ms, prev_hash, hash
             FROM events
             WHERE instance_id = ?1 AND seq_no BETWEEN ?2 AND ?3
             ORDER BY seq_no",
        )?;
        let rows = stmt
            .query_map(
                params![instance_id, from_seq_no as i64, to_seq_no as i64],
                Self::row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn checkpoints_in_range(
        &self,
        instance_id: &str,
        from_seq_no: u64,
        to_seq_no: u64,
    ) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT instance_id, seq_no, state_json, hmac, created_at_ms
             FROM checkpoints
             WHERE instance_id = ?1 AND seq_no BETWEEN ?2 AND ?3
             ORDER BY seq_no",
        )?;
        let rows = stmt
            .query_map(
                params![instance_id, from_seq_no as i64, to_seq_no as i64],
                Self::row_to_checkpoint,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn latest_checkpoint(&self, instance_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT instance_id, seq_no, state_json, hmac, created_at_ms
             FROM checkpoints
             WHERE instance_id = ?1 ORDER BY seq_no DESC LIMIT 1",
        )?;
        let row = stmt
            .query_map(params![instance_id], Self::row_to_checkpoint)?
            .next()
            .transpose()?;
        Ok(row)
    }

    // ===== LIFECYCLE =====

    /// Apply a validated transition: flip the registry row and append the
    /// audit record in one transaction.
    pub fn set_lifecycle(&self, instance_id: &str, transition: &Transition) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE instances SET lifecycle_state = ?2 WHERE instance_id = ?1",
            params![instance_id, transition.to.as_str()],
        )?;
        tx.execute(
            "INSERT INTO lifecycle_log (instance_id, prior_state, next_state, reason, at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                instance_id,
                transition.from.as_str(),
                transition.to.as_str(),
                &transition.reason,
                transition.at.timestamp_millis(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn lifecycle_state(&self, instance_id: &str) -> Result<Option<LifecycleState>> {
        Ok(self.instance(instance_id)?.map(|row| row.lifecycle_state))
    }

    pub fn lifecycle_log(&self, instance_id: &str) -> Result<Vec<Transition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT prior_state, next_state, reason, at_ms
             FROM lifecycle_log WHERE instance_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![instance_id], |row| {
                let prior: String = row.get(0)?;
                let next: String = row.get(1)?;
                Ok(Transition {
                    from: Self::parse_lifecycle(&prior)?,
                    to: Self::parse_lifecycle(&next)?,
                    reason: row.get(2)?,
                    at: Self::ms_to_datetime(row.get(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ===== NOTARY RECEIPTS =====

    pub fn store_receipt(
        &self,
        instance_id: &str,
        seq_no: u64,
        receipt: &NotaryReceipt,
    ) -> Result<()> {
        let receipt_json = serde_json::to_string(receipt)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO notary_receipts (instance_id, seq_no, provider, receipt_json, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                instance_id,
                seq_no as i64,
                &receipt.provider,
                receipt_json,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Newest receipt whose checkpoint falls inside `[from, to]`.
    pub fn latest_receipt_in_range(
        &self,
        instance_id: &str,
        from_seq_no: u64,
        to_seq_no: u64,
    ) -> Result<Option<NotaryReceipt>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT receipt_json FROM notary_receipts
             WHERE instance_id = ?1 AND seq_no BETWEEN ?2 AND ?3
             ORDER BY seq_no DESC LIMIT 1",
        )?;
        let json = stmt
            .query_map(
                params![instance_id, from_seq_no as i64, to_seq_no as i64],
                |row| row.get::<_, String>(0),
            )?
            .next()
            .transpose()?;
        match json {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("Corrupt notary receipt row")?,
            )),
            None => Ok(None),
        }
    }

    // ===== MAINTENANCE =====

    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        info!("🔧 Ledger database optimized");
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let instances: i64 = conn.query_row("SELECT COUNT(*) FROM instances", [], |r| r.get(0))?;
        let events: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        let checkpoints: i64 =
            conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?;
        Ok(StoreStats {
            instances: instances as u64,
            events: events as u64,
            checkpoints: checkpoints as u64,
        })
    }

    // ===== ROW MAPPERS =====

    fn row_to_instance(row: &rusqlite::Row) -> rusqlite::Result<InstanceRow> {
        let state: String = row.get(2)?;
        Ok(InstanceRow {
            instance_id: row.get(0)?,
            display_name: row.get(1)?,
            lifecycle_state: Self::parse_lifecycle(&state)?,
            created_at: Self::ms_to_datetime(row.get(3)?)?,
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<LedgerEvent> {
        let event_type: String = row.get(2)?;
        let payload_json: String = row.get(3)?;
        Ok(LedgerEvent {
            instance_id: row.get(0)?,
            seq_no: row.get::<_, i64>(1)? as u64,
            event_type: EventType::from_label(&event_type)
                .ok_or_else(|| Self::corrupt(format!("unknown event type '{}'", event_type)))?,
            payload: serde_json::from_str(&payload_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            timestamp: Self::ms_to_datetime(row.get(4)?)?,
            prev_hash: row.get(5)?,
            hash: row.get(6)?,
        })
    }

    fn row_to_checkpoint(row: &rusqlite::Row) -> rusqlite::Result<Checkpoint> {
        let state_json: String = row.get(2)?;
        Ok(Checkpoint {
            instance_id: row.get(0)?,
            seq_no: row.get::<_, i64>(1)? as u64,
            state: serde_json::from_str(&state_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            hmac: row.get(3)?,
            created_at: Self::ms_to_datetime(row.get(4)?)?,
        })
    }

    fn parse_lifecycle(label: &str) -> rusqlite::Result<LifecycleState> {
        LifecycleState::from_label(label)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }

    fn ms_to_datetime(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| Self::corrupt(format!("timestamp out of range: {}", ms)))
    }

    fn corrupt(detail: String) -> rusqlite::Error {
        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            detail,
        )))
    }
}

/// Row counts for the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub instances: u64,
    pub events: u64,
    pub checkpoints: u64,
}

// =============================================================================
// TESTS
// =============================================================================
