//! Ledger store: durable record of terminals, pads, docked ships and the
//! docking event log.
//!
//! The allocator only talks to the [`LedgerStore`] trait. Its two mutating
//! operations are atomic check-and-act primitives: a ship row is inserted
//! only if its pad is vacant, and removed only if present, each together with
//! the matching log entry in one transaction.
//!
//! [`SqliteLedger`] is the shipped implementation. All statements are
//! parameterized; `ships.pad_id` carries a UNIQUE constraint so two writers
//! can never both occupy a pad, even from separate processes.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub type PadId = i32;
pub type TerminalId = i64;
/// Unix time in milliseconds.
pub type Timestamp = i64;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS terminals (
    terminal_id INTEGER PRIMARY KEY,
    name TEXT UNIQUE NOT NULL
);

CREATE TABLE IF NOT EXISTS pads (
    pad_id INTEGER PRIMARY KEY,
    terminal_id INTEGER NOT NULL,
    max_weight REAL NOT NULL CHECK (max_weight > 0),
    cost_hour INTEGER NOT NULL CHECK (cost_hour >= 0),
    cost_day INTEGER NOT NULL CHECK (cost_day >= 0),
    FOREIGN KEY (terminal_id) REFERENCES terminals (terminal_id)
        ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS ships (
    ship_id INTEGER PRIMARY KEY,
    pad_id INTEGER UNIQUE NOT NULL,
    license TEXT NOT NULL,
    weight REAL NOT NULL,
    dock_time INTEGER NOT NULL,
    FOREIGN KEY (pad_id) REFERENCES pads (pad_id)
        ON DELETE CASCADE ON UPDATE CASCADE
);

CREATE TABLE IF NOT EXISTS docking_log (
    entry_id INTEGER PRIMARY KEY,
    pad_id INTEGER NOT NULL,
    license TEXT NOT NULL,
    event TEXT NOT NULL CHECK (event IN ('dock', 'undock')),
    time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_docking_log_pad ON docking_log (pad_id, time);

CREATE TRIGGER IF NOT EXISTS ships_max_weight
BEFORE INSERT ON ships
WHEN NEW.weight > (SELECT max_weight FROM pads WHERE pad_id = NEW.pad_id)
BEGIN
    SELECT RAISE(ABORT, 'ship exceeds max weight');
END;

CREATE TRIGGER IF NOT EXISTS docking_log_no_update
BEFORE UPDATE ON docking_log
BEGIN
    SELECT RAISE(ABORT, 'docking log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS docking_log_no_delete
BEFORE DELETE ON docking_log
BEGIN
    SELECT RAISE(ABORT, 'docking log is append-only');
END;
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: TerminalId,
    pub name: String,
}

/// A landing pad with its capacity and parking rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pad {
    pub id: PadId,
    pub terminal_id: TerminalId,
    pub max_weight: f64,
    pub cost_hour: i64,
    pub cost_day: i64,
}

/// Occupancy record of a docked ship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ship {
    pub id: i64,
    pub pad_id: PadId,
    pub license: String,
    pub weight: f64,
    pub docked_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewShip {
    pub pad_id: PadId,
    pub license: String,
    pub weight: f64,
    pub docked_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEvent {
    Dock,
    Undock,
}

impl LogEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LogEvent::Dock => "dock",
            LogEvent::Undock => "undock",
        }
    }
}

impl ToSql for LogEvent {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for LogEvent {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "dock" => Ok(LogEvent::Dock),
            "undock" => Ok(LogEvent::Undock),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub pad_id: PadId,
    pub license: String,
    pub event: LogEvent,
    pub time: Timestamp,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Ledger lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Query/mutate interface the allocator needs from durable storage.
pub trait LedgerStore: Send + Sync {
    fn pad(&self, id: PadId) -> StoreResult<Option<Pad>>;

    /// The ship currently docked at `pad_id`, if any.
    fn occupant(&self, pad_id: PadId) -> StoreResult<Option<Ship>>;

    /// Lowest-id pad with `max_weight > weight` and no ship.
    fn lowest_free_pad(&self, weight: f64) -> StoreResult<Option<PadId>>;

    /// Inserts the ship iff its pad has no ship, appending a dock log entry
    /// in the same transaction. Returns `false` if the pad was occupied.
    fn insert_ship_if_vacant(&self, ship: &NewShip) -> StoreResult<bool>;

    /// Deletes the ship at `pad_id` iff one exists, appending an undock log
    /// entry stamped `at` in the same transaction.
    fn remove_ship(&self, pad_id: PadId, at: Timestamp) -> StoreResult<Option<Ship>>;

    /// Log entries in append order, optionally for one pad.
    fn docking_log(&self, pad_id: Option<PadId>) -> StoreResult<Vec<LogEntry>>;
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Opens (creating if needed) a ledger database file.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening docking ledger");

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "Ledger journal mode set");

        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn add_terminal(&self, name: &str) -> StoreResult<TerminalId> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO terminals (name) VALUES (?1)", params![name])
            .map_err(constraint_to_store_error)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_pad(
        &self,
        terminal_id: TerminalId,
        max_weight: f64,
        cost_hour: i64,
        cost_day: i64,
    ) -> StoreResult<PadId> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pads (terminal_id, max_weight, cost_hour, cost_day)
             VALUES (?1, ?2, ?3, ?4)",
            params![terminal_id, max_weight, cost_hour, cost_day],
        )
        .map_err(constraint_to_store_error)?;
        PadId::try_from(conn.last_insert_rowid())
            .map_err(|_| StoreError::Constraint("pad id exceeds wire range".into()))
    }

    /// Removes a pad; any ship docked there is removed with it.
    pub fn remove_pad(&self, id: PadId) -> StoreResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM pads WHERE pad_id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn terminals(&self) -> StoreResult<Vec<Terminal>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT terminal_id, name FROM terminals ORDER BY terminal_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Terminal {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn pads(&self) -> StoreResult<Vec<Pad>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT pad_id, terminal_id, max_weight, cost_hour, cost_day
             FROM pads ORDER BY pad_id",
        )?;
        let rows = stmt
            .query_map([], pad_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn ships(&self) -> StoreResult<Vec<Ship>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT ship_id, pad_id, license, weight, dock_time
             FROM ships ORDER BY pad_id",
        )?;
        let rows = stmt
            .query_map([], ship_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl LedgerStore for SqliteLedger {
    fn pad(&self, id: PadId) -> StoreResult<Option<Pad>> {
        let conn = self.lock()?;
        let pad = conn
            .query_row(
                "SELECT pad_id, terminal_id, max_weight, cost_hour, cost_day
                 FROM pads WHERE pad_id = ?1",
                params![id],
                pad_from_row,
            )
            .optional()?;
        Ok(pad)
    }

    fn occupant(&self, pad_id: PadId) -> StoreResult<Option<Ship>> {
        let conn = self.lock()?;
        let ship = conn
            .query_row(
                "SELECT ship_id, pad_id, license, weight, dock_time
                 FROM ships WHERE pad_id = ?1",
                params![pad_id],
                ship_from_row,
            )
            .optional()?;
        Ok(ship)
    }

    fn lowest_free_pad(&self, weight: f64) -> StoreResult<Option<PadId>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT p.pad_id FROM pads p
                 WHERE p.max_weight > ?1
                   AND NOT EXISTS (SELECT 1 FROM ships s WHERE s.pad_id = p.pad_id)
                 ORDER BY p.pad_id
                 LIMIT 1",
                params![weight],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn insert_ship_if_vacant(&self, ship: &NewShip) -> StoreResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = match tx.execute(
            "INSERT INTO ships (pad_id, license, weight, dock_time)
             SELECT ?1, ?2, ?3, ?4
             WHERE NOT EXISTS (SELECT 1 FROM ships WHERE pad_id = ?1)",
            params![ship.pad_id, ship.license, ship.weight, ship.docked_at],
        ) {
            Ok(n) => n,
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                0
            }
            Err(e) => return Err(constraint_to_store_error(e)),
        };

        if inserted == 0 {
            debug!(pad_id = ship.pad_id, "Pad already occupied, insert skipped");
            return Ok(false);
        }

        append_log(&tx, ship.pad_id, &ship.license, LogEvent::Dock, ship.docked_at)?;
        tx.commit()?;
        Ok(true)
    }

    fn remove_ship(&self, pad_id: PadId, at: Timestamp) -> StoreResult<Option<Ship>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ship = tx
            .query_row(
                "SELECT ship_id, pad_id, license, weight, dock_time
                 FROM ships WHERE pad_id = ?1",
                params![pad_id],
                ship_from_row,
            )
            .optional()?;

        let Some(ship) = ship else {
            return Ok(None);
        };

        tx.execute("DELETE FROM ships WHERE ship_id = ?1", params![ship.id])?;
        append_log(&tx, pad_id, &ship.license, LogEvent::Undock, at)?;
        tx.commit()?;
        Ok(Some(ship))
    }

    fn docking_log(&self, pad_id: Option<PadId>) -> StoreResult<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, pad_id, license, event, time FROM docking_log
             WHERE ?1 IS NULL OR pad_id = ?1
             ORDER BY entry_id",
        )?;
        let rows = stmt
            .query_map(params![pad_id], |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    pad_id: row.get(1)?,
                    license: row.get(2)?,
                    event: row.get(3)?,
                    time: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Appends a log entry. The stored time never goes below the latest entry,
/// so the log stays ordered even if the wall clock steps back.
fn append_log(
    conn: &Connection,
    pad_id: PadId,
    license: &str,
    event: LogEvent,
    at: Timestamp,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO docking_log (pad_id, license, event, time)
         SELECT ?1, ?2, ?3, MAX(?4, COALESCE((SELECT MAX(time) FROM docking_log), ?4))",
        params![pad_id, license, event, at],
    )?;
    Ok(())
}

fn pad_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pad> {
    Ok(Pad {
        id: row.get(0)?,
        terminal_id: row.get(1)?,
        max_weight: row.get(2)?,
        cost_hour: row.get(3)?,
        cost_day: row.get(4)?,
    })
}

fn ship_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ship> {
    Ok(Ship {
        id: row.get(0)?,
        pad_id: row.get(1)?,
        license: row.get(2)?,
        weight: row.get(3)?,
        docked_at: row.get(4)?,
    })
}

fn constraint_to_store_error(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(e, message) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Constraint(message.unwrap_or_else(|| e.to_string()))
        }
        other => StoreError::Database(other),
    }
}
