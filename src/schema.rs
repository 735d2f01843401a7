//! §4.3 Schema upgrader: CRR column metadata + installation of the
//! bookkeeping tables and row triggers that back change generation.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::change::triggers_for_table;
use crate::error::{Result, TeilenError};

/// Per-column conflict-resolution policy (§3 CRR-column metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictMode {
    Lww,
    Manual,
}

impl ConflictMode {
    fn as_str(self) -> &'static str {
        match self {
            ConflictMode::Lww => "lww",
            ConflictMode::Manual => "manual",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "manual" => ConflictMode::Manual,
            _ => ConflictMode::Lww,
        }
    }
}

/// Metadata for one (table, column) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrrColumnMeta {
    pub table: String,
    pub column: String,
    pub mode: ConflictMode,
    pub fracindex_parent: Option<String>,
}

/// Per-table upgrade options. `manual_columns` lists columns that should be
/// flagged `manual` instead of the default `lww`.
#[derive(Debug, Clone, Default)]
pub struct CrrTableOptions {
    pub manual_columns: Vec<String>,
}

/// The idempotent DDL script for all bookkeeping tables named in §6.
const INSTALL_SQL: &str = r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS crr_client (
    site_id TEXT NOT NULL
);

-- Presence of a row here suppresses change-capture triggers; the applier
-- and checkout hold this open for the duration of their transaction so
-- that replaying history or merging remote changes never re-logs as a
-- fresh local edit.
CREATE TABLE IF NOT EXISTS crr_apply_guard (
    active INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crr_documents (
    id TEXT PRIMARY KEY,
    head TEXT,
    last_pulled_at INTEGER,
    last_pushed_commit TEXT,
    last_pulled_commit TEXT
);

CREATE TABLE IF NOT EXISTS crr_columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    mode TEXT NOT NULL CHECK(mode IN ('lww','manual')),
    fracindex_parent TEXT,
    PRIMARY KEY (table_name, column_name)
);

CREATE TABLE IF NOT EXISTS crr_changes (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    pk TEXT NOT NULL,
    column_name TEXT,
    kind TEXT NOT NULL CHECK(kind IN ('insert','update','delete')),
    value TEXT,
    created_at TEXT,
    applied_at INTEGER,
    site_id TEXT,
    document_id TEXT,
    commit_id TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_crr_changes_supersede
ON crr_changes(table_name, pk, column_name)
WHERE kind = 'update' AND commit_id IS NULL;

CREATE INDEX IF NOT EXISTS idx_crr_changes_pending_commit
ON crr_changes(document_id, commit_id);

CREATE INDEX IF NOT EXISTS idx_crr_changes_site_created
ON crr_changes(site_id, created_at DESC);

CREATE TABLE IF NOT EXISTS crr_commits (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    message TEXT NOT NULL,
    author_site TEXT NOT NULL,
    created_at TEXT NOT NULL,
    parent1 TEXT,
    parent2 TEXT
);

CREATE TABLE IF NOT EXISTS crr_conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    pk TEXT NOT NULL,
    document_id TEXT NOT NULL,
    columns TEXT NOT NULL,
    our_value TEXT,
    their_value TEXT,
    resolution_state TEXT NOT NULL DEFAULT 'open' CHECK(resolution_state IN ('open','resolved')),
    UNIQUE(table_name, pk, document_id)
);
"#;

pub struct SchemaUpgrader<'c> {
    conn: &'c Connection,
}

impl<'c> SchemaUpgrader<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Install bookkeeping tables. Safe to call multiple times.
    pub fn install_bookkeeping(&self) -> Result<()> {
        self.conn.execute_batch(INSTALL_SQL)?;
        Ok(())
    }

    /// Mark every column of `table` as tracked, defaulting to `lww` except
    /// for `options.manual_columns`. Idempotent: re-upgrading does not
    /// disturb an already-recorded mode for a column.
    pub fn upgrade_table_to_crr(&self, table: &str, options: &CrrTableOptions) -> Result<()> {
        let columns = table_columns(self.conn, table)?;
        if columns.is_empty() {
            return Err(TeilenError::MalformedRequest(format!("unknown table {table}")));
        }
        for col in columns {
            let mode = if options.manual_columns.iter().any(|c| c == &col) {
                ConflictMode::Manual
            } else {
                ConflictMode::Lww
            };
            self.conn.execute(
                "INSERT INTO crr_columns(table_name, column_name, mode, fracindex_parent)
                 VALUES (?1, ?2, ?3, NULL)
                 ON CONFLICT(table_name, column_name) DO NOTHING",
                rusqlite::params![table, col, mode.as_str()],
            )?;
        }
        Ok(())
    }

    /// Flag `column` as fractional-index ordered, with siblings grouped by
    /// `parent_column`.
    pub fn upgrade_column_to_fractional_index(
        &self,
        table: &str,
        column: &str,
        parent_column: &str,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE crr_columns SET fracindex_parent = ?1
             WHERE table_name = ?2 AND column_name = ?3",
            rusqlite::params![parent_column, table, column],
        )?;
        if changed == 0 {
            return Err(TeilenError::SchemaNotUpgraded(table.to_string()));
        }
        Ok(())
    }

    /// Apply `upgrade_table_to_crr` with defaults to every user table
    /// (everything in `sqlite_master` that isn't a `crr_*` bookkeeping
    /// table or an internal `sqlite_*` table).
    pub fn upgrade_all_tables_to_crr(&self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'crr_%'",
        )?;
        let names: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        for table in names {
            self.upgrade_table_to_crr(&table, &CrrTableOptions::default())?;
        }
        Ok(())
    }

    /// Commit the recorded metadata and (re)install row triggers on every
    /// upgraded table. Must run after the user schema exists and before any
    /// tracked DML. Re-running is idempotent.
    pub fn finalize(&self) -> Result<()> {
        let tables = self.upgraded_tables()?;
        for table in tables {
            let columns = self.columns_for(&table)?;
            let pk_columns = primary_key_columns(self.conn, &table)?;
            if pk_columns.is_empty() {
                return Err(TeilenError::MalformedRequest(format!(
                    "table {table} has no primary key; CRR tracking requires one"
                )));
            }
            for sql in triggers_for_table(&table, &pk_columns, &columns) {
                self.conn.execute_batch(&sql)?;
            }
        }
        tracing::info!("finalized CRR schema");
        Ok(())
    }

    fn upgraded_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT table_name FROM crr_columns")?;
        let names = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn columns_for(&self, table: &str) -> Result<Vec<CrrColumnMeta>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name, column_name, mode, fracindex_parent
             FROM crr_columns WHERE table_name = ?1",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![table], |r| {
                Ok(CrrColumnMeta {
                    table: r.get(0)?,
                    column: r.get(1)?,
                    mode: ConflictMode::from_str(&r.get::<_, String>(2)?),
                    fracindex_parent: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Primary key column names in declaration order (supports composite keys).
pub fn primary_key_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt
        .query_map([], |r| {
            Ok((r.get::<_, i64>(5)?, r.get::<_, String>(1)?)) // (pk ordinal, name)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.retain(|(pk, _)| *pk > 0);
    rows.sort_by_key(|(pk, _)| *pk);
    Ok(rows.into_iter().map(|(_, name)| name).collect())
}
