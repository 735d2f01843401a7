//! §3 Change entity and §4.4 trigger-driven change generation.
//!
//! Row triggers do the OLD/NEW diffing natively in SQL (one trigger per
//! tracked column for UPDATE, so SQLite's own `WHEN NEW.col IS NOT OLD.col`
//! guard decides whether a change is emitted at all — this is what makes
//! "self-equal update must not refresh HLC" free: the trigger body simply
//! never runs). Each emitted row is left with `created_at = NULL` as a
//! pending marker; `exec_tracked` stamps every pending row with a fresh HLC,
//! site id and ambient document right after the statement runs, inside the
//! same transaction. This keeps the HLC (a Rust value, not reproducible in
//! pure SQL) out of trigger bodies while still using real triggers for the
//! row-level diff capture, per the Design Notes' permitted hybrid.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::fracindex::{self, APPEND_MARKER};
use crate::hlc::Hlc;
use crate::schema::{CrrColumnMeta, SchemaUpgrader};
use crate::site::SiteId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "update" => OpType::Update,
            "delete" => OpType::Delete,
            _ => OpType::Insert,
        }
    }
}

/// A row of `crr_changes`. `created_at` is `None` only transiently, between
/// trigger firing and `exec_tracked`'s stamping pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub change_id: i64,
    pub table_name: String,
    pub pk: String,
    pub column: Option<String>,
    pub kind: OpType,
    pub value: Option<Value>,
    pub created_at: Option<Hlc>,
    pub applied_at: Option<i64>,
    pub site_id: Option<String>,
    pub document_id: Option<String>,
    pub commit_id: Option<String>,
}

fn row_to_change(r: &rusqlite::Row<'_>) -> rusqlite::Result<Change> {
    let value_raw: Option<String> = r.get(4)?;
    let created_raw: Option<String> = r.get(5)?;
    Ok(Change {
        change_id: r.get(0)?,
        table_name: r.get(1)?,
        pk: r.get(2)?,
        column: r.get(3)?,
        kind: OpType::from_str(&r.get::<_, String>(9)?),
        value: value_raw.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: created_raw.and_then(|s| Hlc::decode(&s)),
        applied_at: r.get(6)?,
        site_id: r.get(7)?,
        document_id: r.get(8)?,
        commit_id: r.get(10)?,
    })
}

const CHANGE_COLUMNS: &str = "change_id, table_name, pk, column_name, value, created_at, applied_at, site_id, document_id, kind, commit_id";

/// Build the `CREATE TRIGGER` statements for one CRR table: one AFTER
/// INSERT trigger emitting a full-row JSON snapshot, one AFTER UPDATE
/// trigger per tracked column, one AFTER DELETE trigger. `document_id` is
/// excluded from per-column update tracking and used instead, when present
/// among `columns`, to resolve the change's document at emission time.
pub fn triggers_for_table(table: &str, pk_columns: &[String], columns: &[CrrColumnMeta]) -> Vec<String> {
    let has_document_col = columns.iter().any(|c| c.column == "document_id");
    let tracked: Vec<&CrrColumnMeta> = columns.iter().filter(|c| c.column != "document_id").collect();

    let pk_expr = |alias: &str| -> String {
        pk_columns
            .iter()
            .map(|c| format!("CAST({alias}.{c} AS TEXT)"))
            .collect::<Vec<_>>()
            .join(" || '|' || ")
    };
    let doc_expr = |alias: &str| -> String {
        if has_document_col { format!("{alias}.document_id") } else { "NULL".to_string() }
    };

    let mut out = Vec::new();

    let json_pairs: Vec<String> = tracked
        .iter()
        .map(|c| format!("'{}', NEW.{}", c.column, c.column))
        .collect();
    out.push(format!(
        "CREATE TRIGGER IF NOT EXISTS __crr_ai_{table}
AFTER INSERT ON {table}
BEGIN
  INSERT INTO crr_changes(table_name, pk, column_name, kind, value, created_at, applied_at, site_id, document_id, commit_id)
  SELECT '{table}', {pk_new}, NULL, 'insert', json_object({json_pairs}), NULL, NULL, NULL, {doc_new}, NULL
  WHERE NOT EXISTS (SELECT 1 FROM crr_apply_guard);
END;",
        pk_new = pk_expr("NEW"),
        doc_new = doc_expr("NEW"),
        json_pairs = json_pairs.join(", "),
    ));

    for c in &tracked {
        let col = &c.column;
        out.push(format!(
            "CREATE TRIGGER IF NOT EXISTS __crr_au_{table}_{col}
AFTER UPDATE ON {table}
WHEN NEW.{col} IS NOT OLD.{col}
BEGIN
  INSERT INTO crr_changes(table_name, pk, column_name, kind, value, created_at, applied_at, site_id, document_id, commit_id)
  SELECT '{table}', {pk_new}, '{col}', 'update', json_quote(NEW.{col}), NULL, NULL, NULL, {doc_new}, NULL
  WHERE NOT EXISTS (SELECT 1 FROM crr_apply_guard)
  ON CONFLICT(table_name, pk, column_name) WHERE kind = 'update' AND commit_id IS NULL
  DO UPDATE SET value = excluded.value, created_at = NULL, applied_at = NULL, site_id = NULL, document_id = excluded.document_id;
END;",
            pk_new = pk_expr("NEW"),
            doc_new = doc_expr("NEW"),
        ));
    }

    out.push(format!(
        "CREATE TRIGGER IF NOT EXISTS __crr_ad_{table}
AFTER DELETE ON {table}
BEGIN
  INSERT INTO crr_changes(table_name, pk, column_name, kind, value, created_at, applied_at, site_id, document_id, commit_id)
  SELECT '{table}', {pk_old}, NULL, 'delete', NULL, NULL, NULL, NULL, {doc_old}, NULL
  WHERE NOT EXISTS (SELECT 1 FROM crr_apply_guard);
END;",
        pk_old = pk_expr("OLD"),
        doc_old = doc_expr("OLD"),
    ));

    out
}

/// Hold the apply-guard open for the duration of `f`, suppressing
/// change-capture triggers while remote changes or a checkout are replayed
/// into user tables. Must be called within an active transaction so the
/// guard row is rolled back automatically on failure.
pub fn with_apply_guard<R>(tx: &Transaction<'_>, f: impl FnOnce() -> Result<R>) -> Result<R> {
    tx.execute("INSERT INTO crr_apply_guard(active) VALUES (1)", [])?;
    let result = f();
    tx.execute("DELETE FROM crr_apply_guard", [])?;
    result
}

/// Run `sql` (any tracked-table DML) then stamp whatever pending change
/// rows the triggers just emitted. This is the "statement boundary" the
/// rest of §4.4 talks about: one fresh HLC value per call, shared by every
/// row the statement touched. Takes an already-open transaction so callers
/// (the applier in particular) can compose several tracked writes into one
/// atomic batch without nesting `BEGIN`s.
pub fn exec_tracked(
    tx: &Transaction<'_>,
    site: SiteId,
    ambient_document: &str,
    sql: &str,
    sql_params: impl rusqlite::Params,
) -> Result<usize> {
    let affected = tx.execute(sql, sql_params)?;
    stamp_pending_changes(tx, site, ambient_document)?;
    Ok(affected)
}

fn stamp_pending_changes(tx: &Transaction<'_>, site: SiteId, ambient_document: &str) -> Result<()> {
    let last: Option<String> = tx
        .query_row(
            "SELECT created_at FROM crr_changes WHERE site_id = ?1 AND created_at IS NOT NULL
             ORDER BY created_at DESC LIMIT 1",
            params![site.as_str_buf()],
            |r| r.get(0),
        )
        .optional()?;
    let prev = last.and_then(|s| Hlc::decode(&s)).unwrap_or_default();
    let fresh = Hlc::send(prev);
    let now_ms = Utc::now().timestamp_millis();
    tx.execute(
        "UPDATE crr_changes
         SET created_at = ?1, applied_at = ?2, site_id = ?3, document_id = COALESCE(document_id, ?4)
         WHERE created_at IS NULL",
        params![fresh.encode(), now_ms, site.as_str_buf(), ambient_document],
    )?;
    Ok(())
}

fn json_to_sql_value(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Resolve `"|append"` markers in `row`'s fractional-index columns against
/// the current maximum sibling position, then INSERT the row. Any tracked
/// table DML issued directly as raw SQL (bypassing this helper) still
/// triggers change capture, but literal `"|append"` markers are only
/// resolved here, per SPEC_FULL.md's note that marker substitution needs
/// the same-statement context this helper provides.
pub fn insert_row(
    tx: &Transaction<'_>,
    site: SiteId,
    ambient_document: &str,
    table: &str,
    row: &serde_json::Map<String, Value>,
    schema: &SchemaUpgrader<'_>,
) -> Result<()> {
    let meta = schema.columns_for(table)?;
    let mut row = row.clone();

    for c in &meta {
        let Some(parent_col) = &c.fracindex_parent else { continue };
        let is_append = matches!(row.get(&c.column), Some(Value::String(s)) if s == APPEND_MARKER);
        if !is_append {
            continue;
        }
        let parent_val = row.get(parent_col).cloned().unwrap_or(Value::Null);
        let last = query_last_position(tx, table, &c.column, parent_col, &parent_val)?;
        let resolved = fracindex::append_position(last.as_deref(), fracindex::DIGITS_BASE10);
        row.insert(c.column.clone(), Value::String(resolved));
    }

    let cols: Vec<String> = row.keys().cloned().collect();
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        cols.join(", "),
        placeholders.join(", ")
    );
    let values: Vec<rusqlite::types::Value> = cols.iter().map(|c| json_to_sql_value(&row[c])).collect();
    exec_tracked(tx, site, ambient_document, &sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

fn query_last_position(
    tx: &Transaction<'_>,
    table: &str,
    column: &str,
    parent_column: &str,
    parent_val: &Value,
) -> Result<Option<String>> {
    let sql = if parent_val.is_null() {
        format!("SELECT {column} FROM {table} WHERE {parent_column} IS NULL ORDER BY {column} DESC LIMIT 1")
    } else {
        format!("SELECT {column} FROM {table} WHERE {parent_column} = ?1 ORDER BY {column} DESC LIMIT 1")
    };
    let result = if parent_val.is_null() {
        tx.query_row(&sql, [], |r| r.get(0)).optional()?
    } else {
        tx.query_row(&sql, params![json_to_sql_value(parent_val)], |r| r.get(0)).optional()?
    };
    Ok(result)
}

/// Update specific columns of a row by primary key (stringified, `|`-joined
/// for composite keys, matching `triggers_for_table`'s pk expression).
pub fn update_row(
    tx: &Transaction<'_>,
    site: SiteId,
    ambient_document: &str,
    table: &str,
    pk_columns: &[String],
    pk_values: &[Value],
    changes: &serde_json::Map<String, Value>,
) -> Result<()> {
    let set_cols: Vec<String> = changes.keys().cloned().collect();
    let mut idx = 1;
    let set_clause: Vec<String> = set_cols
        .iter()
        .map(|c| {
            let s = format!("{c} = ?{idx}");
            idx += 1;
            s
        })
        .collect();
    let where_clause: Vec<String> = pk_columns
        .iter()
        .map(|c| {
            let s = format!("{c} = ?{idx}");
            idx += 1;
            s
        })
        .collect();
    let sql = format!(
        "UPDATE {table} SET {} WHERE {}",
        set_clause.join(", "),
        where_clause.join(" AND ")
    );
    let mut values: Vec<rusqlite::types::Value> = set_cols.iter().map(|c| json_to_sql_value(&changes[c])).collect();
    values.extend(pk_values.iter().map(json_to_sql_value));
    exec_tracked(tx, site, ambient_document, &sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

pub fn delete_row(
    tx: &Transaction<'_>,
    site: SiteId,
    ambient_document: &str,
    table: &str,
    pk_columns: &[String],
    pk_values: &[Value],
) -> Result<()> {
    let where_clause: Vec<String> = pk_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c} = ?{}", i + 1))
        .collect();
    let sql = format!("DELETE FROM {table} WHERE {}", where_clause.join(" AND "));
    let values: Vec<rusqlite::types::Value> = pk_values.iter().map(json_to_sql_value).collect();
    exec_tracked(tx, site, ambient_document, &sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

/// Pending (uncommitted) changes for a document, in HLC order, ready to be
/// bundled by `commit()`.
pub fn pending_changes(conn: &Connection, document_id: &str) -> Result<Vec<Change>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM crr_changes
         WHERE document_id = ?1 AND commit_id IS NULL AND created_at IS NOT NULL
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt
        .query_map(params![document_id], row_to_change)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Changes belonging to a specific commit, in HLC order.
pub fn changes_for_commit(conn: &Connection, commit_id: &str) -> Result<Vec<Change>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM crr_changes WHERE commit_id = ?1 ORDER BY created_at ASC"
    ))?;
    let rows = stmt
        .query_map(params![commit_id], row_to_change)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Look up the stored change (if any) for a surviving update of (table, pk,
/// column) — used by the applier to compare HLCs before overwriting.
pub fn surviving_update(conn: &Connection, table: &str, pk: &str, column: &str) -> Result<Option<Change>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM crr_changes
         WHERE table_name = ?1 AND pk = ?2 AND column_name = ?3 AND kind = 'update'
         ORDER BY created_at DESC LIMIT 1"
    ))?;
    let row = stmt
        .query_row(params![table, pk, column], row_to_change)
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CrrTableOptions, SchemaUpgrader};

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        SchemaUpgrader::new(&conn).install_bookkeeping().unwrap();
        conn
    }

    fn site(conn: &Connection) -> SiteId {
        crate::site::current_site_id(conn).unwrap()
    }

    #[test]
    fn insert_update_delete_emit_expected_change_rows() {
        let conn = open();
        conn.execute_batch("CREATE TABLE todos (id TEXT PRIMARY KEY, name TEXT, finished INTEGER)")
            .unwrap();
        let up = SchemaUpgrader::new(&conn);
        up.upgrade_table_to_crr("todos", &CrrTableOptions::default()).unwrap();
        up.finalize().unwrap();
        let s = site(&conn);

        let mut row = serde_json::Map::new();
        row.insert("id".into(), Value::String("1".into()));
        row.insert("name".into(), Value::String("Buy milk".into()));
        row.insert("finished".into(), Value::from(0));
        let tx = conn.unchecked_transaction().unwrap();
        insert_row(&tx, s, "main", "todos", &row, &up).unwrap();
        tx.commit().unwrap();

        let pending = pending_changes(&conn, "main").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind.as_str(), "insert");
        assert_eq!(pending[0].pk, "1");
        assert!(pending[0].created_at.is_some());

        let mut changes = serde_json::Map::new();
        changes.insert("name".into(), Value::String("Buy 2 jugs of milk".into()));
        let tx = conn.unchecked_transaction().unwrap();
        update_row(&tx, s, "main", "todos", &["id".to_string()], &[Value::String("1".into())], &changes).unwrap();
        tx.commit().unwrap();

        let pending = pending_changes(&conn, "main").unwrap();
        assert_eq!(pending.len(), 2);
        let update = pending.iter().find(|c| c.kind.as_str() == "update").unwrap();
        assert_eq!(update.column.as_deref(), Some("name"));
        assert_eq!(update.value, Some(Value::String("Buy 2 jugs of milk".into())));
    }

    #[test]
    fn self_equal_update_does_not_refresh_change() {
        let conn = open();
        conn.execute_batch("CREATE TABLE todos (id TEXT PRIMARY KEY, name TEXT)").unwrap();
        let up = SchemaUpgrader::new(&conn);
        up.upgrade_table_to_crr("todos", &CrrTableOptions::default()).unwrap();
        up.finalize().unwrap();
        let s = site(&conn);

        let mut row = serde_json::Map::new();
        row.insert("id".into(), Value::String("1".into()));
        row.insert("name".into(), Value::String("Buy milk".into()));
        let tx = conn.unchecked_transaction().unwrap();
        insert_row(&tx, s, "main", "todos", &row, &up).unwrap();
        tx.commit().unwrap();

        let mut changes = serde_json::Map::new();
        changes.insert("name".into(), Value::String("Buy bread".into()));
        let tx = conn.unchecked_transaction().unwrap();
        update_row(&tx, s, "main", "todos", &["id".to_string()], &[Value::String("1".into())], &changes).unwrap();
        tx.commit().unwrap();
        let before = surviving_update(&conn, "todos", "1", "name").unwrap().unwrap();

        // writing the same value again must not touch created_at
        let tx = conn.unchecked_transaction().unwrap();
        update_row(&tx, s, "main", "todos", &["id".to_string()], &[Value::String("1".into())], &changes).unwrap();
        tx.commit().unwrap();
        let after = surviving_update(&conn, "todos", "1", "name").unwrap().unwrap();

        assert_eq!(before.created_at, after.created_at);
        assert_eq!(before.change_id, after.change_id);
    }

    #[test]
    fn supersede_keeps_single_pending_update_row() {
        let conn = open();
        conn.execute_batch("CREATE TABLE todos (id TEXT PRIMARY KEY, name TEXT)").unwrap();
        let up = SchemaUpgrader::new(&conn);
        up.upgrade_table_to_crr("todos", &CrrTableOptions::default()).unwrap();
        up.finalize().unwrap();
        let s = site(&conn);

        let mut row = serde_json::Map::new();
        row.insert("id".into(), Value::String("1".into()));
        row.insert("name".into(), Value::String("a".into()));
        let tx = conn.unchecked_transaction().unwrap();
        insert_row(&tx, s, "main", "todos", &row, &up).unwrap();
        tx.commit().unwrap();

        for v in ["b", "c", "d"] {
            let mut changes = serde_json::Map::new();
            changes.insert("name".into(), Value::String(v.into()));
            let tx = conn.unchecked_transaction().unwrap();
            update_row(&tx, s, "main", "todos", &["id".to_string()], &[Value::String("1".into())], &changes).unwrap();
            tx.commit().unwrap();
        }

        let pending = pending_changes(&conn, "main").unwrap();
        let updates: Vec<_> = pending.iter().filter(|c| c.kind.as_str() == "update").collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].value, Some(Value::String("d".into())));
    }
}
