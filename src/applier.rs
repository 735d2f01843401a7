//! §4.5 Applier & conflict engine: deterministic merge of remote changes
//! into local state under LWW-per-cell, with a manual-conflict side
//! channel. Runs inside one SQL transaction; any internal failure rolls the
//! whole batch back.

use std::collections::HashMap;

use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::{self, Change, OpType};
use crate::error::Result;
use crate::hlc::Hlc;
use crate::schema::{ConflictMode, SchemaUpgrader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionState {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub table_name: String,
    pub pk: String,
    pub document_id: String,
    pub columns: Vec<String>,
    pub our_value: serde_json::Map<String, Value>,
    pub their_value: serde_json::Map<String, Value>,
    pub resolution_state: ResolutionState,
}

/// Caller's choice when resolving a conflict (§4.5).
pub enum Resolution {
    Ours,
    Theirs,
    Value(Value),
}

/// Apply a batch of remote changes transactionally and idempotently.
/// Returns the conflicts newly surfaced (or re-touched) by this batch.
pub fn apply_changes(
    tx: &Transaction<'_>,
    schema: &SchemaUpgrader<'_>,
    changes: &[Change],
) -> Result<Vec<Conflict>> {
    let mut sorted: Vec<&Change> = changes.iter().collect();
    sorted.sort_by_key(|c| c.created_at);

    let mut pk_cols_cache: HashMap<String, Vec<String>> = HashMap::new();
    let mut mode_cache: HashMap<(String, String), ConflictMode> = HashMap::new();
    let mut touched: Vec<(String, String, String)> = Vec::new();

    change::with_apply_guard(tx, || {
        for c in &sorted {
            if already_applied(tx, c)? {
                continue;
            }
            let pk_cols = pk_cols_cache
                .entry(c.table_name.clone())
                .or_insert_with(|| crate::schema::primary_key_columns(tx, &c.table_name).unwrap_or_default())
                .clone();

            match c.kind {
                OpType::Insert | OpType::Delete => apply_existence_change(tx, c, &pk_cols)?,
                OpType::Update => {
                    let col = c.column.clone().unwrap_or_default();
                    let mode = *mode_cache
                        .entry((c.table_name.clone(), col.clone()))
                        .or_insert_with(|| {
                            schema
                                .columns_for(&c.table_name)
                                .ok()
                                .and_then(|cols| cols.into_iter().find(|m| m.column == col))
                                .map(|m| m.mode)
                                .unwrap_or(ConflictMode::Lww)
                        });
                    if let Some(conflict_key) = apply_update(tx, c, &pk_cols, mode)? {
                        touched.push(conflict_key);
                    }
                }
            }
        }
        Ok(())
    })?;

    touched
        .into_iter()
        .map(|(table, pk, doc)| load_conflict(tx, &table, &pk, &doc))
        .collect::<Result<Vec<_>>>()
}

fn already_applied(tx: &Transaction<'_>, c: &Change) -> Result<bool> {
    let (Some(site_id), Some(created_at)) = (&c.site_id, c.created_at) else {
        return Ok(false);
    };
    let seen: Option<i64> = tx
        .query_row(
            "SELECT change_id FROM crr_changes WHERE site_id = ?1 AND created_at = ?2",
            params![site_id, created_at.encode()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(seen.is_some())
}

fn insert_change_verbatim(tx: &Transaction<'_>, c: &Change) -> Result<()> {
    tx.execute(
        "INSERT INTO crr_changes(table_name, pk, column_name, kind, value, created_at, applied_at, site_id, document_id, commit_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            c.table_name,
            c.pk,
            c.column,
            c.kind.as_str(),
            c.value.as_ref().map(|v| v.to_string()),
            c.created_at.map(|h| h.encode()),
            chrono::Utc::now().timestamp_millis(),
            c.site_id,
            c.document_id,
            c.commit_id,
        ],
    )?;
    Ok(())
}

fn pk_values(pk: &str) -> Vec<String> {
    pk.split('|').map(|s| s.to_string()).collect()
}

fn row_exists(tx: &Transaction<'_>, table: &str, pk_cols: &[String], pk: &str) -> Result<bool> {
    let where_clause: Vec<String> = pk_cols.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 1)).collect();
    let sql = format!("SELECT 1 FROM {table} WHERE {}", where_clause.join(" AND "));
    let values = pk_values(pk);
    let found: Option<i64> = tx.query_row(&sql, rusqlite::params_from_iter(values), |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

fn delete_row_raw(tx: &Transaction<'_>, table: &str, pk_cols: &[String], pk: &str) -> Result<()> {
    let where_clause: Vec<String> = pk_cols.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 1)).collect();
    let sql = format!("DELETE FROM {table} WHERE {}", where_clause.join(" AND "));
    tx.execute(&sql, rusqlite::params_from_iter(pk_values(pk)))?;
    Ok(())
}

fn create_row_from_json(tx: &Transaction<'_>, table: &str, row: &serde_json::Map<String, Value>) -> Result<()> {
    if row.is_empty() {
        return Ok(());
    }
    let cols: Vec<String> = row.keys().cloned().collect();
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
    let sql = format!("INSERT INTO {table} ({}) VALUES ({})", cols.join(", "), placeholders.join(", "));
    let values: Vec<rusqlite::types::Value> = cols.iter().map(|c| json_to_sql_value(&row[c])).collect();
    tx.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

fn write_cell(tx: &Transaction<'_>, table: &str, pk_cols: &[String], pk: &str, column: &str, value: &Value) -> Result<()> {
    let mut idx = 1;
    let set = format!("{column} = ?{idx}");
    idx += 1;
    let where_clause: Vec<String> = pk_cols
        .iter()
        .map(|c| {
            let s = format!("{c} = ?{idx}");
            idx += 1;
            s
        })
        .collect();
    let sql = format!("UPDATE {table} SET {set} WHERE {}", where_clause.join(" AND "));
    let mut values = vec![json_to_sql_value(value)];
    values.extend(pk_values(pk).into_iter().map(|s| rusqlite::types::Value::Text(s)));
    tx.execute(&sql, rusqlite::params_from_iter(values))?;
    Ok(())
}

fn read_cell(tx: &Transaction<'_>, table: &str, pk_cols: &[String], pk: &str, column: &str) -> Result<Option<Value>> {
    let where_clause: Vec<String> = pk_cols.iter().enumerate().map(|(i, c)| format!("{c} = ?{}", i + 1)).collect();
    let sql = format!("SELECT {column} FROM {table} WHERE {}", where_clause.join(" AND "));
    let raw: Option<rusqlite::types::Value> = tx
        .query_row(&sql, rusqlite::params_from_iter(pk_values(pk)), |r| r.get(0))
        .optional()?;
    Ok(raw.map(sql_value_to_json))
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

fn sql_value_to_json(v: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as SqlValue;
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).to_string()),
    }
}

/// Most recent insert/delete change recorded for a pk, used to decide
/// whether the row should currently exist (§4.5 points 2–3, §9's
/// delete-vs-later-insert resolution: existence tracks the max-HLC event).
fn latest_existence_event(tx: &Transaction<'_>, table: &str, pk: &str) -> Result<Option<(OpType, Change)>> {
    let mut stmt = tx.prepare(
        "SELECT change_id, table_name, pk, column_name, value, created_at, applied_at, site_id, document_id, kind, commit_id
         FROM crr_changes
         WHERE table_name = ?1 AND pk = ?2 AND kind IN ('insert','delete')
         ORDER BY created_at DESC LIMIT 1",
    )?;
    let row = stmt
        .query_row(params![table, pk], |r| {
            let value_raw: Option<String> = r.get(4)?;
            let created_raw: Option<String> = r.get(5)?;
            Ok(Change {
                change_id: r.get(0)?,
                table_name: r.get(1)?,
                pk: r.get(2)?,
                column: r.get(3)?,
                value: value_raw.and_then(|s| serde_json::from_str(&s).ok()),
                created_at: created_raw.and_then(|s| Hlc::decode(&s)),
                applied_at: r.get(6)?,
                site_id: r.get(7)?,
                document_id: r.get(8)?,
                kind: OpType::from_str(&r.get::<_, String>(9)?),
                commit_id: r.get(10)?,
            })
        })
        .optional()?;
    Ok(row.map(|c| (c.kind, c)))
}

fn apply_existence_change(tx: &Transaction<'_>, c: &Change, pk_cols: &[String]) -> Result<()> {
    insert_change_verbatim(tx, c)?;

    let Some((kind, winner)) = latest_existence_event(tx, &c.table_name, &c.pk)? else { return Ok(()) };
    let exists = row_exists(tx, &c.table_name, pk_cols, &c.pk)?;

    match kind {
        OpType::Delete => {
            if exists {
                delete_row_raw(tx, &c.table_name, pk_cols, &c.pk)?;
            }
        }
        OpType::Insert => {
            if !exists {
                if let Some(Value::Object(row)) = &winner.value {
                    create_row_from_json(tx, &c.table_name, row)?;
                }
            }
        }
        OpType::Update => unreachable!("latest_existence_event only returns insert/delete"),
    }
    Ok(())
}

/// Returns `Some((table, pk, document))` when this update surfaced or
/// updated a manual conflict, so the caller can reload and return it.
fn apply_update(
    tx: &Transaction<'_>,
    c: &Change,
    pk_cols: &[String],
    mode: ConflictMode,
) -> Result<Option<(String, String, String)>> {
    let column = c.column.clone().unwrap_or_default();
    let c_hlc = c.created_at.expect("remote changes must carry an HLC");

    let existing = change::surviving_update(tx, &c.table_name, &c.pk, &column)?;
    let c_wins = match &existing {
        None => true,
        Some(e) => {
            let e_hlc = e.created_at.expect("surviving update always has an HLC");
            if c_hlc != e_hlc {
                c_hlc > e_hlc
            } else {
                c.site_id.as_deref().unwrap_or("") > e.site_id.as_deref().unwrap_or("")
            }
        }
    };

    insert_change_verbatim(tx, c)?;

    if mode == ConflictMode::Manual {
        if let Some(e) = &existing {
            // Approximates "c is not a causal descendant of e" by site
            // equality rather than true ancestry: a different site_id is
            // treated as a concurrent edit and surfaced, regardless of which
            // side the HLC race favors (a losing concurrent edit is still a
            // real conflict, not just noise to discard). A same-site chain
            // of edits is always causal by construction (monotonic per-site
            // HLC), so this only mislabels a true cross-site causal edit as
            // concurrent — it never misses a genuine concurrent edit.
            if e.site_id != c.site_id {
                let our_value = read_cell(tx, &c.table_name, pk_cols, &c.pk, &column)?.unwrap_or(Value::Null);
                let document_id = c.document_id.clone().unwrap_or_else(|| "main".to_string());
                record_conflict(tx, &c.table_name, &c.pk, &document_id, &column, our_value, c.value.clone().unwrap_or(Value::Null))?;
                tracing::warn!(table = %c.table_name, pk = %c.pk, column = %column, "manual conflict surfaced");
                return Ok(Some((c.table_name.clone(), c.pk.clone(), document_id)));
            }
        }
    }

    if !c_wins {
        return Ok(None);
    }

    if let Some(value) = &c.value {
        write_cell(tx, &c.table_name, pk_cols, &c.pk, &column, value)?;
    }
    Ok(None)
}

fn record_conflict(
    tx: &Transaction<'_>,
    table: &str,
    pk: &str,
    document_id: &str,
    column: &str,
    our: Value,
    their: Value,
) -> Result<()> {
    let existing: Option<(String, Option<String>, Option<String>)> = tx
        .query_row(
            "SELECT columns, our_value, their_value FROM crr_conflicts WHERE table_name = ?1 AND pk = ?2 AND document_id = ?3",
            params![table, pk, document_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let mut columns: Vec<String> = existing
        .as_ref()
        .and_then(|(c, _, _)| serde_json::from_str(c).ok())
        .unwrap_or_default();
    let mut our_map: serde_json::Map<String, Value> = existing
        .as_ref()
        .and_then(|(_, o, _)| o.as_ref().and_then(|s| serde_json::from_str(s).ok()))
        .unwrap_or_default();
    let mut their_map: serde_json::Map<String, Value> = existing
        .as_ref()
        .and_then(|(_, _, t)| t.as_ref().and_then(|s| serde_json::from_str(s).ok()))
        .unwrap_or_default();

    if !columns.iter().any(|c| c == column) {
        columns.push(column.to_string());
    }
    our_map.insert(column.to_string(), our);
    their_map.insert(column.to_string(), their);

    tx.execute(
        "INSERT INTO crr_conflicts(table_name, pk, document_id, columns, our_value, their_value, resolution_state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open')
         ON CONFLICT(table_name, pk, document_id) DO UPDATE SET
           columns = excluded.columns, our_value = excluded.our_value, their_value = excluded.their_value, resolution_state = 'open'",
        params![
            table,
            pk,
            document_id,
            serde_json::to_string(&columns)?,
            serde_json::to_string(&our_map)?,
            serde_json::to_string(&their_map)?,
        ],
    )?;
    Ok(())
}

fn load_conflict(tx: &Transaction<'_>, table: &str, pk: &str, document_id: &str) -> Result<Conflict> {
    tx.query_row(
        "SELECT id, table_name, pk, document_id, columns, our_value, their_value, resolution_state
         FROM crr_conflicts WHERE table_name = ?1 AND pk = ?2 AND document_id = ?3",
        params![table, pk, document_id],
        |r| {
            let columns_raw: String = r.get(4)?;
            let our_raw: Option<String> = r.get(5)?;
            let their_raw: Option<String> = r.get(6)?;
            let state: String = r.get(7)?;
            Ok(Conflict {
                id: r.get(0)?,
                table_name: r.get(1)?,
                pk: r.get(2)?,
                document_id: r.get(3)?,
                columns: serde_json::from_str(&columns_raw).unwrap_or_default(),
                our_value: our_raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default(),
                their_value: their_raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default(),
                resolution_state: if state == "resolved" { ResolutionState::Resolved } else { ResolutionState::Open },
            })
        },
    )
    .map_err(Into::into)
}

/// Whether `document_id` has any unresolved manual conflict. Consulted by
/// the push path (§7: a push must be rejected while open conflicts remain on
/// the document being pushed, not silently carried along).
pub fn has_open_conflicts(tx: &Transaction<'_>, document_id: &str) -> Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM crr_conflicts WHERE document_id = ?1 AND resolution_state = 'open'",
        params![document_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// List open conflicts for a table.
pub fn get_conflicts(tx: &Transaction<'_>, table: &str) -> Result<Vec<Conflict>> {
    let mut stmt = tx.prepare(
        "SELECT id, table_name, pk, document_id, columns, our_value, their_value, resolution_state
         FROM crr_conflicts WHERE table_name = ?1 AND resolution_state = 'open'",
    )?;
    let rows = stmt
        .query_map(params![table], |r| {
            let columns_raw: String = r.get(4)?;
            let our_raw: Option<String> = r.get(5)?;
            let their_raw: Option<String> = r.get(6)?;
            Ok(Conflict {
                id: r.get(0)?,
                table_name: r.get(1)?,
                pk: r.get(2)?,
                document_id: r.get(3)?,
                columns: serde_json::from_str(&columns_raw).unwrap_or_default(),
                our_value: our_raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default(),
                their_value: their_raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default(),
                resolution_state: ResolutionState::Open,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Resolve an open conflict by writing the chosen value as a fresh local
/// update (new HLC) and marking it resolved.
pub fn resolve_conflict(
    tx: &Transaction<'_>,
    site: crate::site::SiteId,
    ambient_document: &str,
    table: &str,
    pk: &str,
    document_id: &str,
    column: &str,
    resolution: Resolution,
) -> Result<()> {
    let conflict = load_conflict(tx, table, pk, document_id)?;
    let chosen = match resolution {
        Resolution::Ours => conflict.our_value.get(column).cloned().unwrap_or(Value::Null),
        Resolution::Theirs => conflict.their_value.get(column).cloned().unwrap_or(Value::Null),
        Resolution::Value(v) => v,
    };

    let pk_cols = crate::schema::primary_key_columns(tx, table)?;
    let mut changes = serde_json::Map::new();
    changes.insert(column.to_string(), chosen);
    let pk_vals: Vec<Value> = pk_values(pk).into_iter().map(Value::String).collect();
    change::update_row(tx, site, ambient_document, table, &pk_cols, &pk_vals, &changes)?;

    tx.execute(
        "UPDATE crr_conflicts SET resolution_state = 'resolved' WHERE table_name = ?1 AND pk = ?2 AND document_id = ?3",
        params![table, pk, document_id],
    )?;
    Ok(())
}
