//! §4.8 Versioning/snapshot: materialize row state at an arbitrary commit
//! by folding every change reachable from it (through merges) in HLC order.

use std::collections::HashMap;

use rusqlite::Transaction;
use serde_json::Value;

use crate::change::{self, OpType};
use crate::commit::ancestors_of;
use crate::error::Result;

pub type TableSnapshot = HashMap<String, HashMap<String, Value>>;
pub type DocumentSnapshot = HashMap<String, TableSnapshot>;

pub fn json_to_sql_value(v: &Value) -> rusqlite::types::Value {
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

/// Fold every change belonging to a commit reachable from `commit_id`
/// (walking both parents through merges) into a `{table: {pk: {col: val}}}`
/// map, processed in ascending (HLC, site_id) order — the same LWW tie-break
/// as §4.5 — so later writes win deterministically on every peer, and a
/// strictly-later insert resurrects a previously deleted row.
pub fn get_document_snapshot(tx: &Transaction<'_>, commit_id: &str) -> Result<DocumentSnapshot> {
    let mut reachable: Vec<String> = ancestors_of(tx, commit_id)?.into_iter().collect();
    reachable.sort();
    let mut changes = Vec::new();
    for id in &reachable {
        changes.extend(change::changes_for_commit(tx, id)?);
    }
    changes.sort_by_key(|c| (c.created_at, c.site_id.clone()));

    let mut snapshot: DocumentSnapshot = HashMap::new();
    for c in &changes {
        let table = snapshot.entry(c.table_name.clone()).or_default();
        match c.kind {
            OpType::Delete => {
                table.remove(&c.pk);
            }
            OpType::Insert => {
                if let Some(Value::Object(row)) = &c.value {
                    let mut cells = HashMap::new();
                    for (k, v) in row {
                        cells.insert(k.clone(), v.clone());
                    }
                    table.insert(c.pk.clone(), cells);
                }
            }
            OpType::Update => {
                if let Some(col) = &c.column {
                    let row = table.entry(c.pk.clone()).or_default();
                    row.insert(col.clone(), c.value.clone().unwrap_or(Value::Null));
                }
            }
        }
    }
    Ok(snapshot)
}
