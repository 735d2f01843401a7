//! §4.6 Commit graph: per-document DAG of commits, LCA via reverse BFS,
//! checkout, and the fast-forward/merge/needs-pull decision in
//! `receive_push_commits`.

use std::collections::{HashMap, HashSet, VecDeque};

use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::change::{self, Change};
use crate::error::{Result, TeilenError};
use crate::hlc::Hlc;
use crate::schema::SchemaUpgrader;
use crate::site::SiteId;
use crate::snapshot::get_document_snapshot;

/// A node in a document's commit DAG (§3 Commit entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub document_id: String,
    pub message: String,
    pub author_site: String,
    pub created_at: Hlc,
    pub parent1: Option<String>,
    pub parent2: Option<String>,
}

fn row_to_commit(r: &rusqlite::Row<'_>) -> rusqlite::Result<Commit> {
    let created_raw: String = r.get(4)?;
    Ok(Commit {
        id: r.get(0)?,
        document_id: r.get(1)?,
        message: r.get(2)?,
        author_site: r.get(3)?,
        created_at: Hlc::decode(&created_raw).unwrap_or_default(),
        parent1: r.get(5)?,
        parent2: r.get(6)?,
    })
}

const COMMIT_COLUMNS: &str = "id, document_id, message, author_site, created_at, parent1, parent2";

fn get_commit(tx: &Transaction<'_>, commit_id: &str) -> Result<Commit> {
    tx.query_row(
        &format!("SELECT {COMMIT_COLUMNS} FROM crr_commits WHERE id = ?1"),
        params![commit_id],
        row_to_commit,
    )
    .optional()?
    .ok_or_else(|| TeilenError::UnknownCommit(commit_id.to_string()))
}

fn ensure_document(tx: &Transaction<'_>, document_id: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO crr_documents(id, head, last_pulled_at, last_pushed_commit, last_pulled_commit)
         VALUES (?1, NULL, NULL, NULL, NULL)
         ON CONFLICT(id) DO NOTHING",
        params![document_id],
    )?;
    Ok(())
}

/// Crate-visible accessor for `sync::maybe_auto_pull`, which needs the
/// current head *after* a pull has folded in, to pick out which of the
/// newly-learned commits (if any) is still foreign to it.
pub(crate) fn current_head(tx: &Transaction<'_>, document_id: &str) -> Result<Option<String>> {
    document_head(tx, document_id)
}

fn document_head(tx: &Transaction<'_>, document_id: &str) -> Result<Option<String>> {
    ensure_document(tx, document_id)?;
    let head: Option<String> = tx.query_row(
        "SELECT head FROM crr_documents WHERE id = ?1",
        params![document_id],
        |r| r.get(0),
    )?;
    Ok(head)
}

fn set_document_head(tx: &Transaction<'_>, document_id: &str, head: &str) -> Result<()> {
    tx.execute(
        "UPDATE crr_documents SET head = ?1 WHERE id = ?2",
        params![head, document_id],
    )?;
    Ok(())
}

/// Bundle every un-committed change for `document_id` into a fresh commit
/// whose parent is the current head (or no parent, if this is the first
/// commit on the document).
pub fn commit(tx: &Transaction<'_>, site: SiteId, document_id: &str, message: &str) -> Result<Commit> {
    let pending = change::pending_changes(tx, document_id)?;
    if pending.is_empty() {
        return Err(TeilenError::MalformedRequest(format!(
            "no pending changes for document {document_id}"
        )));
    }
    let head = document_head(tx, document_id)?;
    let created_at = Hlc::send(pending.iter().filter_map(|c| c.created_at).max().unwrap_or_default());
    let id = uuid::Uuid::new_v4().to_string();

    tx.execute(
        "INSERT INTO crr_commits(id, document_id, message, author_site, created_at, parent1, parent2)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
        params![id, document_id, message, site.to_string(), created_at.encode(), head],
    )?;
    tx.execute(
        "UPDATE crr_changes SET commit_id = ?1 WHERE document_id = ?2 AND commit_id IS NULL",
        params![id, document_id],
    )?;
    set_document_head(tx, document_id, &id)?;

    tracing::info!(document_id, commit_id = %id, "created commit");
    get_commit(tx, &id)
}

/// Parents of a commit, empty for a root commit.
fn parents(c: &Commit) -> Vec<String> {
    [&c.parent1, &c.parent2].into_iter().flatten().cloned().collect()
}

/// Every commit reachable from `start` by walking parent edges, including
/// itself. Shared with `snapshot::get_document_snapshot`, which needs the
/// same reachability set to fold merge history.
pub(crate) fn ancestors_of(tx: &Transaction<'_>, start: &str) -> Result<HashSet<String>> {
    ancestors(tx, start)
}

/// Fast-forward the local document head to `candidate` if doing so doesn't
/// discard local history: either there's no head yet, the head already is
/// `candidate`, or `candidate` descends from the current head. Used after
/// folding a pull response into local state, so a subsequent local `commit`
/// parents off the newly learned tip instead of a stale one. Never moves the
/// head backward or across a genuine divergence (that needs a push/merge).
pub(crate) fn advance_head_if_descendant(tx: &Transaction<'_>, document_id: &str, candidate: &str) -> Result<()> {
    let current = document_head(tx, document_id)?;
    let should_advance = match &current {
        None => true,
        Some(head) if head == candidate => false,
        Some(head) => ancestors(tx, candidate)?.contains(head),
    };
    if should_advance {
        set_document_head(tx, document_id, candidate)?;
    }
    Ok(())
}

fn ancestors(tx: &Transaction<'_>, start: &str) -> Result<HashSet<String>> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.to_string());
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let c = get_commit(tx, &id)?;
        for p in parents(&c) {
            queue.push_back(p);
        }
    }
    Ok(seen)
}

/// Lowest common ancestor of two commits via reverse BFS: walk both parent
/// chains breadth-first, return the first id seen by both frontiers.
pub fn lca(tx: &Transaction<'_>, a: &str, b: &str) -> Result<Option<String>> {
    if a == b {
        return Ok(Some(a.to_string()));
    }
    let a_ancestors = ancestors(tx, a)?;
    let mut queue = VecDeque::new();
    let mut seen = HashSet::new();
    queue.push_back(b.to_string());
    while let Some(id) = queue.pop_front() {
        if a_ancestors.contains(&id) {
            return Ok(Some(id));
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        let c = get_commit(tx, &id)?;
        for p in parents(&c) {
            queue.push_back(p);
        }
    }
    Ok(None)
}

/// Replace the current contents of every tracked table belonging to
/// `document_id` with the row state at `commit_id`, then move head there.
/// Suppresses change capture for the duration (this is a history replay,
/// not a new local edit).
pub fn checkout(tx: &Transaction<'_>, schema: &SchemaUpgrader<'_>, document_id: &str, commit_id: &str) -> Result<()> {
    get_commit(tx, commit_id)?; // validates existence
    let snapshot = get_document_snapshot(tx, commit_id)?;

    change::with_apply_guard(tx, || {
        for (table, rows) in &snapshot {
            let pk_cols = crate::schema::primary_key_columns(tx, table)?;
            if pk_cols.is_empty() {
                continue;
            }
            tx.execute(&format!("DELETE FROM {table}"), [])?;
            for cells in rows.values() {
                if cells.is_empty() {
                    continue;
                }
                let cols: Vec<String> = cells.keys().cloned().collect();
                let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
                let sql = format!("INSERT INTO {table} ({}) VALUES ({})", cols.join(", "), placeholders.join(", "));
                let values: Vec<rusqlite::types::Value> = cols.iter().map(|c| crate::snapshot::json_to_sql_value(&cells[c])).collect();
                tx.execute(&sql, rusqlite::params_from_iter(values))?;
            }
        }
        Ok(())
    })?;

    set_document_head(tx, document_id, commit_id)?;
    let _ = schema; // kept for symmetry with other top-level ops; no per-table metadata needed here
    tracing::info!(document_id, commit_id, "checked out commit");
    Ok(())
}

/// Visualization adjacency: every commit for `document_id`, newest first.
pub fn get_commit_graph(tx: &Transaction<'_>, document_id: &str) -> Result<Vec<Commit>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {COMMIT_COLUMNS} FROM crr_commits WHERE document_id = ?1 ORDER BY created_at DESC"
    ))?;
    let rows = stmt
        .query_map(params![document_id], row_to_commit)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Render a commit list as a simple ASCII DAG, one line per commit, oldest
/// first, `*` markers joined by `|` for multi-parent commits.
pub fn render_ascii_graph(commits: &[Commit]) -> String {
    let mut by_id: HashMap<&str, &Commit> = HashMap::new();
    for c in commits {
        by_id.insert(&c.id, c);
    }
    let mut ordered: Vec<&Commit> = commits.iter().collect();
    ordered.sort_by_key(|c| c.created_at);

    let mut out = String::new();
    for c in ordered {
        let short = &c.id[..c.id.len().min(8)];
        let marker = if c.parent2.is_some() { "*m" } else { "* " };
        out.push_str(&format!("{marker} {short}  {}\n", c.message));
        for p in parents(c) {
            if let Some(pc) = by_id.get(p.as_str()) {
                out.push_str(&format!("|\\ parent {}\n", &pc.id[..pc.id.len().min(8)]));
            }
        }
    }
    out
}

/// §4.7 push request/response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub document_id: String,
    pub from_commit: Option<String>,
    pub commits: Vec<Commit>,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    Ok,
    NeedsPull,
    RequestContainedNoCommits,
    RequestMalformed,
}

impl PushStatus {
    pub fn http_code(self) -> u16 {
        match self {
            PushStatus::Ok => 200,
            PushStatus::NeedsPull => 409,
            PushStatus::RequestContainedNoCommits | PushStatus::RequestMalformed => 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: PushStatus,
    pub code: u16,
    pub document_id: String,
    pub applied_at: i64,
    pub head: Option<String>,
}

/// Receive a batch of commits pushed by a peer. Decides fast-forward,
/// already-known, merge, or needs-pull per §4.6.
pub fn receive_push_commits(tx: &Transaction<'_>, _schema: &SchemaUpgrader<'_>, req: &PushRequest) -> Result<PushResponse> {
    let applied_at = chrono::Utc::now().timestamp_millis();
    if req.commits.is_empty() {
        return Ok(PushResponse {
            status: PushStatus::RequestContainedNoCommits,
            code: PushStatus::RequestContainedNoCommits.http_code(),
            document_id: req.document_id.clone(),
            applied_at,
            head: document_head(tx, &req.document_id)?,
        });
    }

    ensure_document(tx, &req.document_id)?;
    let local_head = document_head(tx, &req.document_id)?;

    // Insert any commit rows we don't already have (verbatim; ids are
    // opaque and collisions are treated as idempotent replays).
    for c in &req.commits {
        tx.execute(
            "INSERT INTO crr_commits(id, document_id, message, author_site, created_at, parent1, parent2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
            params![c.id, c.document_id, c.message, c.author_site, c.created_at.encode(), c.parent1, c.parent2],
        )?;
    }
    for c in &req.changes {
        tx.execute(
            "INSERT INTO crr_changes(table_name, pk, column_name, kind, value, created_at, applied_at, site_id, document_id, commit_id)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
             WHERE NOT EXISTS (SELECT 1 FROM crr_changes WHERE site_id = ?8 AND created_at = ?6)",
            params![
                c.table_name, c.pk, c.column, c.kind.as_str(),
                c.value.as_ref().map(|v| v.to_string()),
                c.created_at.map(|h| h.encode()),
                c.applied_at, c.site_id, c.document_id, c.commit_id,
            ],
        )?;
    }

    let remote_tip = &req.commits.last().unwrap().id;

    let Some(local_head) = local_head else {
        // No local history yet: fast-forward straight to the remote tip.
        set_document_head(tx, &req.document_id, remote_tip)?;
        return Ok(PushResponse {
            status: PushStatus::Ok,
            code: PushStatus::Ok.http_code(),
            document_id: req.document_id.clone(),
            applied_at,
            head: Some(remote_tip.clone()),
        });
    };

    if ancestors(tx, remote_tip)?.contains(&local_head) {
        // Local head is an ancestor of (or equal to) the remote tip: fast-forward.
        set_document_head(tx, &req.document_id, remote_tip)?;
        return Ok(PushResponse {
            status: PushStatus::Ok,
            code: PushStatus::Ok.http_code(),
            document_id: req.document_id.clone(),
            applied_at,
            head: Some(remote_tip.clone()),
        });
    }

    if ancestors(tx, &local_head)?.contains(remote_tip) {
        // We already have everything the pusher sent.
        return Ok(PushResponse {
            status: PushStatus::Ok,
            code: PushStatus::Ok.http_code(),
            document_id: req.document_id.clone(),
            applied_at,
            head: Some(local_head),
        });
    }

    // Genuine divergence: the pusher is missing commits we already have
    // (our head isn't on the pushed chain and the pushed tip isn't on
    // ours). Per the worked merge-commit scenario, we don't fabricate a
    // merge here — we reject so the pusher pulls our side, merges locally
    // (see `merge_diverged`), and pushes again as a fast-forward.
    Ok(PushResponse {
        status: PushStatus::NeedsPull,
        code: PushStatus::NeedsPull.http_code(),
        document_id: req.document_id.clone(),
        applied_at,
        head: Some(local_head),
    })
}

/// Create a local merge commit joining the current head with `remote_tip`,
/// called by the pulling side after folding a pull response into local
/// state (§9: merge-commit `author_site` is the receiver of the exchange
/// that creates it — here, the site doing the pull). Returns `None` when
/// there's nothing to merge: no local head yet, the tips already match, or
/// one tip already descends from the other (a plain fast-forward, handled
/// by `advance_head_if_descendant`).
pub fn merge_diverged(tx: &Transaction<'_>, site: SiteId, document_id: &str, remote_tip: &str) -> Result<Option<Commit>> {
    let Some(local_head) = document_head(tx, document_id)? else { return Ok(None) };
    if local_head == remote_tip {
        return Ok(None);
    }
    if ancestors(tx, remote_tip)?.contains(&local_head) || ancestors(tx, &local_head)?.contains(remote_tip) {
        return Ok(None);
    }

    let merge_id = uuid::Uuid::new_v4().to_string();
    let local_created = get_commit(tx, &local_head)?.created_at;
    let remote_created = get_commit(tx, remote_tip)?.created_at;
    let merge_created = Hlc::send(local_created.max(remote_created));
    tx.execute(
        "INSERT INTO crr_commits(id, document_id, message, author_site, created_at, parent1, parent2)
         VALUES (?1, ?2, 'merge', ?3, ?4, ?5, ?6)",
        params![merge_id, document_id, site.to_string(), merge_created.encode(), local_head, remote_tip],
    )?;
    // Any still-uncommitted local changes (there shouldn't usually be any
    // at this point, but a concurrent local edit is possible) ride along
    // on the merge commit rather than being silently dropped.
    tx.execute(
        "UPDATE crr_changes SET commit_id = ?1 WHERE document_id = ?2 AND commit_id IS NULL",
        params![merge_id, document_id],
    )?;
    set_document_head(tx, document_id, &merge_id)?;
    tracing::info!(document_id, commit_id = %merge_id, "created merge commit");
    get_commit(tx, &merge_id).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        SchemaUpgrader::new(&conn).install_bookkeeping().unwrap();
        conn
    }

    fn setup_todos(conn: &Connection) -> SiteId {
        conn.execute_batch("CREATE TABLE todos (id TEXT PRIMARY KEY, name TEXT)").unwrap();
        let up = SchemaUpgrader::new(conn);
        up.upgrade_table_to_crr("todos", &crate::schema::CrrTableOptions::default()).unwrap();
        up.finalize().unwrap();
        crate::site::current_site_id(conn).unwrap()
    }

    fn insert(conn: &Connection, site: SiteId, id: &str) {
        let up = SchemaUpgrader::new(conn);
        let mut row = serde_json::Map::new();
        row.insert("id".into(), serde_json::Value::String(id.into()));
        row.insert("name".into(), serde_json::Value::String(id.into()));
        let tx = conn.unchecked_transaction().unwrap();
        change::insert_row(&tx, site, "main", "todos", &row, &up).unwrap();
        tx.commit().unwrap();
    }

    /// Two branches off a shared root: root -> a, root -> b. `lca(a, b)`
    /// must find the shared root, not either tip.
    #[test]
    fn lca_of_two_branches_from_a_shared_commit() {
        let conn = open();
        let site = setup_todos(&conn);

        insert(&conn, site, "1");
        let root = commit(&conn.unchecked_transaction().unwrap(), site, "main", "root").unwrap();

        insert(&conn, site, "2");
        let branch_a = commit(&conn.unchecked_transaction().unwrap(), site, "main", "a").unwrap();

        // `b`'s tx parents off the same root id `a` did, by resetting head.
        {
            let tx = conn.unchecked_transaction().unwrap();
            set_document_head(&tx, "main", &root.id).unwrap();
            tx.commit().unwrap();
        }
        insert(&conn, site, "3");
        let branch_b = commit(&conn.unchecked_transaction().unwrap(), site, "main", "b").unwrap();
        assert_eq!(branch_b.parent1.as_deref(), Some(root.id.as_str()));

        let tx = conn.unchecked_transaction().unwrap();
        let found = lca(&tx, &branch_a.id, &branch_b.id).unwrap();
        assert_eq!(found, Some(root.id));

        // a commit is its own LCA with itself
        let found_self = lca(&tx, &branch_a.id, &branch_a.id).unwrap();
        assert_eq!(found_self, Some(branch_a.id));
    }

    #[test]
    fn commit_then_checkout_restores_prior_snapshot() {
        let conn = open();
        let site = setup_todos(&conn);

        insert(&conn, site, "1");
        let first = commit(&conn.unchecked_transaction().unwrap(), site, "main", "first").unwrap();

        let mut changes = serde_json::Map::new();
        changes.insert("name".into(), serde_json::Value::String("renamed".into()));
        let tx = conn.unchecked_transaction().unwrap();
        change::update_row(&tx, site, "main", "todos", &["id".to_string()], &[serde_json::Value::String("1".into())], &changes).unwrap();
        tx.commit().unwrap();
        let second = commit(&conn.unchecked_transaction().unwrap(), site, "main", "second").unwrap();

        let schema = SchemaUpgrader::new(&conn);
        let tx = conn.unchecked_transaction().unwrap();
        checkout(&tx, &schema, "main", &first.id).unwrap();
        tx.commit().unwrap();
        let name: String = conn.query_row("SELECT name FROM todos WHERE id = '1'", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "1");

        let tx = conn.unchecked_transaction().unwrap();
        checkout(&tx, &schema, "main", &second.id).unwrap();
        tx.commit().unwrap();
        let name: String = conn.query_row("SELECT name FROM todos WHERE id = '1'", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "renamed");

        let head: String = conn.query_row("SELECT head FROM crr_documents WHERE id = 'main'", [], |r| r.get(0)).unwrap();
        assert_eq!(head, second.id);
    }
}
