//! §8 concrete end-to-end scenarios (everything but the HLC network
//! simulation, covered separately in `hlc_prop.rs`): cell LWW and manual
//! conflicts, a genuine merge commit across three replicas, fractional
//! insertion, checkout round-tripping, and idempotent remote apply.

use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use teilen_sql::{Change, CrrTableOptions, Hlc, OpType, PushStatus, Resolution, TeilenEngine};

const DOC: &str = "doc1";

fn setup_todos<'a>(conn: &'a Connection, manual_columns: &[&str]) -> TeilenEngine<'a> {
    let engine = TeilenEngine::open(conn).unwrap();
    conn.execute_batch("CREATE TABLE todos (id TEXT PRIMARY KEY, name TEXT, finished INTEGER)")
        .unwrap();
    let options = CrrTableOptions {
        manual_columns: manual_columns.iter().map(|s| s.to_string()).collect(),
    };
    engine.upgrade_table_to_crr("todos", &options).unwrap();
    engine.finalize_schema().unwrap();
    engine
}

fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn change_map(column: &str, value: Value) -> Map<String, Value> {
    row(&[(column, value)])
}

fn read_name(conn: &Connection, id: &str) -> String {
    conn.query_row("SELECT name FROM todos WHERE id = ?1", params![id], |r| r.get(0)).unwrap()
}

fn todo_ids(conn: &Connection) -> Vec<String> {
    let mut stmt = conn.prepare("SELECT id FROM todos ORDER BY id").unwrap();
    stmt.query_map([], |r| r.get(0)).unwrap().collect::<rusqlite::Result<_>>().unwrap()
}

/// Head commit of a document, assuming (true of every scenario here) that the
/// most recently created commit is the current head.
fn head_of(engine: &TeilenEngine<'_>, doc: &str) -> String {
    engine.get_commit_graph(doc).unwrap().into_iter().next().unwrap().id
}

fn pull_into(from: &TeilenEngine<'_>, into: &TeilenEngine<'_>, doc: &str) {
    let req = into.prepare_pull_commits(doc).unwrap();
    let resp = from.receive_pull_commits(&req).unwrap();
    into.apply_pull(&resp).unwrap();
}

#[test]
fn cell_lww_later_hlc_wins() {
    let conn_a = Connection::open_in_memory().unwrap();
    let conn_b = Connection::open_in_memory().unwrap();
    let conn_s = Connection::open_in_memory().unwrap();
    let a = setup_todos(&conn_a, &[]);
    let b = setup_todos(&conn_b, &[]);
    let s = setup_todos(&conn_s, &[]);

    a.insert_row(DOC, "todos", &row(&[("id", "1".into()), ("name", "Buy milk".into()), ("finished", 0.into())]))
        .unwrap();
    a.commit(DOC, "insert").unwrap();
    a.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();

    pull_into(&s, &b, DOC);

    a.update_row(DOC, "todos", &["id".to_string()], &[Value::String("1".into())], &change_map("name", "Buy 2 jugs of milk".into()))
        .unwrap();
    a.commit(DOC, "rename-a").unwrap();
    a.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();

    b.update_row(DOC, "todos", &["id".to_string()], &[Value::String("1".into())], &change_map("name", "Buy coffee".into()))
        .unwrap();
    b.commit(DOC, "rename-b").unwrap();
    b.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();

    // B's rename landed later on the wall clock, so it should be the value
    // every replica converges on once A catches up too.
    pull_into(&s, &a, DOC);

    assert_eq!(read_name(&conn_a, "1"), "Buy coffee");
    assert_eq!(read_name(&conn_b, "1"), "Buy coffee");
    let snapshot = s.get_document_snapshot(&head_of(&s, DOC)).unwrap();
    assert_eq!(snapshot["todos"]["1"]["name"], Value::String("Buy coffee".into()));
    assert!(b.get_conflicts("todos").unwrap().is_empty());
}

#[test]
fn manual_column_concurrent_edit_surfaces_conflict() {
    // Both `name` and `finished` are manual here, mirroring the scenario's
    // premise, even though only `name` is actually touched concurrently.
    let conn_a = Connection::open_in_memory().unwrap();
    let conn_b = Connection::open_in_memory().unwrap();
    let conn_s = Connection::open_in_memory().unwrap();
    let a = setup_todos(&conn_a, &["name", "finished"]);
    let b = setup_todos(&conn_b, &["name", "finished"]);
    let s = setup_todos(&conn_s, &["name", "finished"]);

    a.insert_row(DOC, "todos", &row(&[("id", "1".into()), ("name", "Buy milk".into()), ("finished", 0.into())]))
        .unwrap();
    a.commit(DOC, "insert").unwrap();
    a.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();
    pull_into(&s, &b, DOC);

    a.update_row(DOC, "todos", &["id".to_string()], &[Value::String("1".into())], &change_map("name", "Buy 2 jugs of milk".into()))
        .unwrap();
    a.commit(DOC, "rename-a").unwrap();
    a.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();

    b.update_row(DOC, "todos", &["id".to_string()], &[Value::String("1".into())], &change_map("name", "Buy coffee".into()))
        .unwrap();
    b.commit(DOC, "rename-b").unwrap();
    // The first push attempt gets needs-pull, pulls A's rename in, and that
    // pull is what surfaces the manual conflict on column "name". A document
    // with an open conflict can't be pushed, so the sync stops there instead
    // of retrying — the pull still lands, it just doesn't get followed by a
    // completed push.
    let push_result = b.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();
    assert_eq!(push_result.status, PushStatus::NeedsPull);

    // A manual column never auto-resolves a concurrent edit, win or lose:
    // B's own later write stays live and the older remote write is parked
    // in a Conflict instead.
    assert_eq!(read_name(&conn_b, "1"), "Buy coffee");

    let conflicts = b.get_conflicts("todos").unwrap();
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.pk, "1");
    assert_eq!(conflict.columns, vec!["name".to_string()]);
    assert_eq!(conflict.our_value.get("name"), Some(&Value::String("Buy coffee".into())));
    assert_eq!(conflict.their_value.get("name"), Some(&Value::String("Buy 2 jugs of milk".into())));

    // Once resolved, the push that was blocked goes through.
    b.resolve_conflict("todos", "1", DOC, "name", Resolution::Ours).unwrap();
    b.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();
    assert!(b.get_conflicts("todos").unwrap().is_empty());
}

#[test]
fn merge_commit_converges_three_replicas() {
    let conn_a = Connection::open_in_memory().unwrap();
    let conn_b = Connection::open_in_memory().unwrap();
    let conn_s = Connection::open_in_memory().unwrap();
    let a = setup_todos(&conn_a, &[]);
    let b = setup_todos(&conn_b, &[]);
    let s = setup_todos(&conn_s, &[]);

    b.insert_row(DOC, "todos", &row(&[("id", "2".into()), ("name", "X".into()), ("finished", 0.into())])).unwrap();
    b.commit(DOC, "X").unwrap();

    a.insert_row(DOC, "todos", &row(&[("id", "1".into()), ("name", "A".into()), ("finished", 0.into())])).unwrap();
    a.commit(DOC, "A").unwrap();
    a.insert_row(DOC, "todos", &row(&[("id", "3".into()), ("name", "B".into()), ("finished", 0.into())])).unwrap();
    a.commit(DOC, "B").unwrap();

    a.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();
    // B's history shares no ancestor with A's: the first push attempt is
    // rejected needs-pull, B pulls and merges locally, then retries.
    b.maybe_auto_pull(DOC, |req| s.receive_push_commits(req), |req| s.receive_pull_commits(req)).unwrap();
    pull_into(&s, &a, DOC);

    assert_eq!(a.get_commit_graph(DOC).unwrap().len(), 4);
    assert_eq!(b.get_commit_graph(DOC).unwrap().len(), 4);
    assert_eq!(s.get_commit_graph(DOC).unwrap().len(), 4);

    let expected = vec!["1".to_string(), "2".to_string(), "3".to_string()];
    assert_eq!(todo_ids(&conn_a), expected);
    assert_eq!(todo_ids(&conn_b), expected);

    let snapshot = s.get_document_snapshot(&head_of(&s, DOC)).unwrap();
    let mut s_ids: Vec<String> = snapshot["todos"].keys().cloned().collect();
    s_ids.sort();
    assert_eq!(s_ids, expected);
}

#[test]
fn fractional_insert_orders_by_position() {
    let conn = Connection::open_in_memory().unwrap();
    let engine = TeilenEngine::open(&conn).unwrap();
    conn.execute_batch("CREATE TABLE items (id TEXT PRIMARY KEY, list_id TEXT, position TEXT)").unwrap();
    engine.upgrade_table_to_crr("items", &CrrTableOptions::default()).unwrap();
    engine.upgrade_column_to_fractional_index("items", "position", "list_id").unwrap();
    engine.finalize_schema().unwrap();

    engine
        .insert_row(DOC, "items", &row(&[("id", "1".into()), ("list_id", Value::Null), ("position", "|append".into())]))
        .unwrap();
    engine
        .insert_row(DOC, "items", &row(&[("id", "2".into()), ("list_id", Value::Null), ("position", "|append".into())]))
        .unwrap();
    // An explicit, already-resolved position bypasses append entirely and
    // sorts wherever its literal value lands — "1" is less than the first
    // append's midpoint ("5", per `mid("[", "]")`), so this row ends up
    // before both appended ones.
    engine
        .insert_row(DOC, "items", &row(&[("id", "3".into()), ("list_id", Value::Null), ("position", "1".into())]))
        .unwrap();

    let mut stmt = conn.prepare("SELECT id FROM items ORDER BY position").unwrap();
    let ids: Vec<String> = stmt.query_map([], |r| r.get(0)).unwrap().collect::<rusqlite::Result<_>>().unwrap();
    assert_eq!(ids, vec!["3".to_string(), "1".to_string(), "2".to_string()]);

    let positions: Vec<String> = conn
        .prepare("SELECT position FROM items ORDER BY id")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert!(positions[0] < positions[1], "second append must sort after the first");
}

#[test]
fn checkout_restores_row_state_and_moves_head() {
    let conn = Connection::open_in_memory().unwrap();
    let engine = setup_todos(&conn, &[]);

    engine
        .insert_row(DOC, "todos", &row(&[("id", "1".into()), ("name", "Buy milk".into()), ("finished", 0.into())]))
        .unwrap();
    let commit1 = engine.commit(DOC, "insert").unwrap();

    engine
        .update_row(
            DOC,
            "todos",
            &["id".to_string()],
            &[Value::String("1".into())],
            &row(&[("name", "Buy Coffee".into()), ("finished", 1.into())]),
        )
        .unwrap();
    let commit2 = engine.commit(DOC, "update").unwrap();

    engine.checkout(DOC, &commit1.id).unwrap();
    let name: String = conn.query_row("SELECT name FROM todos WHERE id = '1'", [], |r| r.get(0)).unwrap();
    let finished: i64 = conn.query_row("SELECT finished FROM todos WHERE id = '1'", [], |r| r.get(0)).unwrap();
    assert_eq!(name, "Buy milk");
    assert_eq!(finished, 0);

    engine.checkout(DOC, &commit2.id).unwrap();
    let name: String = conn.query_row("SELECT name FROM todos WHERE id = '1'", [], |r| r.get(0)).unwrap();
    let finished: i64 = conn.query_row("SELECT finished FROM todos WHERE id = '1'", [], |r| r.get(0)).unwrap();
    assert_eq!(name, "Buy Coffee");
    assert_eq!(finished, 1);

    let head: String = conn.query_row("SELECT head FROM crr_documents WHERE id = ?1", params![DOC], |r| r.get(0)).unwrap();
    assert_eq!(head, commit2.id);
}

#[test]
fn applying_the_same_batch_twice_is_a_no_op_the_second_time() {
    let conn = Connection::open_in_memory().unwrap();
    let engine = setup_todos(&conn, &[]);

    let insert = Change {
        change_id: 0,
        table_name: "todos".to_string(),
        pk: "1".to_string(),
        column: None,
        kind: OpType::Insert,
        value: Some(serde_json::json!({"id": "1", "name": "Buy milk", "finished": 0})),
        created_at: Some(Hlc { pt: 1_700_000_000_000, lt: 0 }),
        applied_at: None,
        site_id: Some("remote-site".to_string()),
        document_id: Some(DOC.to_string()),
        commit_id: Some("remote-commit-1".to_string()),
    };

    let conflicts_first = engine.apply_changes(&[insert.clone()]).unwrap();
    assert!(conflicts_first.is_empty());
    let rows_after_first: i64 = conn.query_row("SELECT COUNT(*) FROM todos", [], |r| r.get(0)).unwrap();
    let changes_after_first: i64 = conn
        .query_row("SELECT COUNT(*) FROM crr_changes WHERE site_id = 'remote-site'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows_after_first, 1);
    assert_eq!(changes_after_first, 1);

    let conflicts_second = engine.apply_changes(&[insert]).unwrap();
    assert!(conflicts_second.is_empty());
    let rows_after_second: i64 = conn.query_row("SELECT COUNT(*) FROM todos", [], |r| r.get(0)).unwrap();
    let changes_after_second: i64 = conn
        .query_row("SELECT COUNT(*) FROM crr_changes WHERE site_id = 'remote-site'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows_after_second, 1);
    assert_eq!(changes_after_second, 1);
    assert_eq!(read_name(&conn, "1"), "Buy milk");
}
