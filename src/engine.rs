//! Top-level facade wiring the schema upgrader, change log, applier, commit
//! graph and sync protocol together behind one-shot, transaction-owning
//! calls, mirroring the teacher's `with_tx` convenience pattern.

use rusqlite::{Connection, Transaction};
use serde_json::Value;

use crate::applier::{self, Conflict, Resolution};
use crate::change;
use crate::commit::{self, Commit, PushRequest, PushResponse};
use crate::error::Result;
use crate::schema::{CrrTableOptions, SchemaUpgrader};
use crate::site::{self, SiteId};
use crate::snapshot::DocumentSnapshot;
use crate::sync::{self, ApplyPullResult, PullRequest, PullResponse};

pub struct TeilenEngine<'c> {
    conn: &'c Connection,
    site: SiteId,
}

impl<'c> TeilenEngine<'c> {
    /// Install bookkeeping tables (idempotent) and resolve this replica's
    /// site identity, generating one on first open.
    pub fn open(conn: &'c Connection) -> Result<Self> {
        SchemaUpgrader::new(conn).install_bookkeeping()?;
        let site = site::current_site_id(conn)?;
        Ok(Self { conn, site })
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn schema(&self) -> SchemaUpgrader<'c> {
        SchemaUpgrader::new(self.conn)
    }

    /// Run `f` inside a transaction, committing on success and rolling back
    /// on error (the transaction guard's `Drop` handles the rollback).
    pub fn with_tx<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// §4.3 upgrade a single table to CRR tracking with the given options.
    pub fn upgrade_table_to_crr(&self, table: &str, options: &CrrTableOptions) -> Result<()> {
        self.schema().upgrade_table_to_crr(table, options)
    }

    /// §4.3 upgrade every user table with default options.
    pub fn upgrade_all_tables_to_crr(&self) -> Result<()> {
        self.schema().upgrade_all_tables_to_crr()
    }

    pub fn upgrade_column_to_fractional_index(&self, table: &str, column: &str, parent_column: &str) -> Result<()> {
        self.schema().upgrade_column_to_fractional_index(table, column, parent_column)
    }

    /// §4.3 install row triggers; must run once after all tables are
    /// upgraded and the user schema exists.
    pub fn finalize_schema(&self) -> Result<()> {
        self.schema().finalize()
    }

    pub fn insert_row(&self, document_id: &str, table: &str, row: &serde_json::Map<String, Value>) -> Result<()> {
        let schema = self.schema();
        self.with_tx(|tx| change::insert_row(tx, self.site, document_id, table, row, &schema))
    }

    pub fn update_row(&self, document_id: &str, table: &str, pk_columns: &[String], pk_values: &[Value], changes: &serde_json::Map<String, Value>) -> Result<()> {
        self.with_tx(|tx| change::update_row(tx, self.site, document_id, table, pk_columns, pk_values, changes))
    }

    pub fn delete_row(&self, document_id: &str, table: &str, pk_columns: &[String], pk_values: &[Value]) -> Result<()> {
        self.with_tx(|tx| change::delete_row(tx, self.site, document_id, table, pk_columns, pk_values))
    }

    /// §4.6 bundle every pending change for `document_id` into a commit.
    pub fn commit(&self, document_id: &str, message: &str) -> Result<Commit> {
        self.with_tx(|tx| commit::commit(tx, self.site, document_id, message))
    }

    /// §4.6 replace the current row state with the snapshot at `commit_id`.
    pub fn checkout(&self, document_id: &str, commit_id: &str) -> Result<()> {
        let schema = self.schema();
        self.with_tx(|tx| commit::checkout(tx, &schema, document_id, commit_id))
    }

    pub fn get_document_snapshot(&self, commit_id: &str) -> Result<DocumentSnapshot> {
        self.with_tx(|tx| crate::snapshot::get_document_snapshot(tx, commit_id))
    }

    pub fn get_commit_graph(&self, document_id: &str) -> Result<Vec<Commit>> {
        self.with_tx(|tx| commit::get_commit_graph(tx, document_id))
    }

    pub fn render_commit_graph(&self, document_id: &str) -> Result<String> {
        let commits = self.get_commit_graph(document_id)?;
        Ok(commit::render_ascii_graph(&commits))
    }

    /// §4.5 apply a batch of remote changes transactionally.
    pub fn apply_changes(&self, changes: &[change::Change]) -> Result<Vec<Conflict>> {
        let schema = self.schema();
        self.with_tx(|tx| applier::apply_changes(tx, &schema, changes))
    }

    pub fn get_conflicts(&self, table: &str) -> Result<Vec<Conflict>> {
        self.with_tx(|tx| applier::get_conflicts(tx, table))
    }

    pub fn resolve_conflict(&self, table: &str, pk: &str, document_id: &str, column: &str, resolution: Resolution) -> Result<()> {
        self.with_tx(|tx| applier::resolve_conflict(tx, self.site, document_id, table, pk, document_id, column, resolution))
    }

    /// §4.7 prepare this site's outgoing push request for `document_id`.
    pub fn prepare_push_commits(&self, document_id: &str) -> Result<PushRequest> {
        self.with_tx(|tx| sync::prepare_push_commits(tx, document_id))
    }

    /// §4.7 receiver side of a push: fast-forward, merge, or reject.
    pub fn receive_push_commits(&self, req: &PushRequest) -> Result<PushResponse> {
        let schema = self.schema();
        self.with_tx(|tx| commit::receive_push_commits(tx, &schema, req))
    }

    pub fn mark_pushed(&self, document_id: &str, head: &str) -> Result<()> {
        self.with_tx(|tx| sync::mark_pushed(tx, document_id, head))
    }

    pub fn prepare_pull_commits(&self, document_id: &str) -> Result<PullRequest> {
        self.with_tx(|tx| sync::prepare_pull_commits(tx, self.site, document_id))
    }

    pub fn receive_pull_commits(&self, req: &PullRequest) -> Result<PullResponse> {
        self.with_tx(|tx| sync::receive_pull_commits(tx, req))
    }

    pub fn apply_pull(&self, resp: &PullResponse) -> Result<ApplyPullResult> {
        let schema = self.schema();
        self.with_tx(|tx| sync::apply_pull(tx, &schema, resp))
    }

    /// Push `document_id`, auto-pulling and retrying (bounded, §9) whenever
    /// the receiver reports `needs-pull`.
    pub fn maybe_auto_pull<Push, Pull>(&self, document_id: &str, push: Push, pull: Pull) -> Result<PushResponse>
    where
        Push: FnMut(&PushRequest) -> Result<PushResponse>,
        Pull: FnMut(&PullRequest) -> Result<PullResponse>,
    {
        let schema = self.schema();
        self.with_tx(|tx| sync::maybe_auto_pull(tx, &schema, document_id, push, pull))
    }
}
