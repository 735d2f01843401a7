//! §4.7 Sync protocol: prepare/consume push and pull payloads, and the
//! bounded auto-pull retry loop for a push rejected with `needs-pull`.

use std::thread;
use std::time::Duration;

use rusqlite::{Transaction, params};
use serde::{Deserialize, Serialize};

use crate::applier::{self, Conflict};
use crate::change::{self, Change};
use crate::commit::{self, Commit, PushRequest, PushResponse, PushStatus};
use crate::error::{Result, TeilenError};
use crate::schema::SchemaUpgrader;
use crate::site::SiteId;

/// §4.7 pull request/response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub document_id: String,
    pub site_id: String,
    pub since_commit: Option<String>,
    pub last_pulled_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub code: u16,
    pub document_id: String,
    pub commits: Vec<Commit>,
    pub changes: Vec<Change>,
    pub pulled_at: i64,
}

/// Per-document result of folding a pull response into local state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyPullResult {
    pub document_id: String,
    pub conflicts: Vec<Conflict>,
}

fn document_cursor(tx: &Transaction<'_>, document_id: &str) -> Result<(Option<String>, Option<String>, Option<i64>)> {
    tx.query_row(
        "SELECT last_pushed_commit, last_pulled_commit, last_pulled_at FROM crr_documents WHERE id = ?1",
        params![document_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .map_err(|_| TeilenError::MalformedRequest(format!("unknown document {document_id}")))
}

/// Gather every commit (and its changes) strictly descending from this
/// site's recorded `last_pushed_commit`, ready to hand to a transport.
///
/// Rejects with `ConflictPending` if the document has any unresolved manual
/// conflict (§7): a push must not carry a document whose live rows still
/// disagree with what the other side expects until the conflict is resolved.
pub fn prepare_push_commits(tx: &Transaction<'_>, document_id: &str) -> Result<PushRequest> {
    if applier::has_open_conflicts(tx, document_id)? {
        return Err(TeilenError::ConflictPending);
    }

    let (last_pushed, _, _) = document_cursor(tx, document_id)?;
    let graph = commit::get_commit_graph(tx, document_id)?;

    let already_pushed = match &last_pushed {
        Some(id) => commit::ancestors_of(tx, id)?,
        None => Default::default(),
    };
    let mut pending: Vec<Commit> = graph.into_iter().filter(|c| !already_pushed.contains(&c.id)).collect();
    pending.sort_by_key(|c| c.created_at);

    let mut changes = Vec::new();
    for c in &pending {
        changes.extend(change::changes_for_commit(tx, &c.id)?);
    }

    Ok(PushRequest {
        document_id: document_id.to_string(),
        from_commit: last_pushed,
        commits: pending,
        changes,
    })
}

/// Record that a push was accepted, advancing the local `last_pushed_commit`
/// cursor. Only called once the remote peer has confirmed `ok`.
pub fn mark_pushed(tx: &Transaction<'_>, document_id: &str, head: &str) -> Result<()> {
    tx.execute(
        "UPDATE crr_documents SET last_pushed_commit = ?1 WHERE id = ?2",
        params![head, document_id],
    )?;
    Ok(())
}

/// Build a pull request for everything since this site's recorded
/// `last_pulled_commit`.
pub fn prepare_pull_commits(tx: &Transaction<'_>, site: SiteId, document_id: &str) -> Result<PullRequest> {
    let (_, last_pulled, last_pulled_at) = document_cursor(tx, document_id)?;
    Ok(PullRequest {
        document_id: document_id.to_string(),
        site_id: site.to_string(),
        since_commit: last_pulled,
        last_pulled_at,
    })
}

/// A peer answering a `PullRequest`: everything reachable from its head
/// that the requester's `since_commit` hasn't seen yet.
pub fn receive_pull_commits(tx: &Transaction<'_>, req: &PullRequest) -> Result<PullResponse> {
    let graph = commit::get_commit_graph(tx, &req.document_id)?;
    let seen = match &req.since_commit {
        Some(id) => commit::ancestors_of(tx, id)?,
        None => Default::default(),
    };
    let mut commits: Vec<Commit> = graph.into_iter().filter(|c| !seen.contains(&c.id)).collect();
    commits.sort_by_key(|c| c.created_at);

    let mut changes = Vec::new();
    for c in &commits {
        changes.extend(change::changes_for_commit(tx, &c.id)?);
    }

    Ok(PullResponse {
        code: 200,
        document_id: req.document_id.clone(),
        commits,
        changes,
        pulled_at: chrono::Utc::now().timestamp_millis(),
    })
}

/// Apply a pull response: insert any new commits/changes verbatim, run the
/// applier over changes not already assigned to a commit we have, and
/// advance the local pull cursor.
pub fn apply_pull(tx: &Transaction<'_>, schema: &SchemaUpgrader<'_>, resp: &PullResponse) -> Result<ApplyPullResult> {
    for c in &resp.commits {
        tx.execute(
            "INSERT INTO crr_commits(id, document_id, message, author_site, created_at, parent1, parent2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
            params![c.id, c.document_id, c.message, c.author_site, c.created_at.encode(), c.parent1, c.parent2],
        )?;
    }

    let conflicts = applier::apply_changes(tx, schema, &resp.changes)?;

    for c in &resp.changes {
        if let Some(commit_id) = &c.commit_id {
            tx.execute(
                "UPDATE crr_changes SET commit_id = ?1 WHERE table_name = ?2 AND pk = ?3 AND site_id = ?4 AND created_at = ?5",
                params![commit_id, c.table_name, c.pk, c.site_id, c.created_at.map(|h| h.encode())],
            )?;
        }
    }

    if let Some(tip) = resp.commits.last() {
        tx.execute(
            "UPDATE crr_documents SET last_pulled_commit = ?1, last_pulled_at = ?2 WHERE id = ?3",
            params![tip.id, resp.pulled_at, resp.document_id],
        )?;
        commit::advance_head_if_descendant(tx, &resp.document_id, &tip.id)?;
    } else {
        tx.execute(
            "UPDATE crr_documents SET last_pulled_at = ?1 WHERE id = ?2",
            params![resp.pulled_at, resp.document_id],
        )?;
    }

    Ok(ApplyPullResult { document_id: resp.document_id.clone(), conflicts })
}

/// Push, and on `needs-pull`, pull then retry, up to 3 attempts total with
/// exponential backoff between retries (§9 open question: bounded retry
/// recommended over an unbounded loop under sustained contention).
pub fn maybe_auto_pull<Push, Pull>(
    tx: &Transaction<'_>,
    schema: &SchemaUpgrader<'_>,
    document_id: &str,
    mut push: Push,
    mut pull: Pull,
) -> Result<PushResponse>
where
    Push: FnMut(&PushRequest) -> Result<PushResponse>,
    Pull: FnMut(&PullRequest) -> Result<PullResponse>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let site = crate::site::current_site_id(tx)?;

    for attempt in 0..MAX_ATTEMPTS {
        let req = prepare_push_commits(tx, document_id)?;
        let resp = push(&req)?;

        match resp.status {
            PushStatus::Ok => {
                if let Some(head) = &resp.head {
                    mark_pushed(tx, document_id, head)?;
                }
                return Ok(resp);
            }
            PushStatus::NeedsPull => {
                let pull_req = prepare_pull_commits(tx, site, document_id)?;
                let pull_resp = pull(&pull_req)?;
                apply_pull(tx, schema, &pull_resp)?;

                // The pull didn't fast-forward us (that's exactly why we were
                // told needs-pull). Find whichever pulled commit is still
                // foreign to our (possibly just-advanced) head and join with
                // it, so the retry above is a fast-forward from the other
                // side. Can't just take the last pulled commit: a peer that
                // already rejected one of our own pushes stores our commits
                // too, so they can come back to us in a later pull.
                if let Some(head) = commit::current_head(tx, document_id)? {
                    let known = commit::ancestors_of(tx, &head)?;
                    let foreign_tip = pull_resp
                        .commits
                        .iter()
                        .rev()
                        .find(|c| c.id != head && !known.contains(&c.id))
                        .map(|c| c.id.clone());
                    if let Some(tip) = foreign_tip {
                        commit::merge_diverged(tx, site, document_id, &tip)?;
                    }
                }

                // That pull may itself be what surfaced a manual conflict
                // (the remote change we just applied collided with a local
                // one). Retrying the push would only hit `prepare_push_commits`'s
                // own `ConflictPending` guard and, since this whole call is one
                // transaction, take the pull we just folded in down with it.
                // Stop here instead: this response still commits, so the pull
                // lands and the caller can see the conflict via
                // `get_conflicts` before syncing again.
                if applier::has_open_conflicts(tx, document_id)? {
                    return Ok(resp);
                }

                if attempt + 1 < MAX_ATTEMPTS {
                    thread::sleep(Duration::from_millis(100 * 2u64.pow(attempt)));
                }
            }
            PushStatus::RequestContainedNoCommits | PushStatus::RequestMalformed => return Ok(resp),
        }
    }

    Err(TeilenError::NeedsPull)
}
