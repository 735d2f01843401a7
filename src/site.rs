use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::Result;

/// A replica identity. Established on first open, immutable afterward —
/// process-wide configuration initialized once, per §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub Uuid);

impl SiteId {
    pub fn as_str_buf(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Load the site id from `crr_client`, generating and persisting one on
/// first call. Safe to call repeatedly; later calls return the same id.
pub fn current_site_id(conn: &Connection) -> Result<SiteId> {
    let existing: Option<String> = conn
        .query_row("SELECT site_id FROM crr_client LIMIT 1", [], |r| r.get(0))
        .optional()?;

    if let Some(raw) = existing {
        let id = Uuid::parse_str(&raw)
            .map_err(|e| crate::error::TeilenError::MalformedRequest(e.to_string()))?;
        return Ok(SiteId(id));
    }

    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO crr_client(site_id) VALUES (?1)",
        params![id.to_string()],
    )?;
    tracing::info!(site_id = %id, "initialized new site identity");
    Ok(SiteId(id))
}
