pub mod applier;
pub mod change;
pub mod commit;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod fracindex;
pub mod hlc;
pub mod schema;
pub mod site;
pub mod snapshot;
pub mod sync;

pub use applier::{Conflict, Resolution, ResolutionState};
pub use change::{Change, OpType};
pub use commit::{Commit, PushRequest, PushResponse, PushStatus};
pub use engine::TeilenEngine;
pub use error::{Result, TeilenError};
pub use hlc::Hlc;
pub use schema::{ConflictMode, CrrColumnMeta, CrrTableOptions, SchemaUpgrader};
pub use site::SiteId;
pub use sync::{ApplyPullResult, PullRequest, PullResponse};
