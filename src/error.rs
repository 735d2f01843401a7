use thiserror::Error;

/// Errors surfaced by the core. Every fallible public operation returns
/// `Result<_, TeilenError>`; trigger-time and applier failures roll back
/// their transaction before this is returned.
#[derive(Error, Debug)]
pub enum TeilenError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("table {0} is not upgraded to a CRR table")]
    SchemaNotUpgraded(String),
    #[error("push rejected: receiver has newer commits")]
    NeedsPull,
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("cannot push: unresolved manual conflicts on affected rows")]
    ConflictPending,
    #[error("unknown commit: {0}")]
    UnknownCommit(String),
}

pub type Result<T> = std::result::Result<T, TeilenError>;
