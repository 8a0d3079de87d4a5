use thiserror::Error;

/// Error taxonomy for the embedded document engine.
///
/// Each variant names a surface kind from the error handling design: the
/// recovery action lives at the call site, not in this type.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("page {0} is corrupted: checksum mismatch or invalid header")]
    CorruptedPage(u32),

    #[error("wal corrupted at lsn {0}: truncated record or CRC mismatch")]
    CorruptedWal(u64),

    #[error("unique index violation on index '{index}'")]
    UniqueViolation { index: String },

    #[error("lock timeout waiting for {resource}")]
    LockTimeout { resource: String },

    #[error("transaction {0} aborted: victim of deadlock cycle resolution")]
    DeadlockAborted(u64),

    #[error("transaction {0} timed out and was rolled back")]
    TransactionTimedOut(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("write attempted against a read-only database")]
    ReadOnly,

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Io(e) => DbError::Internal(format!("io error: {e}")),
            DbError::CorruptedPage(p) => DbError::CorruptedPage(*p),
            DbError::CorruptedWal(l) => DbError::CorruptedWal(*l),
            DbError::UniqueViolation { index } => DbError::UniqueViolation { index: index.clone() },
            DbError::LockTimeout { resource } => DbError::LockTimeout { resource: resource.clone() },
            DbError::DeadlockAborted(t) => DbError::DeadlockAborted(*t),
            DbError::TransactionTimedOut(t) => DbError::TransactionTimedOut(*t),
            DbError::InvalidArgument(s) => DbError::InvalidArgument(s.clone()),
            DbError::ReadOnly => DbError::ReadOnly,
            DbError::CommitFailed(s) => DbError::CommitFailed(s.clone()),
            DbError::NotFound(s) => DbError::NotFound(s.clone()),
            DbError::AlreadyExists(s) => DbError::AlreadyExists(s.clone()),
            DbError::Serialization(s) => DbError::Serialization(s.clone()),
            DbError::Configuration(s) => DbError::Configuration(s.clone()),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Internal(s) => DbError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}
