use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Table '{table}' is already bound to '{existing}', cannot bind '{requested}'")]
    TableNameConflict {
        table: String,
        existing: String,
        requested: String,
    },

    #[error("Write-write conflict on table '{table}': transaction {txn} blocked by {owner}")]
    WriteConflict { table: String, txn: u64, owner: u64 },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Table pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Table pool is closed")]
    PoolClosed,

    #[error("State provider is not initialized")]
    NotInitialized,

    #[error("State provider is not open")]
    NotOpen,

    #[error("State provider is already open")]
    AlreadyOpen,

    #[error("Invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error ({kind:?}): {message}")]
    IoError {
        kind: std::io::ErrorKind,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Wraps an I/O failure with the path or step it happened on.
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::IoError {
            kind: err.kind(),
            message: format!("{context}: {err}"),
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }

    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for DbError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DbError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
