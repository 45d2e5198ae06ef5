use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RapportError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("Member {user_id} not found in guild {guild_id}")]
    MemberNotFound { guild_id: String, user_id: String },

    #[error("Invalid pair: {0}")]
    InvalidPair(String),

    #[error("Segment {0} was already removed by a concurrent consolidation")]
    ConsolidationConflict(Uuid),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),
}

impl RapportError {
    /// Whether a retry with backoff may succeed: lost connections, pool
    /// exhaustion, timeouts and serialization/deadlock aborts.
    pub fn is_transient(&self) -> bool {
        match self {
            RapportError::StorageUnavailable(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .is_some_and(|code| is_transient_sqlstate(&code)),
                _ => false,
            },
            RapportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// 40001 serialization_failure, 40P01 deadlock_detected, class 08 connection
/// exceptions, 57P01 admin_shutdown.
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "57P01") || code.starts_with("08")
}

pub type Result<T> = std::result::Result<T, RapportError>;
