use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport or backend failure. The only kind the circuit breaker
    /// counts.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Malformed arguments (wrong tenant on a tuple, empty key fields).
    #[error("invalid store request: {0}")]
    InvalidRequest(String),

    /// A persisted record that no longer deserializes.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The breaker refused the call without touching the backend.
    #[error("circuit open for tenant {tenant_id} ({operation})")]
    CircuitOpen {
        tenant_id: String,
        operation: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
