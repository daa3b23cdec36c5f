use thiserror::Error;
use warden_consistency::ConsistencyError;
use warden_models::Revision;
use warden_store::StoreError;

pub type Result<T> = std::result::Result<T, AuthzError>;

/// Engine error kinds. Verdicts (`allow` / `deny`) are never expressed as
/// errors: a deny is produced only by an evaluator decision, never by
/// absence of data or upstream failure.
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid zookie: {0}")]
    InvalidZookie(String),

    #[error(
        "consistency timeout for tenant {tenant_id}: requested {requested}, \
         current {current} after {elapsed_ms}ms"
    )]
    ConsistencyTimeout {
        tenant_id: String,
        requested: Revision,
        current: Revision,
        elapsed_ms: u64,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("circuit open for tenant {tenant_id} ({operation})")]
    CircuitOpen {
        tenant_id: String,
        operation: String,
    },

    #[error("rewrite depth exceeded (max {max_depth})")]
    DepthExceeded { max_depth: usize },

    #[error("request cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthzError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => AuthzError::StoreUnavailable(msg),
            StoreError::InvalidRequest(msg) => AuthzError::InvalidRequest(msg),
            StoreError::Corrupt(msg) => AuthzError::Internal(msg),
            StoreError::CircuitOpen {
                tenant_id,
                operation,
            } => AuthzError::CircuitOpen {
                tenant_id,
                operation,
            },
        }
    }
}

impl From<ConsistencyError> for AuthzError {
    fn from(err: ConsistencyError) -> Self {
        match err {
            ConsistencyError::InvalidZookie(msg) => AuthzError::InvalidZookie(msg),
            ConsistencyError::TenantMismatch {
                zookie_tenant,
                request_tenant,
            } => AuthzError::InvalidRequest(format!(
                "zookie tenant {} does not match request tenant {}",
                zookie_tenant, request_tenant
            )),
            ConsistencyError::Timeout {
                tenant_id,
                requested,
                current,
                elapsed_ms,
            } => AuthzError::ConsistencyTimeout {
                tenant_id,
                requested,
                current,
                elapsed_ms,
            },
            ConsistencyError::Cancelled => AuthzError::Cancelled,
            ConsistencyError::Store(inner) => inner.into(),
        }
    }
}
