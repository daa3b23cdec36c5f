use thiserror::Error;
use warden_models::Revision;
use warden_store::StoreError;

pub type Result<T> = std::result::Result<T, ConsistencyError>;

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("invalid zookie: {0}")]
    InvalidZookie(String),

    #[error("zookie tenant {zookie_tenant} does not match request tenant {request_tenant}")]
    TenantMismatch {
        zookie_tenant: String,
        request_tenant: String,
    },

    #[error(
        "revision wait timed out for tenant {tenant_id}: requested {requested}, \
         current {current} after {elapsed_ms}ms"
    )]
    Timeout {
        tenant_id: String,
        requested: Revision,
        current: Revision,
        elapsed_ms: u64,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}
