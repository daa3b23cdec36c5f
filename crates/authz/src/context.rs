use crate::error::{AuthzError, Result};
use tokio_util::sync::CancellationToken;
use validator::Validate;
use warden_models::{CaveatContext, ConsistencyMode};

/// Everything request-scoped, passed by value down the call tree. No
/// hidden globals: tenant, consistency selection, cancellation and caveat
/// variables all travel here.
#[derive(Debug, Clone, Validate)]
pub struct RequestContext {
    #[validate(length(min = 1))]
    pub tenant_id: String,
    /// Explicit mode override; wins over any supplied zookie.
    pub consistency: Option<ConsistencyMode>,
    /// Zookie from a previous write, for read-your-writes.
    pub zookie: Option<String>,
    pub cancellation: CancellationToken,
    pub caveat_context: CaveatContext,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            consistency: None,
            zookie: None,
            cancellation: CancellationToken::new(),
            caveat_context: CaveatContext::new(),
        }
    }

    pub fn with_consistency(mut self, mode: ConsistencyMode) -> Self {
        self.consistency = Some(mode);
        self
    }

    pub fn with_zookie(mut self, zookie: impl Into<String>) -> Self {
        self.zookie = Some(zookie.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_caveat_var(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.caveat_context.insert(name.into(), value);
        self
    }

    /// Checked at every suspension point; a cancelled request errors out
    /// instead of returning a spurious deny.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(AuthzError::Cancelled);
        }
        Ok(())
    }
}
