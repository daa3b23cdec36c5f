use crate::error::{ConsistencyError, Result};
use crate::zookie::{Zookie, ZookieSigner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use warden_models::{ConsistencyMode, Revision};
use warden_store::TupleStore;

/// Mode applied when a request carries neither an explicit mode nor a
/// zookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultConsistency {
    MinimizeLatency,
    AtLeastAsFresh,
    FullyConsistent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    pub default_mode: DefaultConsistency,
    /// Upper bound on the revision wait, the only blocking step in the
    /// read path.
    pub wait_deadline_ms: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            default_mode: DefaultConsistency::MinimizeLatency,
            wait_deadline_ms: 500,
        }
    }
}

/// Resolves per-request consistency, mints zookies for writes, and blocks
/// (bounded) until a tenant's revision becomes visible.
pub struct ConsistencyManager {
    store: Arc<dyn TupleStore>,
    signer: ZookieSigner,
    config: ConsistencyConfig,
}

impl ConsistencyManager {
    pub fn new(store: Arc<dyn TupleStore>, signer: ZookieSigner, config: ConsistencyConfig) -> Self {
        Self {
            store,
            signer,
            config,
        }
    }

    pub fn mint(&self, tenant_id: &str, revision: Revision) -> Result<String> {
        self.signer.encode(tenant_id, revision)
    }

    pub fn parse(&self, token: &str) -> Result<Zookie> {
        self.signer.decode(token)
    }

    /// Effective mode for a request. An explicit mode wins; otherwise a
    /// supplied zookie means "at least as fresh as that write"; otherwise
    /// the configured default. A zookie minted for another tenant rejects
    /// the whole call.
    pub fn resolve_mode(
        &self,
        tenant_id: &str,
        explicit: Option<ConsistencyMode>,
        zookie: Option<&str>,
    ) -> Result<ConsistencyMode> {
        let decoded = match zookie {
            Some(token) => {
                let z = self.parse(token)?;
                if z.tenant_id != tenant_id {
                    return Err(ConsistencyError::TenantMismatch {
                        zookie_tenant: z.tenant_id,
                        request_tenant: tenant_id.to_string(),
                    });
                }
                Some(z)
            }
            None => None,
        };

        if let Some(mode) = explicit {
            return Ok(mode);
        }
        if let Some(z) = decoded {
            return Ok(ConsistencyMode::AtLeastAsFresh(z.revision));
        }
        Ok(match self.config.default_mode {
            DefaultConsistency::MinimizeLatency => ConsistencyMode::MinimizeLatency,
            // Without a zookie there is no revision floor to enforce.
            DefaultConsistency::AtLeastAsFresh => ConsistencyMode::MinimizeLatency,
            DefaultConsistency::FullyConsistent => ConsistencyMode::FullyConsistent,
        })
    }

    /// Block until the mode's revision floor is visible, up to the
    /// configured deadline.
    pub async fn ensure_visible(
        &self,
        tenant_id: &str,
        mode: &ConsistencyMode,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match mode.min_revision() {
            Some(min) => self.wait_for_revision(tenant_id, min, cancel).await,
            None => Ok(()),
        }
    }

    async fn wait_for_revision(
        &self,
        tenant_id: &str,
        min_revision: Revision,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Duration::from_millis(self.config.wait_deadline_ms);
        let started = Instant::now();
        let mut backoff = Duration::from_millis(4);
        let mut current = self.store.current_revision(tenant_id).await?;

        loop {
            if current >= min_revision {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(ConsistencyError::Cancelled);
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                tracing::warn!(
                    tenant_id,
                    requested = min_revision,
                    current,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "revision wait exhausted"
                );
                return Err(ConsistencyError::Timeout {
                    tenant_id: tenant_id.to_string(),
                    requested: min_revision,
                    current,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }

            let remaining = deadline - elapsed;
            let nap = backoff.min(remaining);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => return Err(ConsistencyError::Cancelled),
            }
            backoff = (backoff * 2).min(Duration::from_millis(100));
            current = self.store.current_revision(tenant_id).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_models::{Entity, RelationTuple, SubjectRef};
    use warden_store::MemoryTupleStore;

    fn manager(store: Arc<dyn TupleStore>, deadline_ms: u64) -> ConsistencyManager {
        ConsistencyManager::new(
            store,
            ZookieSigner::new(b"test-key".to_vec()),
            ConsistencyConfig {
                default_mode: DefaultConsistency::MinimizeLatency,
                wait_deadline_ms: deadline_ms,
            },
        )
    }

    fn grant(tenant: &str) -> RelationTuple {
        RelationTuple::new(
            tenant,
            Entity::new("doc", "readme"),
            "direct_viewer",
            SubjectRef::entity("user", "alice"),
        )
    }

    #[tokio::test]
    async fn zookie_defaults_to_at_least_as_fresh() {
        let store = Arc::new(MemoryTupleStore::new());
        let mgr = manager(store, 100);
        let token = mgr.mint("t1", 5).unwrap();

        let mode = mgr.resolve_mode("t1", None, Some(&token)).unwrap();
        assert_eq!(mode, ConsistencyMode::AtLeastAsFresh(5));

        // An explicit mode wins over the zookie.
        let mode = mgr
            .resolve_mode("t1", Some(ConsistencyMode::FullyConsistent), Some(&token))
            .unwrap();
        assert_eq!(mode, ConsistencyMode::FullyConsistent);

        // No zookie, no explicit mode: configured default.
        let mode = mgr.resolve_mode("t1", None, None).unwrap();
        assert_eq!(mode, ConsistencyMode::MinimizeLatency);
    }

    #[tokio::test]
    async fn rejects_foreign_tenant_zookie() {
        let store = Arc::new(MemoryTupleStore::new());
        let mgr = manager(store, 100);
        let token = mgr.mint("t2", 5).unwrap();
        let err = mgr.resolve_mode("t1", None, Some(&token)).unwrap_err();
        assert!(matches!(err, ConsistencyError::TenantMismatch { .. }));
    }

    #[tokio::test]
    async fn wait_returns_once_revision_is_visible() {
        let store = Arc::new(MemoryTupleStore::new());
        let mgr = manager(store.clone(), 1_000);

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write("t1", vec![grant("t1")], vec![]).await.unwrap();
        });

        let cancel = CancellationToken::new();
        mgr.ensure_visible("t1", &ConsistencyMode::AtLeastAsFresh(1), &cancel)
            .await
            .unwrap();
        assert_eq!(store.current_revision("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wait_times_out_with_revision_details() {
        let store = Arc::new(MemoryTupleStore::new());
        let mgr = manager(store, 50);
        let cancel = CancellationToken::new();

        let err = mgr
            .ensure_visible("t1", &ConsistencyMode::AtLeastAsFresh(10), &cancel)
            .await
            .unwrap_err();
        match err {
            ConsistencyError::Timeout {
                tenant_id,
                requested,
                current,
                elapsed_ms,
            } => {
                assert_eq!(tenant_id, "t1");
                assert_eq!(requested, 10);
                assert_eq!(current, 0);
                assert!(elapsed_ms >= 50);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let store = Arc::new(MemoryTupleStore::new());
        let mgr = manager(store, 10_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = mgr
            .ensure_visible("t1", &ConsistencyMode::AtLeastAsFresh(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsistencyError::Cancelled));
    }
}
