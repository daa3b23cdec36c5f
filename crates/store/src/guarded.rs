use crate::breaker::{BreakerRegistry, BreakerTransition, OpClass};
use crate::error::{Result, StoreError};
use crate::store::TupleStore;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use warden_models::{
    Entity, EngineEvent, EventSink, RelationTuple, Revision, SubjectRef, TupleFilter, TupleKey,
};

/// Wraps a [`TupleStore`] with per-(tenant, op) circuit breakers.
///
/// While a breaker is OPEN every call short-circuits with
/// [`StoreError::CircuitOpen`] without touching the backend. Only
/// [`StoreError::Unavailable`] results count as failures.
pub struct GuardedStore {
    inner: Arc<dyn TupleStore>,
    breakers: Arc<BreakerRegistry>,
    events: Arc<dyn EventSink>,
}

impl GuardedStore {
    pub fn new(
        inner: Arc<dyn TupleStore>,
        breakers: Arc<BreakerRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner,
            breakers,
            events,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    async fn guard<T>(
        &self,
        tenant_id: &str,
        op: OpClass,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        let breaker = self.breakers.breaker(tenant_id, op);
        if !breaker.try_acquire() {
            return Err(StoreError::CircuitOpen {
                tenant_id: tenant_id.to_string(),
                operation: op.as_str().to_string(),
            });
        }

        let result = call.await;
        let transition = match &result {
            Ok(_) => breaker.record_success(),
            Err(StoreError::Unavailable(_)) => breaker.record_failure(),
            Err(_) => None,
        };
        match transition {
            Some(BreakerTransition::Opened) => {
                self.events.publish(EngineEvent::CircuitOpened {
                    tenant_id: tenant_id.to_string(),
                    operation: op.as_str().to_string(),
                });
            }
            Some(BreakerTransition::Closed) => {
                self.events.publish(EngineEvent::CircuitClosed {
                    tenant_id: tenant_id.to_string(),
                    operation: op.as_str().to_string(),
                });
            }
            None => {}
        }
        result
    }
}

#[async_trait]
impl TupleStore for GuardedStore {
    async fn write(
        &self,
        tenant_id: &str,
        adds: Vec<RelationTuple>,
        removes: Vec<TupleKey>,
    ) -> Result<Revision> {
        self.guard(tenant_id, OpClass::Write, self.inner.write(tenant_id, adds, removes))
            .await
    }

    async fn read(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Vec<RelationTuple>> {
        self.guard(tenant_id, OpClass::Read, self.inner.read(tenant_id, filter))
            .await
    }

    async fn delete_by_filter(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Revision> {
        self.guard(
            tenant_id,
            OpClass::Write,
            self.inner.delete_by_filter(tenant_id, filter),
        )
        .await
    }

    async fn current_revision(&self, tenant_id: &str) -> Result<Revision> {
        self.guard(
            tenant_id,
            OpClass::Read,
            self.inner.current_revision(tenant_id),
        )
        .await
    }

    async fn get_direct_subjects(
        &self,
        tenant_id: &str,
        object: &Entity,
        relation: &str,
    ) -> Result<Vec<RelationTuple>> {
        self.guard(
            tenant_id,
            OpClass::Read,
            self.inner.get_direct_subjects(tenant_id, object, relation),
        )
        .await
    }

    async fn find_related_objects(
        &self,
        tenant_id: &str,
        from_object: &Entity,
        relation: &str,
    ) -> Result<Vec<Entity>> {
        self.guard(
            tenant_id,
            OpClass::Read,
            self.inner
                .find_related_objects(tenant_id, from_object, relation),
        )
        .await
    }

    async fn find_objects_for_subject(
        &self,
        tenant_id: &str,
        subject: &SubjectRef,
        relation: &str,
        object_type: &str,
    ) -> Result<Vec<String>> {
        self.guard(
            tenant_id,
            OpClass::Read,
            self.inner
                .find_objects_for_subject(tenant_id, subject, relation, object_type),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::memory::MemoryTupleStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use warden_models::NoopEventSink;

    /// Store stub whose reads fail on demand; used to drive the breaker.
    struct FlakyStore {
        inner: MemoryTupleStore,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryTupleStore::new(),
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TupleStore for FlakyStore {
        async fn write(
            &self,
            tenant_id: &str,
            adds: Vec<RelationTuple>,
            removes: Vec<TupleKey>,
        ) -> Result<Revision> {
            self.inner.write(tenant_id, adds, removes).await
        }

        async fn read(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Vec<RelationTuple>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.read(tenant_id, filter).await
        }

        async fn delete_by_filter(
            &self,
            tenant_id: &str,
            filter: &TupleFilter,
        ) -> Result<Revision> {
            self.inner.delete_by_filter(tenant_id, filter).await
        }

        async fn current_revision(&self, tenant_id: &str) -> Result<Revision> {
            self.inner.current_revision(tenant_id).await
        }
    }

    fn guarded(flaky: Arc<FlakyStore>) -> GuardedStore {
        let config = BreakerConfig {
            failure_threshold: 3,
            failure_window_ms: 1_000,
            reset_timeout_ms: 40,
            success_threshold: 1,
        };
        GuardedStore::new(
            flaky,
            Arc::new(BreakerRegistry::new(config)),
            Arc::new(NoopEventSink),
        )
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_store() {
        let flaky = Arc::new(FlakyStore::new());
        let store = guarded(flaky.clone());
        let filter = TupleFilter::default();

        flaky.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            let _ = store.read("t1", &filter).await;
        }
        let calls_when_opened = flaky.calls.load(Ordering::SeqCst);

        let err = store.read("t1", &filter).await.unwrap_err();
        assert!(matches!(err, StoreError::CircuitOpen { .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), calls_when_opened);
    }

    #[tokio::test]
    async fn recovers_through_half_open_probe() {
        let flaky = Arc::new(FlakyStore::new());
        let store = guarded(flaky.clone());
        let filter = TupleFilter::default();

        flaky.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            let _ = store.read("t1", &filter).await;
        }

        flaky.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Probe succeeds and closes the breaker again.
        assert!(store.read("t1", &filter).await.is_ok());
        assert!(store.read("t1", &filter).await.is_ok());
    }

    #[tokio::test]
    async fn other_tenants_are_unaffected() {
        let flaky = Arc::new(FlakyStore::new());
        let store = guarded(flaky.clone());
        let filter = TupleFilter::default();

        flaky.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            let _ = store.read("t1", &filter).await;
        }
        flaky.failing.store(false, Ordering::SeqCst);

        assert!(store.read("t2", &filter).await.is_ok());
        assert!(matches!(
            store.read("t1", &filter).await.unwrap_err(),
            StoreError::CircuitOpen { .. }
        ));
    }
}
