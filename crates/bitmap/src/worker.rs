use crate::config::BitmapConfig;
use crate::error::Result;
use crate::index::{BitmapIndex, BitmapKey};
use crate::queue::UpdateQueue;
use crate::resource_map::ResourceIdMap;
use async_trait::async_trait;
use roaring::RoaringTreemap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_models::{EngineEvent, EventSink, Revision};

/// Computes the authoritative answer for one materialized key.
///
/// Implementations must bypass the bitmap index itself (no self-reference)
/// and return the revision observed before the computation started, so the
/// stored set is stamped conservatively.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve_accessible(&self, key: &BitmapKey) -> Result<(HashSet<String>, Revision)>;
}

/// Pool of recompute workers draining the update queue.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        config: &BitmapConfig,
        queue: Arc<UpdateQueue>,
        index: Arc<BitmapIndex>,
        resources: Arc<ResourceIdMap>,
        resolver: Arc<dyn ResourceResolver>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = Worker {
                queue: queue.clone(),
                index: index.clone(),
                resources: resources.clone(),
                resolver: resolver.clone(),
                events: events.clone(),
                cancel: cancel.clone(),
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                reap_after: Duration::from_millis(config.reap_after_ms),
            };
            handles.push(tokio::spawn(async move {
                worker.run(worker_id).await;
            }));
        }
        Self { cancel, handles }
    }

    /// Cancel the workers and wait for in-flight jobs to finish or yield.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Worker {
    queue: Arc<UpdateQueue>,
    index: Arc<BitmapIndex>,
    resources: Arc<ResourceIdMap>,
    resolver: Arc<dyn ResourceResolver>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    poll_interval: Duration,
    reap_after: Duration,
}

impl Worker {
    async fn run(&self, worker_id: usize) {
        tracing::debug!(worker_id, "bitmap update worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.queue.dequeue() {
                Some(job) => self.process(job).await,
                None => {
                    self.queue.reap_abandoned(self.reap_after);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
        tracing::debug!(worker_id, "bitmap update worker stopped");
    }

    async fn process(&self, job: crate::queue::UpdateJob) {
        let started = Instant::now();
        match self.resolver.resolve_accessible(&job.key).await {
            Ok((resource_ids, revision)) => {
                let mut bitmap = RoaringTreemap::new();
                for resource_id in &resource_ids {
                    let int_id = self.resources.get_or_assign(
                        &job.key.tenant_id,
                        &job.key.resource_type,
                        resource_id,
                    );
                    bitmap.insert(int_id as u64);
                }
                self.index.store_full(job.key.clone(), bitmap, revision);
                self.queue.complete(job.id);
                self.events.publish(EngineEvent::BitmapRebuilt {
                    tenant_id: job.key.tenant_id.clone(),
                    key: job.key.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(error) => {
                tracing::warn!(key = %job.key, error = %error, "bitmap recompute failed");
                self.queue.fail(job.id, &error.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use warden_models::{NoopEventSink, SubjectRef};

    struct StaticResolver {
        ids: Vec<String>,
        revision: Revision,
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceResolver for StaticResolver {
        async fn resolve_accessible(
            &self,
            _key: &BitmapKey,
        ) -> Result<(HashSet<String>, Revision)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(crate::error::BitmapError::Resolve(
                    "store unavailable".to_string(),
                ));
            }
            Ok((self.ids.iter().cloned().collect(), self.revision))
        }
    }

    fn key() -> BitmapKey {
        BitmapKey::new("t1", SubjectRef::entity("user", "alice"), "view", "doc")
    }

    fn config() -> BitmapConfig {
        BitmapConfig {
            worker_count: 1,
            poll_interval_ms: 5,
            retry_cap: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn worker_materializes_queued_keys() {
        let queue = Arc::new(UpdateQueue::new(100, 1));
        let index = Arc::new(BitmapIndex::new());
        let resources = Arc::new(ResourceIdMap::new());
        let resolver = Arc::new(StaticResolver {
            ids: vec!["d1".to_string(), "d2".to_string()],
            revision: 4,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        });

        let pool = WorkerPool::spawn(
            &config(),
            queue.clone(),
            index.clone(),
            resources.clone(),
            resolver.clone(),
            Arc::new(NoopEventSink),
        );

        queue.enqueue(key(), 100);
        for _ in 0..100 {
            if index.accessible_resources(&key(), None).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let (bitmap, revision) = index.accessible_resources(&key(), None).unwrap();
        assert_eq!(revision, 4);
        let ids = resources.resolve_ids("t1", "doc", bitmap.iter().map(|v| v as i64));
        let mut ids = ids;
        ids.sort();
        assert_eq!(ids, vec!["d1".to_string(), "d2".to_string()]);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn failing_jobs_end_up_parked() {
        let queue = Arc::new(UpdateQueue::new(100, 0));
        let index = Arc::new(BitmapIndex::new());
        let resolver = Arc::new(StaticResolver {
            ids: vec![],
            revision: 0,
            failing: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });

        let pool = WorkerPool::spawn(
            &config(),
            queue.clone(),
            index.clone(),
            Arc::new(ResourceIdMap::new()),
            resolver.clone(),
            Arc::new(NoopEventSink),
        );

        queue.enqueue(key(), 100);
        for _ in 0..100 {
            if !queue.parked_jobs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let parked = queue.parked_jobs();
        assert_eq!(parked.len(), 1);
        assert!(parked[0].last_error.as_deref().unwrap().contains("unavailable"));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers_promptly() {
        let queue = Arc::new(UpdateQueue::new(100, 1));
        let pool = WorkerPool::spawn(
            &config(),
            queue,
            Arc::new(BitmapIndex::new()),
            Arc::new(ResourceIdMap::new()),
            Arc::new(StaticResolver {
                ids: vec![],
                revision: 0,
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(NoopEventSink),
        );
        tokio::time::timeout(Duration::from_secs(1), pool.shutdown())
            .await
            .expect("shutdown within a second");
    }
}
