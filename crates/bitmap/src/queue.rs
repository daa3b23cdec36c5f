use crate::index::BitmapKey;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One queued recompute of a materialized set.
#[derive(Debug, Clone)]
pub struct UpdateJob {
    pub id: Uuid,
    pub key: BitmapKey,
    /// Lower value = higher priority.
    pub priority: i32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// An identical pending job already existed; the higher priority won.
    Coalesced,
    /// An identical pending job already existed at equal or higher
    /// priority; nothing to do.
    Duplicate,
    /// The tenant's queue is full and coalescing did not apply. The caller
    /// must mark the affected set stale so reads fall back.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-enqueued with backoff.
    Requeued { attempts: u32 },
    /// Retry cap exhausted; parked for manual inspection.
    Parked,
}

type PendingOrd = (i32, DateTime<Utc>, Uuid);

struct InFlight {
    job: UpdateJob,
    started_at: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Ordered by (priority, created_at): the dequeue order.
    pending: BTreeMap<PendingOrd, UpdateJob>,
    /// Natural-key index over `pending` for dedupe and coalescing.
    by_key: HashMap<BitmapKey, PendingOrd>,
    /// Backoff gate: jobs invisible to dequeue until this instant.
    ready_at: HashMap<Uuid, Instant>,
    processing: HashMap<Uuid, InFlight>,
    parked: Vec<UpdateJob>,
    per_tenant: HashMap<String, usize>,
}

/// Bounded in-memory recompute queue.
///
/// Deduplicates by natural key, coalesces priorities, retries with
/// exponential backoff up to a cap, and requeues abandoned `processing`
/// entries through [`UpdateQueue::reap_abandoned`]. Invalidations are never
/// dropped silently: overflow is reported so callers can mark sets stale.
pub struct UpdateQueue {
    state: Mutex<QueueState>,
    capacity_per_tenant: usize,
    retry_cap: u32,
}

impl UpdateQueue {
    pub fn new(capacity_per_tenant: usize, retry_cap: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity_per_tenant,
            retry_cap,
        }
    }

    pub fn enqueue(&self, key: BitmapKey, priority: i32) -> EnqueueOutcome {
        let mut state = self.lock();

        if let Some(existing_ord) = state.by_key.get(&key).copied() {
            if priority < existing_ord.0 {
                let mut job = state
                    .pending
                    .remove(&existing_ord)
                    .expect("by_key index out of sync with pending");
                job.priority = priority;
                let ord = (priority, job.created_at, job.id);
                state.by_key.insert(key, ord);
                state.pending.insert(ord, job);
                return EnqueueOutcome::Coalesced;
            }
            return EnqueueOutcome::Duplicate;
        }

        let tenant_pending = state
            .per_tenant
            .get(&key.tenant_id)
            .copied()
            .unwrap_or(0);
        if tenant_pending >= self.capacity_per_tenant {
            tracing::warn!(
                tenant_id = %key.tenant_id,
                key = %key,
                "bitmap queue full, caller must degrade to evaluator"
            );
            return EnqueueOutcome::Overflow;
        }

        let job = UpdateJob {
            id: Uuid::new_v4(),
            key: key.clone(),
            priority,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };
        let ord = (priority, job.created_at, job.id);
        *state.per_tenant.entry(key.tenant_id.clone()).or_insert(0) += 1;
        state.by_key.insert(key, ord);
        state.pending.insert(ord, job);
        EnqueueOutcome::Queued
    }

    /// Next ready job in (priority, created_at) order, marked `processing`.
    pub fn dequeue(&self) -> Option<UpdateJob> {
        let mut state = self.lock();
        let now = Instant::now();

        let ord = state
            .pending
            .iter()
            .find(|(_, job)| {
                state
                    .ready_at
                    .get(&job.id)
                    .map_or(true, |ready| *ready <= now)
            })
            .map(|(ord, _)| *ord)?;

        let mut job = state.pending.remove(&ord)?;
        state.by_key.remove(&job.key);
        state.ready_at.remove(&job.id);
        if let Some(count) = state.per_tenant.get_mut(&job.key.tenant_id) {
            *count = count.saturating_sub(1);
        }

        job.status = JobStatus::Processing;
        state.processing.insert(
            job.id,
            InFlight {
                job: job.clone(),
                started_at: now,
            },
        );
        Some(job)
    }

    pub fn complete(&self, id: Uuid) {
        let mut state = self.lock();
        state.processing.remove(&id);
    }

    /// Record a failure: re-enqueue with backoff, or park after the cap.
    pub fn fail(&self, id: Uuid, error: &str) -> Option<FailOutcome> {
        let mut state = self.lock();
        let in_flight = state.processing.remove(&id)?;
        let mut job = in_flight.job;
        job.attempts += 1;
        job.last_error = Some(error.to_string());

        if job.attempts > self.retry_cap {
            job.status = JobStatus::Failed;
            tracing::error!(key = %job.key, attempts = job.attempts, error, "recompute parked");
            state.parked.push(job);
            return Some(FailOutcome::Parked);
        }

        let backoff = retry_backoff(job.attempts);
        let attempts = job.attempts;
        job.status = JobStatus::Pending;
        let ord = (job.priority, job.created_at, job.id);
        state.ready_at.insert(job.id, Instant::now() + backoff);
        *state
            .per_tenant
            .entry(job.key.tenant_id.clone())
            .or_insert(0) += 1;
        state.by_key.insert(job.key.clone(), ord);
        state.pending.insert(ord, job);
        Some(FailOutcome::Requeued { attempts })
    }

    /// Requeue `processing` entries older than the threshold (a worker
    /// died or was cancelled mid-job). Returns how many were recovered.
    pub fn reap_abandoned(&self, older_than: Duration) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let abandoned: Vec<Uuid> = state
            .processing
            .iter()
            .filter(|(_, in_flight)| now.duration_since(in_flight.started_at) >= older_than)
            .map(|(id, _)| *id)
            .collect();

        for id in &abandoned {
            let Some(in_flight) = state.processing.remove(id) else {
                continue;
            };
            let mut job = in_flight.job;
            // Another enqueue may have raced in for the same key; the
            // fresher pending job wins and the abandoned one is dropped.
            if state.by_key.contains_key(&job.key) {
                continue;
            }
            job.status = JobStatus::Pending;
            let ord = (job.priority, job.created_at, job.id);
            *state
                .per_tenant
                .entry(job.key.tenant_id.clone())
                .or_insert(0) += 1;
            state.by_key.insert(job.key.clone(), ord);
            state.pending.insert(ord, job);
        }
        abandoned.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    /// Jobs that exhausted their retries.
    pub fn parked_jobs(&self) -> Vec<UpdateJob> {
        self.lock().parked.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn retry_backoff(attempts: u32) -> Duration {
    let base = Duration::from_millis(100) * 2u32.saturating_pow(attempts.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0..50);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_models::SubjectRef;

    fn key(subject: &str) -> BitmapKey {
        BitmapKey::new("t1", SubjectRef::entity("user", subject), "view", "doc")
    }

    fn queue() -> UpdateQueue {
        UpdateQueue::new(4, 2)
    }

    #[test]
    fn dedupes_identical_pending_jobs() {
        let q = queue();
        assert_eq!(q.enqueue(key("alice"), 100), EnqueueOutcome::Queued);
        assert_eq!(q.enqueue(key("alice"), 100), EnqueueOutcome::Duplicate);
        assert_eq!(q.enqueue(key("alice"), 200), EnqueueOutcome::Duplicate);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn higher_priority_coalesces_in_place() {
        let q = queue();
        q.enqueue(key("alice"), 100);
        assert_eq!(q.enqueue(key("alice"), 10), EnqueueOutcome::Coalesced);
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.dequeue().unwrap().priority, 10);
    }

    #[test]
    fn dequeues_by_priority_then_age() {
        let q = queue();
        q.enqueue(key("low"), 200);
        q.enqueue(key("high"), 10);
        q.enqueue(key("mid"), 100);

        let order: Vec<String> = std::iter::from_fn(|| q.dequeue())
            .map(|job| job.key.subject.entity.entity_id.clone())
            .collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn per_tenant_capacity_reports_overflow() {
        let q = queue();
        for i in 0..4 {
            assert_eq!(q.enqueue(key(&format!("s{}", i)), 100), EnqueueOutcome::Queued);
        }
        assert_eq!(q.enqueue(key("s4"), 100), EnqueueOutcome::Overflow);
        // Coalescing still works at capacity.
        assert_eq!(q.enqueue(key("s0"), 1), EnqueueOutcome::Coalesced);
    }

    #[test]
    fn failure_retries_then_parks() {
        let q = queue();
        q.enqueue(key("alice"), 100);

        let job = q.dequeue().unwrap();
        assert_eq!(
            q.fail(job.id, "store down"),
            Some(FailOutcome::Requeued { attempts: 1 })
        );

        // Backoff keeps the retried job invisible for a moment.
        assert!(q.dequeue().is_none());
        std::thread::sleep(Duration::from_millis(200));
        let job = q.dequeue().expect("retry became ready");
        assert_eq!(job.attempts, 1);

        assert_eq!(
            q.fail(job.id, "store down"),
            Some(FailOutcome::Requeued { attempts: 2 })
        );
        std::thread::sleep(Duration::from_millis(300));
        let job = q.dequeue().expect("second retry became ready");

        assert_eq!(q.fail(job.id, "store down"), Some(FailOutcome::Parked));
        assert_eq!(q.pending_len(), 0);
        let parked = q.parked_jobs();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].status, JobStatus::Failed);
        assert_eq!(parked[0].last_error.as_deref(), Some("store down"));
    }

    #[test]
    fn reaper_requeues_abandoned_processing_jobs() {
        let q = queue();
        q.enqueue(key("alice"), 100);
        let job = q.dequeue().unwrap();
        assert_eq!(q.processing_len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(q.reap_abandoned(Duration::from_millis(10)), 1);
        assert_eq!(q.processing_len(), 0);

        let recovered = q.dequeue().unwrap();
        assert_eq!(recovered.id, job.id);
    }
}
