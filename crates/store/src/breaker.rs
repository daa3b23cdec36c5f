use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the rolling window that trip the breaker.
    pub failure_threshold: usize,
    pub failure_window_ms: u64,
    /// How long the breaker stays OPEN before probing.
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            success_threshold: 3,
        }
    }
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// State change worth publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened,
    Closed,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    /// Timestamps of recent failures; a rolling window rather than a plain
    /// counter so a spike followed by quiet time does not trip the breaker.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    total_open: Duration,
}

/// One breaker per (tenant, operation class). Only transient failures are
/// recorded; denials and validation errors never count.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                total_open: Duration::ZERO,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a wrapped call may proceed. An OPEN breaker whose reset
    /// timeout has elapsed moves to HALF_OPEN and admits the probe.
    pub fn try_acquire(&self) -> bool {
        let mut core = self.lock();
        match core.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = core
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout() {
                    core.state = BreakerState::HalfOpen;
                    core.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) -> Option<BreakerTransition> {
        let mut core = self.lock();
        match core.state {
            BreakerState::Closed => {
                let window = self.config.failure_window();
                Self::evict_stale(&mut core.failures, window);
                None
            }
            BreakerState::HalfOpen => {
                core.half_open_successes += 1;
                if core.half_open_successes >= self.config.success_threshold {
                    core.state = BreakerState::Closed;
                    core.failures.clear();
                    if let Some(at) = core.opened_at.take() {
                        core.total_open += at.elapsed();
                    }
                    Some(BreakerTransition::Closed)
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        }
    }

    pub fn record_failure(&self) -> Option<BreakerTransition> {
        let mut core = self.lock();
        let now = Instant::now();
        match core.state {
            BreakerState::Closed => {
                core.failures.push_back(now);
                let window = self.config.failure_window();
                Self::evict_stale(&mut core.failures, window);
                if core.failures.len() >= self.config.failure_threshold {
                    core.state = BreakerState::Open;
                    core.opened_at = Some(now);
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                core.state = BreakerState::Open;
                core.opened_at = Some(now);
                core.half_open_successes = 0;
                Some(BreakerTransition::Opened)
            }
            BreakerState::Open => None,
        }
    }

    /// Cumulative time spent OPEN, including the current stretch. Exported
    /// as a health signal.
    pub fn time_in_open(&self) -> Duration {
        let core = self.lock();
        let current = core
            .opened_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);
        core.total_open + current
    }

    fn evict_stale(failures: &mut VecDeque<Instant>, window: Duration) {
        while let Some(oldest) = failures.front() {
            if oldest.elapsed() > window {
                failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Which store operation class a breaker protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Read,
    Write,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpClass::Read => "read",
            OpClass::Write => "write",
        }
    }
}

/// Lazily creates one breaker per (tenant, operation class).
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<(String, OpClass), Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker(&self, tenant_id: &str, op: OpClass) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((tenant_id.to_string(), op))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Current state of every breaker, for health reporting.
    pub fn states(&self) -> Vec<(String, OpClass, BreakerState, Duration)> {
        self.breakers
            .iter()
            .map(|entry| {
                let (tenant, op) = entry.key().clone();
                (tenant, op, entry.state(), entry.time_in_open())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window_ms: 200,
            reset_timeout_ms: 50,
            success_threshold: 2,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.record_failure(), Some(BreakerTransition::Opened));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn stale_failures_fall_out_of_the_window() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(250));
        // The earlier failures aged out; this one starts a fresh window.
        assert_eq!(breaker.record_failure(), None);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_then_close() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert_eq!(breaker.record_success(), None);
        assert_eq!(breaker.record_success(), Some(BreakerTransition::Closed));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire());
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.try_acquire());
        assert_eq!(breaker.record_failure(), Some(BreakerTransition::Opened));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn registry_is_per_tenant_and_op() {
        let registry = BreakerRegistry::new(fast_config());
        let read_t1 = registry.breaker("t1", OpClass::Read);
        for _ in 0..3 {
            read_t1.record_failure();
        }
        assert_eq!(registry.breaker("t1", OpClass::Read).state(), BreakerState::Open);
        assert_eq!(registry.breaker("t1", OpClass::Write).state(), BreakerState::Closed);
        assert_eq!(registry.breaker("t2", OpClass::Read).state(), BreakerState::Closed);
        assert_eq!(registry.states().len(), 3);
    }
}
