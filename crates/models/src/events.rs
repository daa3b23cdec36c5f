use crate::consistency::Revision;

/// Notifications the engine publishes to whatever observer the host wires in.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TenantRevisionChanged {
        tenant_id: String,
        revision: Revision,
    },
    CacheInvalidated {
        tenant_id: String,
    },
    CircuitOpened {
        tenant_id: String,
        operation: String,
    },
    CircuitClosed {
        tenant_id: String,
        operation: String,
    },
    BitmapRebuilt {
        tenant_id: String,
        key: String,
        duration_ms: u64,
    },
    ConsistencyTimeout {
        tenant_id: String,
        requested: Revision,
        current: Revision,
        elapsed_ms: u64,
    },
}

/// Observer hook. Implementations must be cheap and non-blocking; the engine
/// publishes from hot paths.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Discards every event. Default for tests.
#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: EngineEvent) {}
}

/// Forwards events to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: EngineEvent) {
        match &event {
            EngineEvent::TenantRevisionChanged {
                tenant_id,
                revision,
            } => {
                tracing::debug!(%tenant_id, revision = *revision, "tenant revision changed");
            }
            EngineEvent::CacheInvalidated { tenant_id } => {
                tracing::debug!(%tenant_id, "decision cache invalidated");
            }
            EngineEvent::CircuitOpened {
                tenant_id,
                operation,
            } => {
                tracing::warn!(%tenant_id, %operation, "circuit opened");
            }
            EngineEvent::CircuitClosed {
                tenant_id,
                operation,
            } => {
                tracing::info!(%tenant_id, %operation, "circuit closed");
            }
            EngineEvent::BitmapRebuilt {
                tenant_id,
                key,
                duration_ms,
            } => {
                tracing::debug!(%tenant_id, %key, duration_ms = *duration_ms, "bitmap rebuilt");
            }
            EngineEvent::ConsistencyTimeout {
                tenant_id,
                requested,
                current,
                elapsed_ms,
            } => {
                tracing::warn!(
                    %tenant_id,
                    requested = *requested,
                    current = *current,
                    elapsed_ms = *elapsed_ms,
                    "consistency wait timed out"
                );
            }
        }
    }
}
