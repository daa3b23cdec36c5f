use crate::shared::{SharedCache, SharedCacheConfig};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use warden_models::{Entity, Revision, SubjectRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Max entries in the in-process tier. 0 disables the cache entirely.
    pub in_process_size: u64,
    pub default_ttl_ms: u64,
    pub shared_enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            in_process_size: 10_000,
            default_ttl_ms: 30_000,
            shared_enabled: false,
        }
    }
}

/// Identity of one cached verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub tenant_id: String,
    pub subject: SubjectRef,
    pub permission: String,
    pub object: Entity,
}

impl DecisionKey {
    pub fn new(
        tenant_id: impl Into<String>,
        subject: SubjectRef,
        permission: impl Into<String>,
        object: Entity,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            subject,
            permission: permission.into(),
            object,
        }
    }
}

/// Key used in the shared tier.
pub fn decision_cache_key(key: &DecisionKey) -> String {
    format!(
        "warden:decision:{}:{}:{}:{}",
        key.tenant_id, key.subject, key.permission, key.object
    )
}

/// A cached verdict with the revision observed when it was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub allowed: bool,
    pub revision: Revision,
    pub created_at_ms: i64,
    pub ttl_ms: u64,
}

impl DecisionEntry {
    fn expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms as i64
    }
}

#[derive(Clone)]
struct LocalEntry {
    entry: DecisionEntry,
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Two-tier verdict cache.
///
/// Tenant invalidation bumps a per-tenant generation, so stale in-process
/// entries read as misses without a scan. The shared tier is consulted on
/// in-process miss; its failures are logged and read as misses — this cache
/// never raises.
pub struct DecisionCache {
    local: Option<moka::sync::Cache<DecisionKey, LocalEntry>>,
    generations: Arc<DashMap<String, u64>>,
    shared: Option<SharedCache>,
    default_ttl_ms: u64,
    stats: CacheStats,
}

impl DecisionCache {
    pub fn new(settings: CacheSettings) -> Self {
        let local = (settings.in_process_size > 0).then(|| {
            moka::sync::Cache::builder()
                .max_capacity(settings.in_process_size)
                .build()
        });
        Self {
            local,
            generations: Arc::new(DashMap::new()),
            shared: None,
            default_ttl_ms: settings.default_ttl_ms,
            stats: CacheStats::default(),
        }
    }

    /// Null cache: every read misses, writes are ignored. Default when no
    /// backing store is configured.
    pub fn disabled() -> Self {
        Self::new(CacheSettings {
            in_process_size: 0,
            default_ttl_ms: 0,
            shared_enabled: false,
        })
    }

    /// Build from settings, connecting the shared tier when enabled. An
    /// unreachable shared tier downgrades to in-process only.
    pub async fn from_settings(settings: CacheSettings) -> Self {
        let shared_enabled = settings.shared_enabled;
        let cache = Self::new(settings);
        if !shared_enabled {
            return cache;
        }
        match SharedCache::connect(SharedCacheConfig::from_env()).await {
            Ok(shared) => cache.with_shared(shared),
            Err(err) => {
                tracing::warn!("shared cache unavailable, continuing without: {}", err);
                cache
            }
        }
    }

    /// Attach the shared tier and subscribe to its invalidation broadcasts.
    pub fn with_shared(mut self, shared: SharedCache) -> Self {
        let generations = self.generations.clone();
        let subscriber = shared.clone();
        tokio::spawn(async move {
            let result = subscriber
                .subscribe_invalidations(move |tenant_id| {
                    *generations.entry(tenant_id).or_insert(0) += 1;
                })
                .await;
            if let Err(err) = result {
                tracing::warn!("shared cache invalidation subscription ended: {}", err);
            }
        });
        self.shared = Some(shared);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.local.is_some() || self.shared.is_some()
    }

    pub fn default_ttl_ms(&self) -> u64 {
        self.default_ttl_ms
    }

    fn generation(&self, tenant_id: &str) -> u64 {
        self.generations.get(tenant_id).map(|g| *g).unwrap_or(0)
    }

    pub async fn get(
        &self,
        key: &DecisionKey,
        min_revision: Option<Revision>,
    ) -> Option<DecisionEntry> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let generation = self.generation(&key.tenant_id);

        if let Some(local) = &self.local {
            if let Some(cached) = local.get(key) {
                if cached.generation == generation
                    && !cached.entry.expired(now_ms)
                    && min_revision.map_or(true, |min| cached.entry.revision >= min)
                {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(cached.entry);
                }
                local.invalidate(key);
            }
        }

        if let Some(shared) = &self.shared {
            match shared.get(&decision_cache_key(key)).await {
                Ok(Some(entry)) => {
                    if !entry.expired(now_ms)
                        && min_revision.map_or(true, |min| entry.revision >= min)
                    {
                        if let Some(local) = &self.local {
                            local.insert(
                                key.clone(),
                                LocalEntry {
                                    entry: entry.clone(),
                                    generation,
                                },
                            );
                        }
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry);
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::debug!("shared cache read failed: {}", err),
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn put(
        &self,
        key: &DecisionKey,
        allowed: bool,
        revision: Revision,
        ttl_ms: Option<u64>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let entry = DecisionEntry {
            allowed,
            revision,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            ttl_ms: ttl_ms.unwrap_or(self.default_ttl_ms),
        };

        if let Some(local) = &self.local {
            local.insert(
                key.clone(),
                LocalEntry {
                    entry: entry.clone(),
                    generation: self.generation(&key.tenant_id),
                },
            );
        }
        if let Some(shared) = &self.shared {
            let ttl_seconds = (entry.ttl_ms / 1_000).max(1);
            if let Err(err) = shared.set(&decision_cache_key(key), &entry, ttl_seconds).await {
                tracing::debug!("shared cache write failed: {}", err);
            }
        }
    }

    /// Drop every entry for a tenant. Idempotent and O(1) for the local
    /// tier; the shared tier gets a pattern delete plus a broadcast.
    pub async fn invalidate_tenant(&self, tenant_id: &str) {
        if !self.is_enabled() {
            return;
        }
        *self.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);

        if let Some(shared) = &self.shared {
            let pattern = format!("warden:decision:{}:*", tenant_id);
            if let Err(err) = shared.delete_pattern(&pattern).await {
                tracing::debug!("shared cache pattern delete failed: {}", err);
            }
            if let Err(err) = shared.publish_invalidation(tenant_id).await {
                tracing::debug!("shared cache invalidation publish failed: {}", err);
            }
        }
    }

    /// Targeted invalidation after a single-edge change. The shared tier
    /// drops only the affected object's entries; the local tier falls back
    /// to a tenant-wide generation bump.
    pub async fn invalidate_object(&self, tenant_id: &str, object: &Entity) {
        if !self.is_enabled() {
            return;
        }
        *self.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);

        if let Some(shared) = &self.shared {
            let pattern = format!("warden:decision:{}:*:{}", tenant_id, object);
            if let Err(err) = shared.delete_pattern(&pattern).await {
                tracing::debug!("shared cache pattern delete failed: {}", err);
            }
            if let Err(err) = shared.publish_invalidation(tenant_id).await {
                tracing::debug!("shared cache invalidation publish failed: {}", err);
            }
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
        }
    }
}
