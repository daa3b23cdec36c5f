use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::error::{AuthzError, Result};
use crate::evaluator::GraphEvaluator;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use validator::Validate;
use warden_bitmap::{
    BitmapError, BitmapIndex, BitmapKey, EnqueueOutcome, ResourceIdMap, ResourceResolver,
    UpdateQueue, WorkerPool,
};
use warden_cache::{CacheStatsSnapshot, DecisionCache, DecisionKey};
use warden_consistency::{ConsistencyError, ConsistencyManager, ZookieSigner};
use warden_models::{
    ConsistencyMode, Decision, Entity, EngineEvent, EventSink, RelationTuple, Revision, SubjectRef,
    TupleFilter, TupleKey,
};
use warden_namespace::{NamespaceRegistry, SharedRegistry};
use warden_store::{BreakerRegistry, BreakerState, GuardedStore, OpClass, StoreError, TupleStore};

/// Priority for post-write refreshes of already-materialized sets.
const REFRESH_PRIORITY: i32 = 100;

fn invalid_input(err: validator::ValidationErrors) -> AuthzError {
    AuthzError::InvalidRequest(err.to_string())
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub decision: Decision,
    pub zookie: String,
    /// True when the verdict was served from cache because the store's
    /// circuit breaker is open.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct ExpandOutcome {
    pub subjects: BTreeSet<SubjectRef>,
    pub zookie: String,
}

#[derive(Debug, Clone)]
pub struct LookupResourcesOutcome {
    pub resource_ids: BTreeSet<String>,
    pub zookie: String,
}

struct BitmapHandles {
    index: Arc<BitmapIndex>,
    queue: Arc<UpdateQueue>,
    resources: Arc<ResourceIdMap>,
    pool: Mutex<Option<WorkerPool>>,
}

/// Recompute hook for the bitmap workers: answers through the graph
/// evaluator, never through the bitmap index itself, and stamps the result
/// with the revision observed before the walk started.
struct EvaluatorResolver {
    evaluator: GraphEvaluator,
    store: Arc<dyn TupleStore>,
}

#[async_trait]
impl ResourceResolver for EvaluatorResolver {
    async fn resolve_accessible(
        &self,
        key: &BitmapKey,
    ) -> std::result::Result<(HashSet<String>, Revision), BitmapError> {
        let revision = self
            .store
            .current_revision(&key.tenant_id)
            .await
            .map_err(|e| BitmapError::Resolve(e.to_string()))?;
        // No request context here: caveated grants evaluate against an
        // empty context and therefore stay out of the materialized set.
        let ctx = RequestContext::new(&key.tenant_id);
        let ids = self
            .evaluator
            .lookup_resources(&ctx, &key.subject, &key.permission, &key.resource_type)
            .await
            .map_err(|e| BitmapError::Resolve(e.to_string()))?;
        Ok((ids.into_iter().collect(), revision))
    }
}

/// The in-process authorization engine: every collaborator is wired
/// explicitly at construction, nothing is global.
pub struct AuthzEngine {
    registry: SharedRegistry,
    store: Arc<GuardedStore>,
    evaluator: GraphEvaluator,
    cache: Arc<DecisionCache>,
    consistency: Arc<ConsistencyManager>,
    bitmap: Option<BitmapHandles>,
    events: Arc<dyn EventSink>,
}

impl AuthzEngine {
    /// Wire up the engine. Must be called within a Tokio runtime when the
    /// bitmap index is enabled (its worker pool spawns immediately).
    pub fn new(
        backing: Arc<dyn TupleStore>,
        registry: SharedRegistry,
        config: EngineConfig,
        cache: DecisionCache,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let store = Arc::new(GuardedStore::new(backing, breakers, events.clone()));
        let store_dyn: Arc<dyn TupleStore> = store.clone();

        let signer = match &config.zookie.mac_key {
            Some(key) if !key.is_empty() => ZookieSigner::new(key.clone().into_bytes()),
            _ => ZookieSigner::from_env_or_default(),
        };
        let consistency = Arc::new(ConsistencyManager::new(
            store_dyn.clone(),
            signer,
            config.consistency.clone(),
        ));
        let evaluator = GraphEvaluator::new(
            store_dyn.clone(),
            registry.clone(),
            config.evaluator.clone(),
        );

        let bitmap = config.bitmap.enabled.then(|| {
            let index = Arc::new(BitmapIndex::new());
            let queue = Arc::new(UpdateQueue::new(
                config.bitmap.queue_capacity_per_tenant,
                config.bitmap.retry_cap,
            ));
            let resources = Arc::new(ResourceIdMap::new());
            let resolver = Arc::new(EvaluatorResolver {
                evaluator: evaluator.clone(),
                store: store_dyn.clone(),
            });
            let pool = WorkerPool::spawn(
                &config.bitmap,
                queue.clone(),
                index.clone(),
                resources.clone(),
                resolver,
                events.clone(),
            );
            BitmapHandles {
                index,
                queue,
                resources,
                pool: Mutex::new(Some(pool)),
            }
        });

        Self {
            registry,
            store,
            evaluator,
            cache: Arc::new(cache),
            consistency,
            bitmap,
            events,
        }
    }

    /// Stop the background workers; in-flight jobs finish or are requeued
    /// by the reaper on the next start.
    pub async fn shutdown(&self) {
        if let Some(bitmap) = &self.bitmap {
            let pool = bitmap
                .pool
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(pool) = pool {
                pool.shutdown().await;
            }
        }
    }

    // -- Reads ------------------------------------------------------------

    pub async fn check_permission(
        &self,
        ctx: &RequestContext,
        subject: &SubjectRef,
        permission: &str,
        object: &Entity,
    ) -> Result<CheckOutcome> {
        ctx.ensure_active()?;
        self.validate_types(ctx, Some(object), Some(subject))?;
        let mode = self
            .consistency
            .resolve_mode(&ctx.tenant_id, ctx.consistency, ctx.zookie.as_deref())?;
        self.wait_visible(ctx, &mode).await?;

        let key = DecisionKey::new(
            ctx.tenant_id.clone(),
            subject.clone(),
            permission,
            object.clone(),
        );

        // Cache entries are keyed without the caveat context, so a request
        // carrying caveat variables can neither read nor seed them.
        let cacheable = ctx.caveat_context.is_empty();

        if mode.allows_cache_read() && cacheable {
            if let Some(entry) = self.cache.get(&key, mode.min_revision()).await {
                let zookie = self.consistency.mint(&ctx.tenant_id, entry.revision)?;
                return Ok(CheckOutcome {
                    decision: Decision::from_bool(entry.allowed),
                    zookie,
                    degraded: false,
                });
            }
            if let Some(outcome) = self.bitmap_check(ctx, subject, permission, object, &mode)? {
                return Ok(outcome);
            }
        }

        let stamp = match self.store.current_revision(&ctx.tenant_id).await {
            Ok(revision) => revision,
            Err(StoreError::CircuitOpen {
                tenant_id,
                operation,
            }) => {
                return match self.degraded_check(ctx, &key).await {
                    Some(outcome) => Ok(outcome),
                    None => Err(AuthzError::CircuitOpen {
                        tenant_id,
                        operation,
                    }),
                };
            }
            Err(err) => return Err(err.into()),
        };

        match self.evaluator.check(ctx, subject, permission, object).await {
            Ok(decision) => {
                if cacheable {
                    self.cache
                        .put(&key, decision.is_allow(), stamp, None)
                        .await;
                }
                let zookie = self.consistency.mint(&ctx.tenant_id, stamp)?;
                Ok(CheckOutcome {
                    decision,
                    zookie,
                    degraded: false,
                })
            }
            Err(AuthzError::CircuitOpen {
                tenant_id,
                operation,
            }) => match self.degraded_check(ctx, &key).await {
                Some(outcome) => Ok(outcome),
                None => Err(AuthzError::CircuitOpen {
                    tenant_id,
                    operation,
                }),
            },
            Err(AuthzError::DepthExceeded { max_depth }) => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    subject = %subject,
                    permission,
                    object = %object,
                    max_depth,
                    "rewrite depth exceeded, denying"
                );
                let zookie = self.consistency.mint(&ctx.tenant_id, stamp)?;
                Ok(CheckOutcome {
                    decision: Decision::Deny,
                    zookie,
                    degraded: false,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn expand_permission(
        &self,
        ctx: &RequestContext,
        permission: &str,
        object: &Entity,
    ) -> Result<ExpandOutcome> {
        ctx.ensure_active()?;
        self.validate_types(ctx, Some(object), None)?;
        let mode = self
            .consistency
            .resolve_mode(&ctx.tenant_id, ctx.consistency, ctx.zookie.as_deref())?;
        self.wait_visible(ctx, &mode).await?;

        let stamp = self.store.current_revision(&ctx.tenant_id).await?;
        let subjects = self.evaluator.expand(ctx, permission, object).await?;
        let zookie = self.consistency.mint(&ctx.tenant_id, stamp)?;
        Ok(ExpandOutcome { subjects, zookie })
    }

    pub async fn lookup_subjects(
        &self,
        ctx: &RequestContext,
        permission: &str,
        object: &Entity,
    ) -> Result<ExpandOutcome> {
        self.expand_permission(ctx, permission, object).await
    }

    pub async fn lookup_resources(
        &self,
        ctx: &RequestContext,
        subject: &SubjectRef,
        permission: &str,
        resource_type: &str,
    ) -> Result<LookupResourcesOutcome> {
        ctx.ensure_active()?;
        self.validate_types(ctx, None, Some(subject))?;
        if !self.registry.load().contains_type(resource_type) {
            return Err(AuthzError::InvalidRequest(format!(
                "unknown resource type: {}",
                resource_type
            )));
        }
        let mode = self
            .consistency
            .resolve_mode(&ctx.tenant_id, ctx.consistency, ctx.zookie.as_deref())?;
        self.wait_visible(ctx, &mode).await?;

        // Context-carrying requests bypass the context-free index.
        if mode.allows_cache_read() && ctx.caveat_context.is_empty() {
            if let Some(bitmap) = &self.bitmap {
                let key = BitmapKey::new(
                    ctx.tenant_id.clone(),
                    subject.clone(),
                    permission,
                    resource_type,
                );
                if let Some((set, revision)) =
                    bitmap.index.accessible_resources(&key, mode.min_revision())
                {
                    let ids = bitmap.resources.resolve_ids(
                        &ctx.tenant_id,
                        resource_type,
                        set.iter().map(|v| v as i64),
                    );
                    let zookie = self.consistency.mint(&ctx.tenant_id, revision)?;
                    return Ok(LookupResourcesOutcome {
                        resource_ids: ids.into_iter().collect(),
                        zookie,
                    });
                }
            }
        }

        let stamp = self.store.current_revision(&ctx.tenant_id).await?;
        let resource_ids = self
            .evaluator
            .lookup_resources(ctx, subject, permission, resource_type)
            .await?;
        let zookie = self.consistency.mint(&ctx.tenant_id, stamp)?;
        Ok(LookupResourcesOutcome {
            resource_ids,
            zookie,
        })
    }

    pub async fn read_relationships(
        &self,
        ctx: &RequestContext,
        filter: &TupleFilter,
    ) -> Result<Vec<RelationTuple>> {
        ctx.ensure_active()?;
        ctx.validate().map_err(invalid_input)?;
        let mode = self
            .consistency
            .resolve_mode(&ctx.tenant_id, ctx.consistency, ctx.zookie.as_deref())?;
        self.wait_visible(ctx, &mode).await?;
        Ok(self.store.read(&ctx.tenant_id, filter).await?)
    }

    // -- Writes -----------------------------------------------------------

    pub async fn write_relationships(
        &self,
        ctx: &RequestContext,
        adds: Vec<RelationTuple>,
        removes: Vec<TupleKey>,
    ) -> Result<String> {
        ctx.ensure_active()?;
        ctx.validate().map_err(invalid_input)?;
        let registry = self.registry.load();
        for tuple in &adds {
            self.validate_tuple(&registry, &ctx.tenant_id, tuple)?;
        }
        for key in &removes {
            key.validate().map_err(invalid_input)?;
            if key.tenant_id != ctx.tenant_id {
                return Err(AuthzError::InvalidRequest(format!(
                    "remove key tenant {} does not match request tenant {}",
                    key.tenant_id, ctx.tenant_id
                )));
            }
        }

        let revision = self
            .store
            .write(&ctx.tenant_id, adds.clone(), removes.clone())
            .await?;
        self.after_commit(&ctx.tenant_id, revision).await;
        self.maintain_bitmap(&registry, &ctx.tenant_id, &adds, &removes);
        Ok(self.consistency.mint(&ctx.tenant_id, revision)?)
    }

    pub async fn delete_relationships(
        &self,
        ctx: &RequestContext,
        filter: &TupleFilter,
    ) -> Result<String> {
        ctx.ensure_active()?;
        ctx.validate().map_err(invalid_input)?;
        let revision = self.store.delete_by_filter(&ctx.tenant_id, filter).await?;
        self.after_commit(&ctx.tenant_id, revision).await;
        let registry = self.registry.load();
        self.maintain_bitmap(&registry, &ctx.tenant_id, &[], &[]);
        Ok(self.consistency.mint(&ctx.tenant_id, revision)?)
    }

    // -- Bitmap maintenance ------------------------------------------------

    /// Ask for a subject's answer set to be materialized (or refreshed) in
    /// the background. Returns false when the index is disabled or the
    /// tenant's queue is saturated.
    pub fn queue_bitmap_refresh(
        &self,
        tenant_id: &str,
        subject: &SubjectRef,
        permission: &str,
        resource_type: &str,
        priority: i32,
    ) -> bool {
        let Some(bitmap) = &self.bitmap else {
            return false;
        };
        let key = BitmapKey::new(tenant_id, subject.clone(), permission, resource_type);
        match bitmap.queue.enqueue(key.clone(), priority) {
            EnqueueOutcome::Overflow => {
                bitmap.index.mark_stale(&key);
                false
            }
            _ => true,
        }
    }

    // -- Introspection ----------------------------------------------------

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    pub fn breaker_states(
        &self,
    ) -> Vec<(String, OpClass, BreakerState, std::time::Duration)> {
        self.store.breakers().states()
    }

    pub fn bitmap_pending_jobs(&self) -> Option<usize> {
        self.bitmap.as_ref().map(|b| b.queue.pending_len())
    }

    // -- Internals --------------------------------------------------------

    /// Field-shape validation runs through `validator`; the registry
    /// lookups that follow are schema-level checks it cannot express.
    fn validate_types(
        &self,
        ctx: &RequestContext,
        object: Option<&Entity>,
        subject: Option<&SubjectRef>,
    ) -> Result<()> {
        ctx.validate().map_err(invalid_input)?;
        let registry = self.registry.load();
        if let Some(object) = object {
            object.validate().map_err(invalid_input)?;
            if !registry.contains_type(&object.entity_type) {
                return Err(AuthzError::InvalidRequest(format!(
                    "unknown object type: {}",
                    object.entity_type
                )));
            }
        }
        if let Some(subject) = subject {
            subject.validate().map_err(invalid_input)?;
            if !registry.contains_type(&subject.entity.entity_type) {
                return Err(AuthzError::InvalidRequest(format!(
                    "unknown subject type: {}",
                    subject.entity.entity_type
                )));
            }
        }
        Ok(())
    }

    fn validate_tuple(
        &self,
        registry: &NamespaceRegistry,
        tenant_id: &str,
        tuple: &RelationTuple,
    ) -> Result<()> {
        tuple.validate().map_err(invalid_input)?;
        if tuple.tenant_id != tenant_id {
            return Err(AuthzError::InvalidRequest(format!(
                "tuple tenant {} does not match request tenant {}",
                tuple.tenant_id, tenant_id
            )));
        }
        let Some(def) = registry.get(&tuple.object.entity_type) else {
            return Err(AuthzError::InvalidRequest(format!(
                "unknown object type: {}",
                tuple.object.entity_type
            )));
        };
        if !def.relations.contains(&tuple.relation) {
            return Err(AuthzError::InvalidRequest(format!(
                "unknown relation {} on type {}",
                tuple.relation, tuple.object.entity_type
            )));
        }
        let subject_type = &tuple.subject.entity.entity_type;
        if !registry.contains_type(subject_type) {
            return Err(AuthzError::InvalidRequest(format!(
                "unknown subject type: {}",
                subject_type
            )));
        }
        if let Some(member_relation) = &tuple.subject.relation {
            if !registry.relation_exists(subject_type, member_relation) {
                return Err(AuthzError::InvalidRequest(format!(
                    "unknown relation {} on subject type {}",
                    member_relation, subject_type
                )));
            }
        }
        Ok(())
    }

    async fn wait_visible(&self, ctx: &RequestContext, mode: &ConsistencyMode) -> Result<()> {
        match self
            .consistency
            .ensure_visible(&ctx.tenant_id, mode, &ctx.cancellation)
            .await
        {
            Ok(()) => Ok(()),
            Err(ConsistencyError::Timeout {
                tenant_id,
                requested,
                current,
                elapsed_ms,
            }) => {
                self.events.publish(EngineEvent::ConsistencyTimeout {
                    tenant_id: tenant_id.clone(),
                    requested,
                    current,
                    elapsed_ms,
                });
                Err(AuthzError::ConsistencyTimeout {
                    tenant_id,
                    requested,
                    current,
                    elapsed_ms,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn bitmap_check(
        &self,
        ctx: &RequestContext,
        subject: &SubjectRef,
        permission: &str,
        object: &Entity,
        mode: &ConsistencyMode,
    ) -> Result<Option<CheckOutcome>> {
        // The index is context-free; a request carrying caveat variables
        // must be answered by the evaluator.
        if !ctx.caveat_context.is_empty() {
            return Ok(None);
        }
        let Some(bitmap) = &self.bitmap else {
            return Ok(None);
        };
        let Some(int_id) =
            bitmap
                .resources
                .get(&ctx.tenant_id, &object.entity_type, &object.entity_id)
        else {
            return Ok(None);
        };
        let key = BitmapKey::new(
            ctx.tenant_id.clone(),
            subject.clone(),
            permission,
            object.entity_type.clone(),
        );
        match bitmap
            .index
            .check_access_with_revision(&key, int_id, mode.min_revision())
        {
            Some((allowed, revision)) => {
                let zookie = self.consistency.mint(&ctx.tenant_id, revision)?;
                Ok(Some(CheckOutcome {
                    decision: Decision::from_bool(allowed),
                    zookie,
                    degraded: false,
                }))
            }
            None => Ok(None),
        }
    }

    /// Open breaker: serve the cached verdict at any revision, flagged as
    /// degraded. The cache is consulted here even for modes that normally
    /// bypass it, but never for context-carrying requests — cached
    /// verdicts were produced without their caveat variables.
    async fn degraded_check(&self, ctx: &RequestContext, key: &DecisionKey) -> Option<CheckOutcome> {
        if !ctx.caveat_context.is_empty() {
            return None;
        }
        let entry = self.cache.get(key, None).await?;
        let zookie = self.consistency.mint(&ctx.tenant_id, entry.revision).ok()?;
        Some(CheckOutcome {
            decision: Decision::from_bool(entry.allowed),
            zookie,
            degraded: true,
        })
    }

    /// Invalidation is ordered after the commit that caused it.
    async fn after_commit(&self, tenant_id: &str, revision: Revision) {
        self.events.publish(EngineEvent::TenantRevisionChanged {
            tenant_id: tenant_id.to_string(),
            revision,
        });
        self.cache.invalidate_tenant(tenant_id).await;
        self.events.publish(EngineEvent::CacheInvalidated {
            tenant_id: tenant_id.to_string(),
        });
    }

    fn maintain_bitmap(
        &self,
        registry: &NamespaceRegistry,
        tenant_id: &str,
        adds: &[RelationTuple],
        removes: &[TupleKey],
    ) {
        let Some(bitmap) = &self.bitmap else {
            return;
        };

        // Write-through: single-edge changes for concrete subjects flip the
        // bit immediately in every materialized set the relation feeds.
        // Caveated grants are excluded: the materialized sets are
        // context-free, and the recompute path leaves them out as well.
        for tuple in adds {
            if tuple.subject.relation.is_none() && tuple.caveat.is_none() {
                self.write_through(
                    bitmap, registry, tenant_id, &tuple.object, &tuple.relation, &tuple.subject,
                    true,
                );
            }
        }
        for key in removes {
            if key.subject_relation.is_empty() {
                self.write_through(
                    bitmap,
                    registry,
                    tenant_id,
                    &key.object(),
                    &key.relation,
                    &key.subject(),
                    false,
                );
            }
        }

        // Every materialized set in the tenant gets a recompute; the queue
        // dedupes, and overflow marks the set stale so reads fall back.
        for key in bitmap.index.keys_for_tenant(tenant_id) {
            if let EnqueueOutcome::Overflow = bitmap.queue.enqueue(key.clone(), REFRESH_PRIORITY) {
                bitmap.index.mark_stale(&key);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_through(
        &self,
        bitmap: &BitmapHandles,
        registry: &NamespaceRegistry,
        tenant_id: &str,
        object: &Entity,
        relation: &str,
        subject: &SubjectRef,
        grant: bool,
    ) {
        let int_id =
            bitmap
                .resources
                .get_or_assign(tenant_id, &object.entity_type, &object.entity_id);

        // Grants only flip bits in sets the relation can purely widen;
        // revokes clear every referencing set (the recompute restores any
        // access that still holds through other branches).
        let mut permissions = vec![relation.to_string()];
        if let Some(def) = registry.get(&object.entity_type) {
            if grant {
                permissions.extend(def.permissions_granting(relation));
            } else {
                permissions.extend(def.permissions_referencing(relation));
            }
        }
        for permission in permissions {
            let key = BitmapKey::new(
                tenant_id,
                subject.clone(),
                permission,
                object.entity_type.clone(),
            );
            if grant {
                bitmap.index.persist_grant(&key, int_id);
            } else {
                // A cleared bit is a hint; the queued recompute re-derives
                // the authoritative set, restoring grants that still hold
                // through other branches.
                bitmap.index.persist_revoke(&key, int_id);
            }
        }
    }
}
