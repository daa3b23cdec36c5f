use crate::context::RequestContext;
use crate::error::{AuthzError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use warden_models::{Decision, Entity, RelationTuple, SubjectRef, TupleFilter};
use warden_namespace::{NamespaceRegistry, RewriteExpr, SharedRegistry};
use warden_store::TupleStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Maximum rewrite traversal depth.
    pub max_depth: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

/// Nodes already on the current traversal path, cloned per branch so
/// parallel branches can never poison each other's cycle detection.
type VisitKey = (String, String, String);

/// Stateless traversal over the rewrite graph.
///
/// All four operations resolve a name on an object type to its rewrite
/// expression (falling back to a direct-tuple lookup for plain relations)
/// and walk it with short-circuit semantics: union returns on the first
/// allow, intersection on the first deny, exclusion denies when the
/// excluded branch allows.
#[derive(Clone)]
pub struct GraphEvaluator {
    store: Arc<dyn TupleStore>,
    registry: SharedRegistry,
    config: EvaluatorConfig,
}

impl GraphEvaluator {
    pub fn new(store: Arc<dyn TupleStore>, registry: SharedRegistry, config: EvaluatorConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Does `subject` hold `permission` on `object`?
    pub async fn check(
        &self,
        ctx: &RequestContext,
        subject: &SubjectRef,
        permission: &str,
        object: &Entity,
    ) -> Result<Decision> {
        let registry = self.registry.load();
        let allowed = self
            .check_relation(ctx, &registry, subject, permission, object, &HashSet::new(), 0)
            .await?;
        Ok(Decision::from_bool(allowed))
    }

    /// All concrete subjects satisfying `permission` on `object`.
    pub async fn expand(
        &self,
        ctx: &RequestContext,
        permission: &str,
        object: &Entity,
    ) -> Result<BTreeSet<SubjectRef>> {
        let registry = self.registry.load();
        self.expand_relation(ctx, &registry, permission, object, &HashSet::new(), 0)
            .await
    }

    /// Distinct name for the same traversal, kept for the public API.
    pub async fn lookup_subjects(
        &self,
        ctx: &RequestContext,
        permission: &str,
        object: &Entity,
    ) -> Result<BTreeSet<SubjectRef>> {
        self.expand(ctx, permission, object).await
    }

    /// Ids of `resource_type` objects on which `subject` holds
    /// `permission`: the reverse walk.
    pub async fn lookup_resources(
        &self,
        ctx: &RequestContext,
        subject: &SubjectRef,
        permission: &str,
        resource_type: &str,
    ) -> Result<BTreeSet<String>> {
        let registry = self.registry.load();
        self.lookup_relation(
            ctx,
            &registry,
            subject,
            permission,
            resource_type,
            &HashSet::new(),
            0,
        )
        .await
    }

    fn guard_depth(&self, depth: usize) -> Result<()> {
        if depth > self.config.max_depth {
            return Err(AuthzError::DepthExceeded {
                max_depth: self.config.max_depth,
            });
        }
        Ok(())
    }

    /// A caveat that fails or cannot be decided denies only the tuple that
    /// carries it, never the overall query.
    fn caveat_allows(&self, ctx: &RequestContext, tuple: &RelationTuple) -> bool {
        match &tuple.caveat {
            None => true,
            Some(caveat) => match caveat.evaluate(&ctx.caveat_context) {
                Ok(allowed) => allowed,
                Err(err) => {
                    tracing::debug!(
                        caveat = %caveat.name,
                        object = %tuple.object,
                        "caveat undecidable, denying tuple: {}",
                        err
                    );
                    false
                }
            },
        }
    }

    fn check_relation<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        subject: &'a SubjectRef,
        relation: &'a str,
        object: &'a Entity,
        visited: &'a HashSet<VisitKey>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            self.guard_depth(depth)?;

            let visit_key = (
                relation.to_string(),
                object.entity_type.clone(),
                object.entity_id.clone(),
            );
            if visited.contains(&visit_key) {
                // Cycle: this path cannot prove anything new.
                return Ok(false);
            }
            let mut visited = visited.clone();
            visited.insert(visit_key);

            match registry.rewrite(&object.entity_type, relation) {
                Some(expr) => {
                    self.check_expr(ctx, registry, subject, relation, object, expr, &visited, depth)
                        .await
                }
                None => {
                    self.check_this(ctx, registry, subject, relation, object, &visited, depth)
                        .await
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn check_expr<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        subject: &'a SubjectRef,
        relation: &'a str,
        object: &'a Entity,
        expr: &'a RewriteExpr,
        visited: &'a HashSet<VisitKey>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            match expr {
                RewriteExpr::This => {
                    self.check_this(ctx, registry, subject, relation, object, visited, depth)
                        .await
                }
                RewriteExpr::ComputedUserset(target) => {
                    self.check_relation(ctx, registry, subject, target, object, visited, depth + 1)
                        .await
                }
                RewriteExpr::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    let related = self
                        .store
                        .find_related_objects(&ctx.tenant_id, object, tupleset)
                        .await?;
                    for target in &related {
                        // Never recurse into a type the registry does not
                        // know; skip silently rather than assume anything.
                        if !registry.contains_type(&target.entity_type) {
                            continue;
                        }
                        if self
                            .check_relation(
                                ctx,
                                registry,
                                subject,
                                computed_userset,
                                target,
                                visited,
                                depth + 1,
                            )
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RewriteExpr::Union(children) => {
                    for child in children {
                        if self
                            .check_expr(
                                ctx, registry, subject, relation, object, child, visited, depth,
                            )
                            .await?
                        {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RewriteExpr::Intersection(children) => {
                    if children.is_empty() {
                        return Ok(false);
                    }
                    for child in children {
                        if !self
                            .check_expr(
                                ctx, registry, subject, relation, object, child, visited, depth,
                            )
                            .await?
                        {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                RewriteExpr::Exclusion { include, exclude } => {
                    if self
                        .check_expr(
                            ctx, registry, subject, relation, object, exclude, visited, depth,
                        )
                        .await?
                    {
                        return Ok(false);
                    }
                    self.check_expr(
                        ctx, registry, subject, relation, object, include, visited, depth,
                    )
                    .await
                }
            }
        })
    }

    /// Direct tuples stored under `relation` on `object`: a concrete match
    /// answers immediately, a userset grant recurses into its membership.
    #[allow(clippy::too_many_arguments)]
    fn check_this<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        subject: &'a SubjectRef,
        relation: &'a str,
        object: &'a Entity,
        visited: &'a HashSet<VisitKey>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            let tuples = self
                .store
                .get_direct_subjects(&ctx.tenant_id, object, relation)
                .await?;

            for tuple in &tuples {
                if !self.caveat_allows(ctx, tuple) {
                    continue;
                }
                if tuple.subject == *subject {
                    return Ok(true);
                }
                if let Some(member_relation) = &tuple.subject.relation {
                    if self
                        .check_relation(
                            ctx,
                            registry,
                            subject,
                            member_relation,
                            &tuple.subject.entity,
                            visited,
                            depth + 1,
                        )
                        .await?
                    {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        })
    }

    fn expand_relation<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        relation: &'a str,
        object: &'a Entity,
        visited: &'a HashSet<VisitKey>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<SubjectRef>>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            self.guard_depth(depth)?;

            let visit_key = (
                relation.to_string(),
                object.entity_type.clone(),
                object.entity_id.clone(),
            );
            if visited.contains(&visit_key) {
                return Ok(BTreeSet::new());
            }
            let mut visited = visited.clone();
            visited.insert(visit_key);

            match registry.rewrite(&object.entity_type, relation) {
                Some(expr) => {
                    self.expand_expr(ctx, registry, relation, object, expr, &visited, depth)
                        .await
                }
                None => {
                    self.expand_this(ctx, registry, relation, object, &visited, depth)
                        .await
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn expand_expr<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        relation: &'a str,
        object: &'a Entity,
        expr: &'a RewriteExpr,
        visited: &'a HashSet<VisitKey>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<SubjectRef>>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            match expr {
                RewriteExpr::This => {
                    self.expand_this(ctx, registry, relation, object, visited, depth)
                        .await
                }
                RewriteExpr::ComputedUserset(target) => {
                    self.expand_relation(ctx, registry, target, object, visited, depth + 1)
                        .await
                }
                RewriteExpr::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    let related = self
                        .store
                        .find_related_objects(&ctx.tenant_id, object, tupleset)
                        .await?;
                    let mut subjects = BTreeSet::new();
                    for target in &related {
                        if !registry.contains_type(&target.entity_type) {
                            continue;
                        }
                        let sub = self
                            .expand_relation(
                                ctx,
                                registry,
                                computed_userset,
                                target,
                                visited,
                                depth + 1,
                            )
                            .await?;
                        subjects.extend(sub);
                    }
                    Ok(subjects)
                }
                RewriteExpr::Union(children) => {
                    let mut subjects = BTreeSet::new();
                    for child in children {
                        let sub = self
                            .expand_expr(ctx, registry, relation, object, child, visited, depth)
                            .await?;
                        subjects.extend(sub);
                    }
                    Ok(subjects)
                }
                RewriteExpr::Intersection(children) => {
                    let mut result: Option<BTreeSet<SubjectRef>> = None;
                    for child in children {
                        let sub = self
                            .expand_expr(ctx, registry, relation, object, child, visited, depth)
                            .await?;
                        result = Some(match result {
                            None => sub,
                            Some(acc) => acc.intersection(&sub).cloned().collect(),
                        });
                        if result.as_ref().is_some_and(|set| set.is_empty()) {
                            break;
                        }
                    }
                    Ok(result.unwrap_or_default())
                }
                RewriteExpr::Exclusion { include, exclude } => {
                    let included = self
                        .expand_expr(ctx, registry, relation, object, include, visited, depth)
                        .await?;
                    if included.is_empty() {
                        return Ok(included);
                    }
                    let excluded = self
                        .expand_expr(ctx, registry, relation, object, exclude, visited, depth)
                        .await?;
                    Ok(included.difference(&excluded).cloned().collect())
                }
            }
        })
    }

    fn expand_this<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        relation: &'a str,
        object: &'a Entity,
        visited: &'a HashSet<VisitKey>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<SubjectRef>>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            let tuples = self
                .store
                .get_direct_subjects(&ctx.tenant_id, object, relation)
                .await?;

            let mut subjects = BTreeSet::new();
            for tuple in &tuples {
                if !self.caveat_allows(ctx, tuple) {
                    continue;
                }
                match &tuple.subject.relation {
                    None => {
                        subjects.insert(tuple.subject.clone());
                    }
                    Some(member_relation) => {
                        let members = self
                            .expand_relation(
                                ctx,
                                registry,
                                member_relation,
                                &tuple.subject.entity,
                                visited,
                                depth + 1,
                            )
                            .await?;
                        subjects.extend(members);
                    }
                }
            }
            Ok(subjects)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn lookup_relation<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        subject: &'a SubjectRef,
        relation: &'a str,
        resource_type: &'a str,
        visited: &'a HashSet<(String, String)>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<String>>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            self.guard_depth(depth)?;

            let visit_key = (relation.to_string(), resource_type.to_string());
            if visited.contains(&visit_key) {
                return Ok(BTreeSet::new());
            }
            let mut visited = visited.clone();
            visited.insert(visit_key);

            match registry.rewrite(resource_type, relation) {
                Some(expr) => {
                    self.lookup_expr(
                        ctx,
                        registry,
                        subject,
                        relation,
                        resource_type,
                        expr,
                        &visited,
                        depth,
                    )
                    .await
                }
                None => {
                    self.lookup_this(ctx, registry, subject, relation, resource_type, depth)
                        .await
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn lookup_expr<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        subject: &'a SubjectRef,
        relation: &'a str,
        resource_type: &'a str,
        expr: &'a RewriteExpr,
        visited: &'a HashSet<(String, String)>,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<String>>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            match expr {
                RewriteExpr::This => {
                    self.lookup_this(ctx, registry, subject, relation, resource_type, depth)
                        .await
                }
                RewriteExpr::ComputedUserset(target) => {
                    self.lookup_relation(
                        ctx,
                        registry,
                        subject,
                        target,
                        resource_type,
                        visited,
                        depth + 1,
                    )
                    .await
                }
                RewriteExpr::TupleToUserset {
                    tupleset,
                    computed_userset,
                } => {
                    // Inverse arrow: find (object, tupleset, target) links of
                    // this resource type, then keep the objects whose target
                    // grants the computed userset to the subject.
                    let filter = TupleFilter {
                        object_type: Some(resource_type.to_string()),
                        relation: Some(tupleset.to_string()),
                        ..Default::default()
                    };
                    let links = self.store.read(&ctx.tenant_id, &filter).await?;

                    let mut verdicts: HashMap<Entity, bool> = HashMap::new();
                    let mut ids = BTreeSet::new();
                    for link in &links {
                        if !self.caveat_allows(ctx, link) {
                            continue;
                        }
                        let target = &link.subject.entity;
                        if !registry.contains_type(&target.entity_type) {
                            continue;
                        }
                        let allowed = match verdicts.get(target) {
                            Some(known) => *known,
                            None => {
                                let answer = self
                                    .check_relation(
                                        ctx,
                                        registry,
                                        subject,
                                        computed_userset,
                                        target,
                                        &HashSet::new(),
                                        depth + 1,
                                    )
                                    .await?;
                                verdicts.insert(target.clone(), answer);
                                answer
                            }
                        };
                        if allowed {
                            ids.insert(link.object.entity_id.clone());
                        }
                    }
                    Ok(ids)
                }
                RewriteExpr::Union(children) => {
                    let mut ids = BTreeSet::new();
                    for child in children {
                        let sub = self
                            .lookup_expr(
                                ctx,
                                registry,
                                subject,
                                relation,
                                resource_type,
                                child,
                                visited,
                                depth,
                            )
                            .await?;
                        ids.extend(sub);
                    }
                    Ok(ids)
                }
                RewriteExpr::Intersection(children) => {
                    let mut result: Option<BTreeSet<String>> = None;
                    for child in children {
                        let sub = self
                            .lookup_expr(
                                ctx,
                                registry,
                                subject,
                                relation,
                                resource_type,
                                child,
                                visited,
                                depth,
                            )
                            .await?;
                        result = Some(match result {
                            None => sub,
                            Some(acc) => acc.intersection(&sub).cloned().collect(),
                        });
                        if result.as_ref().is_some_and(|set| set.is_empty()) {
                            break;
                        }
                    }
                    Ok(result.unwrap_or_default())
                }
                RewriteExpr::Exclusion { include, exclude } => {
                    let included = self
                        .lookup_expr(
                            ctx,
                            registry,
                            subject,
                            relation,
                            resource_type,
                            include,
                            visited,
                            depth,
                        )
                        .await?;
                    if included.is_empty() {
                        return Ok(included);
                    }
                    let excluded = self
                        .lookup_expr(
                            ctx,
                            registry,
                            subject,
                            relation,
                            resource_type,
                            exclude,
                            visited,
                            depth,
                        )
                        .await?;
                    Ok(included.difference(&excluded).cloned().collect())
                }
            }
        })
    }

    /// Direct grants of `relation` over the resource type: concrete tuples
    /// for the subject plus userset grants whose membership the subject
    /// satisfies.
    fn lookup_this<'a>(
        &'a self,
        ctx: &'a RequestContext,
        registry: &'a NamespaceRegistry,
        subject: &'a SubjectRef,
        relation: &'a str,
        resource_type: &'a str,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeSet<String>>> + Send + 'a>> {
        Box::pin(async move {
            ctx.ensure_active()?;
            let filter = TupleFilter {
                object_type: Some(resource_type.to_string()),
                relation: Some(relation.to_string()),
                ..Default::default()
            };
            let grants = self.store.read(&ctx.tenant_id, &filter).await?;

            let mut membership: HashMap<(Entity, String), bool> = HashMap::new();
            let mut ids = BTreeSet::new();
            for grant in &grants {
                if !self.caveat_allows(ctx, grant) {
                    continue;
                }
                if grant.subject == *subject {
                    ids.insert(grant.object.entity_id.clone());
                    continue;
                }
                let Some(member_relation) = &grant.subject.relation else {
                    continue;
                };
                let key = (grant.subject.entity.clone(), member_relation.clone());
                let allowed = match membership.get(&key) {
                    Some(known) => *known,
                    None => {
                        let answer = self
                            .check_relation(
                                ctx,
                                registry,
                                subject,
                                member_relation,
                                &grant.subject.entity,
                                &HashSet::new(),
                                depth + 1,
                            )
                            .await?;
                        membership.insert(key, answer);
                        answer
                    }
                };
                if allowed {
                    ids.insert(grant.object.entity_id.clone());
                }
            }
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_models::{Caveat, CaveatExpr, RelationTuple};
    use warden_namespace::NamespaceDef;
    use warden_store::MemoryTupleStore;

    fn registry() -> SharedRegistry {
        let doc = NamespaceDef::new("doc")
            .with_relation("direct_viewer")
            .with_relation("direct_editor")
            .with_relation("group_viewer")
            .with_relation("banned")
            .with_relation("parent")
            .with_permission(
                "view",
                RewriteExpr::union(vec![
                    RewriteExpr::computed("direct_viewer"),
                    RewriteExpr::computed("group_viewer"),
                    RewriteExpr::arrow("parent", "view"),
                ]),
            )
            .with_permission(
                "edit_and_view",
                RewriteExpr::intersection(vec![
                    RewriteExpr::computed("direct_editor"),
                    RewriteExpr::computed("direct_viewer"),
                ]),
            )
            .with_permission(
                "view_unless_banned",
                RewriteExpr::exclusion(
                    RewriteExpr::computed("direct_viewer"),
                    RewriteExpr::computed("banned"),
                ),
            );
        let folder = NamespaceDef::new("folder")
            .with_relation("direct_viewer")
            .with_relation("parent")
            .with_permission(
                "view",
                RewriteExpr::union(vec![
                    RewriteExpr::computed("direct_viewer"),
                    RewriteExpr::arrow("parent", "view"),
                ]),
            );
        let group = NamespaceDef::new("group").with_relation("member");
        SharedRegistry::new(NamespaceRegistry::new(vec![doc, folder, group]).unwrap())
    }

    fn evaluator(store: Arc<MemoryTupleStore>) -> GraphEvaluator {
        GraphEvaluator::new(store, registry(), EvaluatorConfig::default())
    }

    fn evaluator_with_depth(store: Arc<MemoryTupleStore>, max_depth: usize) -> GraphEvaluator {
        GraphEvaluator::new(store, registry(), EvaluatorConfig { max_depth })
    }

    fn tuple(object: (&str, &str), relation: &str, subject: SubjectRef) -> RelationTuple {
        RelationTuple::new("t1", Entity::new(object.0, object.1), relation, subject)
    }

    async fn seed(store: &MemoryTupleStore, tuples: Vec<RelationTuple>) {
        store.write("t1", tuples, vec![]).await.unwrap();
    }

    fn ctx() -> RequestContext {
        RequestContext::new("t1")
    }

    #[tokio::test]
    async fn direct_grant_allows_only_the_grantee() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![tuple(
                ("doc", "readme"),
                "direct_viewer",
                SubjectRef::entity("user", "alice"),
            )],
        )
        .await;
        let eval = evaluator(store);

        let alice = SubjectRef::entity("user", "alice");
        let bob = SubjectRef::entity("user", "bob");
        let readme = Entity::new("doc", "readme");

        assert_eq!(
            eval.check(&ctx(), &alice, "view", &readme).await.unwrap(),
            Decision::Allow
        );
        assert_eq!(
            eval.check(&ctx(), &bob, "view", &readme).await.unwrap(),
            Decision::Deny
        );
    }

    #[tokio::test]
    async fn empty_store_denies_everything() {
        let eval = evaluator(Arc::new(MemoryTupleStore::new()));
        let verdict = eval
            .check(
                &ctx(),
                &SubjectRef::entity("user", "alice"),
                "view",
                &Entity::new("doc", "missing"),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Decision::Deny);
    }

    #[tokio::test]
    async fn userset_grant_via_group_membership() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![
                tuple(
                    ("doc", "d1"),
                    "group_viewer",
                    SubjectRef::userset("group", "g", "member"),
                ),
                tuple(("group", "g"), "member", SubjectRef::entity("user", "alice")),
            ],
        )
        .await;
        let eval = evaluator(store);

        let d1 = Entity::new("doc", "d1");
        assert_eq!(
            eval.check(&ctx(), &SubjectRef::entity("user", "alice"), "view", &d1)
                .await
                .unwrap(),
            Decision::Allow
        );
        assert_eq!(
            eval.check(&ctx(), &SubjectRef::entity("user", "mallory"), "view", &d1)
                .await
                .unwrap(),
            Decision::Deny
        );

        let expanded = eval.expand(&ctx(), "view", &d1).await.unwrap();
        assert_eq!(
            expanded.into_iter().collect::<Vec<_>>(),
            vec![SubjectRef::entity("user", "alice")]
        );

        let subjects = eval.lookup_subjects(&ctx(), "view", &d1).await.unwrap();
        assert_eq!(subjects.len(), 1);
    }

    #[tokio::test]
    async fn inheritance_via_tuple_to_userset() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![
                tuple(("doc", "d2"), "parent", SubjectRef::entity("folder", "f")),
                tuple(
                    ("folder", "f"),
                    "direct_viewer",
                    SubjectRef::entity("user", "alice"),
                ),
            ],
        )
        .await;
        let eval = evaluator(store.clone());

        let alice = SubjectRef::entity("user", "alice");
        let d2 = Entity::new("doc", "d2");
        assert_eq!(
            eval.check(&ctx(), &alice, "view", &d2).await.unwrap(),
            Decision::Allow
        );

        // Revoking the folder grant revokes the inherited view.
        store
            .write(
                "t1",
                vec![],
                vec![tuple(
                    ("folder", "f"),
                    "direct_viewer",
                    SubjectRef::entity("user", "alice"),
                )
                .key()],
            )
            .await
            .unwrap();
        assert_eq!(
            eval.check(&ctx(), &alice, "view", &d2).await.unwrap(),
            Decision::Deny
        );
    }

    #[tokio::test]
    async fn arrow_skips_types_missing_from_the_registry() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![tuple(
                ("doc", "d3"),
                "parent",
                SubjectRef::entity("vault", "v1"),
            )],
        )
        .await;
        let eval = evaluator(store);
        let verdict = eval
            .check(
                &ctx(),
                &SubjectRef::entity("user", "alice"),
                "view",
                &Entity::new("doc", "d3"),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Decision::Deny);
    }

    #[tokio::test]
    async fn intersection_requires_every_branch() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![
                tuple(("doc", "d4"), "direct_editor", SubjectRef::entity("user", "alice")),
                tuple(("doc", "d4"), "direct_viewer", SubjectRef::entity("user", "alice")),
                tuple(("doc", "d4"), "direct_editor", SubjectRef::entity("user", "bob")),
            ],
        )
        .await;
        let eval = evaluator(store);
        let d4 = Entity::new("doc", "d4");

        assert_eq!(
            eval.check(&ctx(), &SubjectRef::entity("user", "alice"), "edit_and_view", &d4)
                .await
                .unwrap(),
            Decision::Allow
        );
        assert_eq!(
            eval.check(&ctx(), &SubjectRef::entity("user", "bob"), "edit_and_view", &d4)
                .await
                .unwrap(),
            Decision::Deny
        );

        let expanded = eval.expand(&ctx(), "edit_and_view", &d4).await.unwrap();
        assert_eq!(
            expanded.into_iter().collect::<Vec<_>>(),
            vec![SubjectRef::entity("user", "alice")]
        );
    }

    #[tokio::test]
    async fn exclusion_denies_when_excluded_branch_allows() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![
                tuple(("doc", "d5"), "direct_viewer", SubjectRef::entity("user", "alice")),
                tuple(("doc", "d5"), "direct_viewer", SubjectRef::entity("user", "eve")),
                tuple(("doc", "d5"), "banned", SubjectRef::entity("user", "eve")),
            ],
        )
        .await;
        let eval = evaluator(store);
        let d5 = Entity::new("doc", "d5");

        assert_eq!(
            eval.check(&ctx(), &SubjectRef::entity("user", "alice"), "view_unless_banned", &d5)
                .await
                .unwrap(),
            Decision::Allow
        );
        assert_eq!(
            eval.check(&ctx(), &SubjectRef::entity("user", "eve"), "view_unless_banned", &d5)
                .await
                .unwrap(),
            Decision::Deny
        );

        let expanded = eval.expand(&ctx(), "view_unless_banned", &d5).await.unwrap();
        assert_eq!(
            expanded.into_iter().collect::<Vec<_>>(),
            vec![SubjectRef::entity("user", "alice")]
        );
    }

    #[tokio::test]
    async fn membership_cycles_terminate() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![
                // g1.member includes g2's members and vice versa.
                tuple(("group", "g1"), "member", SubjectRef::userset("group", "g2", "member")),
                tuple(("group", "g2"), "member", SubjectRef::userset("group", "g1", "member")),
                tuple(("doc", "d6"), "group_viewer", SubjectRef::userset("group", "g1", "member")),
            ],
        )
        .await;
        let eval = evaluator(store);

        let verdict = eval
            .check(
                &ctx(),
                &SubjectRef::entity("user", "alice"),
                "view",
                &Entity::new("doc", "d6"),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Decision::Deny);
    }

    #[tokio::test]
    async fn self_grant_is_honored_when_the_namespace_permits() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![tuple(("doc", "d7"), "direct_viewer", SubjectRef::entity("doc", "d7"))],
        )
        .await;
        let eval = evaluator(store);
        let verdict = eval
            .check(
                &ctx(),
                &SubjectRef::entity("doc", "d7"),
                "view",
                &Entity::new("doc", "d7"),
            )
            .await
            .unwrap();
        assert_eq!(verdict, Decision::Allow);
    }

    fn nested_group_tuples(levels: usize) -> Vec<RelationTuple> {
        // doc.group_viewer -> g0#member, g0.member -> g1#member, ...,
        // g{levels-1}.member -> alice
        let mut tuples = vec![tuple(
            ("doc", "deep"),
            "group_viewer",
            SubjectRef::userset("group", "g0", "member"),
        )];
        for i in 0..levels.saturating_sub(1) {
            tuples.push(tuple(
                ("group", &format!("g{}", i)),
                "member",
                SubjectRef::userset("group", &format!("g{}", i + 1), "member"),
            ));
        }
        tuples.push(tuple(
            ("group", &format!("g{}", levels.saturating_sub(1))),
            "member",
            SubjectRef::entity("user", "alice"),
        ));
        tuples
    }

    #[tokio::test]
    async fn depth_at_the_bound_succeeds_and_beyond_errors() {
        // The chain costs one hop into group_viewer plus one per nesting
        // level, so 4 levels resolve at depth 5.
        let store = Arc::new(MemoryTupleStore::new());
        seed(&store, nested_group_tuples(4)).await;

        let alice = SubjectRef::entity("user", "alice");
        let deep = Entity::new("doc", "deep");

        let at_bound = evaluator_with_depth(store.clone(), 5);
        assert_eq!(
            at_bound.check(&ctx(), &alice, "view", &deep).await.unwrap(),
            Decision::Allow
        );

        let below_bound = evaluator_with_depth(store.clone(), 4);
        let err = below_bound
            .check(&ctx(), &alice, "view", &deep)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::DepthExceeded { max_depth: 4 }));
    }

    #[tokio::test]
    async fn caveats_gate_single_tuples() {
        let store = Arc::new(MemoryTupleStore::new());
        let caveated = tuple(("doc", "d8"), "direct_viewer", SubjectRef::entity("user", "alice"))
            .with_caveat(Caveat::new(
                "from_office",
                CaveatExpr::Eq {
                    field: "network".to_string(),
                    value: json!("office"),
                },
            ));
        seed(&store, vec![caveated]).await;
        let eval = evaluator(store);

        let alice = SubjectRef::entity("user", "alice");
        let d8 = Entity::new("doc", "d8");

        let satisfied = RequestContext::new("t1").with_caveat_var("network", json!("office"));
        assert_eq!(
            eval.check(&satisfied, &alice, "view", &d8).await.unwrap(),
            Decision::Allow
        );

        let unsatisfied = RequestContext::new("t1").with_caveat_var("network", json!("vpn"));
        assert_eq!(
            eval.check(&unsatisfied, &alice, "view", &d8).await.unwrap(),
            Decision::Deny
        );

        // Missing variable denies the tuple, not the request.
        assert_eq!(
            eval.check(&ctx(), &alice, "view", &d8).await.unwrap(),
            Decision::Deny
        );
    }

    #[tokio::test]
    async fn uncaveated_grant_wins_over_caveated_twin() {
        let store = Arc::new(MemoryTupleStore::new());
        let caveated = tuple(("doc", "d9"), "direct_viewer", SubjectRef::entity("user", "alice"))
            .with_caveat(Caveat::new(
                "never",
                CaveatExpr::Eq {
                    field: "missing".to_string(),
                    value: json!(true),
                },
            ));
        // Same grantee through a group, without any caveat.
        seed(
            &store,
            vec![
                caveated,
                tuple(("doc", "d9"), "group_viewer", SubjectRef::userset("group", "g", "member")),
                tuple(("group", "g"), "member", SubjectRef::entity("user", "alice")),
            ],
        )
        .await;
        let eval = evaluator(store);
        assert_eq!(
            eval.check(
                &ctx(),
                &SubjectRef::entity("user", "alice"),
                "view",
                &Entity::new("doc", "d9"),
            )
            .await
            .unwrap(),
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn cancellation_wins_over_any_verdict() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![tuple(("doc", "d10"), "direct_viewer", SubjectRef::entity("user", "alice"))],
        )
        .await;
        let eval = evaluator(store);

        let cancelled = RequestContext::new("t1");
        cancelled.cancellation.cancel();
        let err = eval
            .check(
                &cancelled,
                &SubjectRef::entity("user", "alice"),
                "view",
                &Entity::new("doc", "d10"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Cancelled));
    }

    #[tokio::test]
    async fn lookup_resources_covers_direct_userset_and_inherited_grants() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![
                tuple(("doc", "direct"), "direct_viewer", SubjectRef::entity("user", "alice")),
                tuple(("doc", "via_group"), "group_viewer", SubjectRef::userset("group", "g", "member")),
                tuple(("group", "g"), "member", SubjectRef::entity("user", "alice")),
                tuple(("doc", "child"), "parent", SubjectRef::entity("folder", "f")),
                tuple(("folder", "f"), "direct_viewer", SubjectRef::entity("user", "alice")),
                tuple(("doc", "other"), "direct_viewer", SubjectRef::entity("user", "bob")),
            ],
        )
        .await;
        let eval = evaluator(store);

        let ids = eval
            .lookup_resources(&ctx(), &SubjectRef::entity("user", "alice"), "view", "doc")
            .await
            .unwrap();
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec![
                "child".to_string(),
                "direct".to_string(),
                "via_group".to_string(),
            ]
        );

        let bob_ids = eval
            .lookup_resources(&ctx(), &SubjectRef::entity("user", "bob"), "view", "doc")
            .await
            .unwrap();
        assert_eq!(bob_ids.into_iter().collect::<Vec<_>>(), vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn check_is_pure_given_a_fixed_store() {
        let store = Arc::new(MemoryTupleStore::new());
        seed(
            &store,
            vec![tuple(("doc", "p"), "direct_viewer", SubjectRef::entity("user", "alice"))],
        )
        .await;
        let eval = evaluator(store);
        let alice = SubjectRef::entity("user", "alice");
        let object = Entity::new("doc", "p");

        let ctx_val = ctx();
        let (a, b) = tokio::join!(
            eval.check(&ctx_val, &alice, "view", &object),
            eval.check(&ctx_val, &alice, "view", &object),
        );
        assert_eq!(a.unwrap(), b.unwrap());
    }
}
