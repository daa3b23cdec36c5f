use crate::error::Result;
use async_trait::async_trait;
use warden_models::{
    Entity, RelationTuple, Revision, SubjectRef, SubjectSelector, TupleFilter, TupleKey,
};

/// Authoritative persistence of relation tuples plus the per-tenant revision
/// counter.
///
/// Writes within one call are atomic; concurrent writes to the same tenant
/// are serialized by the implementation so revisions form a total order per
/// tenant. Reads observe the last committed revision at the moment the read
/// begins. No ordering is guaranteed across tenants.
#[async_trait]
pub trait TupleStore: Send + Sync {
    /// Apply `adds` and `removes` atomically. Allocates and returns a new
    /// revision iff the effective tuple set changed; otherwise returns the
    /// current revision unchanged.
    async fn write(
        &self,
        tenant_id: &str,
        adds: Vec<RelationTuple>,
        removes: Vec<TupleKey>,
    ) -> Result<Revision>;

    /// All tuples matching the filter.
    async fn read(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Vec<RelationTuple>>;

    /// Remove every tuple matching the filter; returns the revision after
    /// the deletion (unchanged when nothing matched).
    async fn delete_by_filter(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Revision>;

    /// Last committed revision for the tenant; 0 when never written.
    async fn current_revision(&self, tenant_id: &str) -> Result<Revision>;

    /// Direct grantees of `relation` on `object`, concrete entities and
    /// userset references alike.
    async fn get_direct_subjects(
        &self,
        tenant_id: &str,
        object: &Entity,
        relation: &str,
    ) -> Result<Vec<RelationTuple>> {
        let filter = TupleFilter::for_object(object).relation(relation);
        self.read(tenant_id, &filter).await
    }

    /// Objects O' such that a tuple `(from_object, relation, O')` exists.
    /// This is the tupleset walk used by tuple-to-userset rewrites.
    async fn find_related_objects(
        &self,
        tenant_id: &str,
        from_object: &Entity,
        relation: &str,
    ) -> Result<Vec<Entity>> {
        let filter = TupleFilter::for_object(from_object).relation(relation);
        let tuples = self.read(tenant_id, &filter).await?;
        Ok(tuples.into_iter().map(|t| t.subject.entity).collect())
    }

    /// Reverse index: ids of `object_type` objects on which `subject` holds
    /// `relation` directly.
    async fn find_objects_for_subject(
        &self,
        tenant_id: &str,
        subject: &SubjectRef,
        relation: &str,
        object_type: &str,
    ) -> Result<Vec<String>> {
        let filter = TupleFilter {
            object_type: Some(object_type.to_string()),
            object_id: None,
            relation: Some(relation.to_string()),
            subject_type: Some(subject.entity.entity_type.clone()),
            subject_id: Some(subject.entity.entity_id.clone()),
            subject_kind: match &subject.relation {
                Some(rel) => SubjectSelector::Userset(rel.clone()),
                None => SubjectSelector::Concrete,
            },
        };
        let tuples = self.read(tenant_id, &filter).await?;
        Ok(tuples.into_iter().map(|t| t.object.entity_id).collect())
    }
}
