use crate::error::{Result, StoreError};
use crate::store::TupleStore;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use warden_models::{RelationTuple, Revision, TupleFilter, TupleKey};

#[derive(Default)]
struct TenantShard {
    tuples: BTreeMap<TupleKey, RelationTuple>,
    revision: Revision,
}

/// In-memory tuple store. One shard per tenant; the shard mutex serializes
/// writers so revision allocation stays totally ordered per tenant.
#[derive(Default)]
pub struct MemoryTupleStore {
    shards: DashMap<String, Arc<Mutex<TenantShard>>>,
}

impl MemoryTupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, tenant_id: &str) -> Arc<Mutex<TenantShard>> {
        self.shards
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TenantShard::default())))
            .clone()
    }
}

#[async_trait]
impl TupleStore for MemoryTupleStore {
    async fn write(
        &self,
        tenant_id: &str,
        adds: Vec<RelationTuple>,
        removes: Vec<TupleKey>,
    ) -> Result<Revision> {
        for tuple in &adds {
            if tuple.tenant_id != tenant_id {
                return Err(StoreError::InvalidRequest(format!(
                    "tuple tenant {} does not match write tenant {}",
                    tuple.tenant_id, tenant_id
                )));
            }
        }

        let shard = self.shard(tenant_id);
        let mut shard = shard.lock().await;
        let mut changed = false;

        for key in &removes {
            if shard.tuples.remove(key).is_some() {
                changed = true;
            }
        }
        for tuple in adds {
            let key = tuple.key();
            let unchanged = shard
                .tuples
                .get(&key)
                .is_some_and(|existing| existing.caveat == tuple.caveat);
            if !unchanged {
                shard.tuples.insert(key, tuple);
                changed = true;
            }
        }

        if changed {
            shard.revision += 1;
        }
        Ok(shard.revision)
    }

    async fn read(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Vec<RelationTuple>> {
        let Some(shard) = self.shards.get(tenant_id).map(|s| s.clone()) else {
            return Ok(Vec::new());
        };
        let shard = shard.lock().await;
        Ok(shard
            .tuples
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn delete_by_filter(&self, tenant_id: &str, filter: &TupleFilter) -> Result<Revision> {
        let shard = self.shard(tenant_id);
        let mut shard = shard.lock().await;
        let doomed: Vec<TupleKey> = shard
            .tuples
            .values()
            .filter(|t| filter.matches(t))
            .map(|t| t.key())
            .collect();
        if !doomed.is_empty() {
            for key in &doomed {
                shard.tuples.remove(key);
            }
            shard.revision += 1;
        }
        Ok(shard.revision)
    }

    async fn current_revision(&self, tenant_id: &str) -> Result<Revision> {
        let Some(shard) = self.shards.get(tenant_id).map(|s| s.clone()) else {
            return Ok(0);
        };
        let shard = shard.lock().await;
        Ok(shard.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_models::{Entity, SubjectRef};

    fn tuple(tenant: &str, object_id: &str, relation: &str, subject_id: &str) -> RelationTuple {
        RelationTuple::new(
            tenant,
            Entity::new("doc", object_id),
            relation,
            SubjectRef::entity("user", subject_id),
        )
    }

    #[tokio::test]
    async fn revisions_are_monotonic_per_tenant() {
        let store = MemoryTupleStore::new();
        let r1 = store
            .write("t1", vec![tuple("t1", "a", "direct_viewer", "alice")], vec![])
            .await
            .unwrap();
        let r2 = store
            .write("t1", vec![tuple("t1", "b", "direct_viewer", "alice")], vec![])
            .await
            .unwrap();
        assert_eq!((r1, r2), (1, 2));
        assert_eq!(store.current_revision("t1").await.unwrap(), 2);
        assert_eq!(store.current_revision("t2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn noop_write_keeps_revision() {
        let store = MemoryTupleStore::new();
        let t = tuple("t1", "a", "direct_viewer", "alice");
        let r1 = store.write("t1", vec![t.clone()], vec![]).await.unwrap();
        let r2 = store.write("t1", vec![t.clone()], vec![]).await.unwrap();
        assert_eq!(r1, r2);

        let r3 = store.write("t1", vec![], vec![tuple("t1", "zz", "x", "y").key()]).await.unwrap();
        assert_eq!(r3, r2);
    }

    #[tokio::test]
    async fn write_rejects_foreign_tenant_tuples() {
        let store = MemoryTupleStore::new();
        let err = store
            .write("t1", vec![tuple("t2", "a", "direct_viewer", "alice")], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn remove_then_readd_advances_revision() {
        let store = MemoryTupleStore::new();
        let t = tuple("t1", "a", "direct_viewer", "alice");
        store.write("t1", vec![t.clone()], vec![]).await.unwrap();
        let r2 = store.write("t1", vec![], vec![t.key()]).await.unwrap();
        assert_eq!(r2, 2);
        assert!(store
            .read("t1", &TupleFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reverse_lookup_and_tupleset_walk() {
        let store = MemoryTupleStore::new();
        store
            .write(
                "t1",
                vec![
                    tuple("t1", "d1", "direct_viewer", "alice"),
                    tuple("t1", "d2", "direct_viewer", "alice"),
                    tuple("t1", "d2", "direct_viewer", "bob"),
                    RelationTuple::new(
                        "t1",
                        Entity::new("doc", "d1"),
                        "parent",
                        SubjectRef::entity("folder", "f1"),
                    ),
                ],
                vec![],
            )
            .await
            .unwrap();

        let alice = SubjectRef::entity("user", "alice");
        let mut docs = store
            .find_objects_for_subject("t1", &alice, "direct_viewer", "doc")
            .await
            .unwrap();
        docs.sort();
        assert_eq!(docs, vec!["d1".to_string(), "d2".to_string()]);

        let parents = store
            .find_related_objects("t1", &Entity::new("doc", "d1"), "parent")
            .await
            .unwrap();
        assert_eq!(parents, vec![Entity::new("folder", "f1")]);

        let direct = store
            .get_direct_subjects("t1", &Entity::new("doc", "d2"), "direct_viewer")
            .await
            .unwrap();
        assert_eq!(direct.len(), 2);
    }

    #[tokio::test]
    async fn delete_by_filter_removes_matches_only() {
        let store = MemoryTupleStore::new();
        store
            .write(
                "t1",
                vec![
                    tuple("t1", "d1", "direct_viewer", "alice"),
                    tuple("t1", "d1", "direct_owner", "bob"),
                ],
                vec![],
            )
            .await
            .unwrap();

        let filter = TupleFilter::for_object(&Entity::new("doc", "d1")).relation("direct_viewer");
        let rev = store.delete_by_filter("t1", &filter).await.unwrap();
        assert_eq!(rev, 2);

        let rest = store.read("t1", &TupleFilter::default()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].relation, "direct_owner");
    }
}
