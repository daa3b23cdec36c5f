use dashmap::DashMap;

/// Assigns a stable int64 to each `(tenant, resource_type, resource_id)` on
/// first use, with a reverse map for result materialization.
///
/// Reads are lock-free; only first-time assignment takes the shard lock.
#[derive(Default)]
pub struct ResourceIdMap {
    forward: DashMap<(String, String, String), i64>,
    reverse: DashMap<(String, i64), (String, String)>,
    counters: DashMap<String, i64>,
}

impl ResourceIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &str, resource_type: &str, resource_id: &str) -> Option<i64> {
        self.forward
            .get(&(
                tenant_id.to_string(),
                resource_type.to_string(),
                resource_id.to_string(),
            ))
            .map(|id| *id)
    }

    pub fn get_or_assign(&self, tenant_id: &str, resource_type: &str, resource_id: &str) -> i64 {
        let key = (
            tenant_id.to_string(),
            resource_type.to_string(),
            resource_id.to_string(),
        );
        if let Some(existing) = self.forward.get(&key) {
            return *existing;
        }

        let assigned = *self
            .forward
            .entry(key)
            .or_insert_with(|| self.next_id(tenant_id));
        self.reverse.insert(
            (tenant_id.to_string(), assigned),
            (resource_type.to_string(), resource_id.to_string()),
        );
        assigned
    }

    /// Reverse lookup: int id back to `(resource_type, resource_id)`.
    pub fn resolve(&self, tenant_id: &str, int_id: i64) -> Option<(String, String)> {
        self.reverse
            .get(&(tenant_id.to_string(), int_id))
            .map(|v| v.clone())
    }

    /// Materialize a set of int ids back into string ids, dropping ids of a
    /// different resource type.
    pub fn resolve_ids(
        &self,
        tenant_id: &str,
        resource_type: &str,
        int_ids: impl IntoIterator<Item = i64>,
    ) -> Vec<String> {
        int_ids
            .into_iter()
            .filter_map(|id| self.resolve(tenant_id, id))
            .filter(|(t, _)| t == resource_type)
            .map(|(_, id)| id)
            .collect()
    }

    fn next_id(&self, tenant_id: &str) -> i64 {
        let mut counter = self.counters.entry(tenant_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_per_tenant() {
        let map = ResourceIdMap::new();
        let a = map.get_or_assign("t1", "doc", "readme");
        let b = map.get_or_assign("t1", "doc", "guide");
        let a_again = map.get_or_assign("t1", "doc", "readme");
        assert_eq!(a, a_again);
        assert_ne!(a, b);

        // Counters are tenant-local; another tenant restarts from 1.
        let other = map.get_or_assign("t2", "doc", "readme");
        assert_eq!(other, 1);
    }

    #[test]
    fn reverse_lookup_roundtrip() {
        let map = ResourceIdMap::new();
        let id = map.get_or_assign("t1", "doc", "readme");
        assert_eq!(
            map.resolve("t1", id),
            Some(("doc".to_string(), "readme".to_string()))
        );
        assert_eq!(map.resolve("t1", id + 999), None);
    }

    #[test]
    fn resolve_ids_filters_by_type() {
        let map = ResourceIdMap::new();
        let doc = map.get_or_assign("t1", "doc", "readme");
        let folder = map.get_or_assign("t1", "folder", "root");
        let resolved = map.resolve_ids("t1", "doc", vec![doc, folder]);
        assert_eq!(resolved, vec!["readme".to_string()]);
    }

    #[test]
    fn concurrent_assignment_yields_one_id() {
        let map = std::sync::Arc::new(ResourceIdMap::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                map.get_or_assign("t1", "doc", "shared")
            }));
        }
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
