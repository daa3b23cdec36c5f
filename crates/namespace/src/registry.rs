use crate::error::{NamespaceError, Result};
use crate::rewrite::RewriteExpr;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

/// Rewrite schema for one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDef {
    pub object_type: String,
    /// Direct relation names tuples may be stored under.
    pub relations: BTreeSet<String>,
    /// Permission name -> rewrite expression.
    #[serde(default)]
    pub permissions: BTreeMap<String, RewriteExpr>,
    /// Relations allowed to reference subjects in another tenant.
    #[serde(default)]
    pub cross_tenant_relations: BTreeSet<String>,
}

impl NamespaceDef {
    pub fn new(object_type: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            relations: BTreeSet::new(),
            permissions: BTreeMap::new(),
            cross_tenant_relations: BTreeSet::new(),
        }
    }

    pub fn with_relation(mut self, relation: &str) -> Self {
        self.relations.insert(relation.to_string());
        self
    }

    pub fn with_permission(mut self, permission: &str, expr: RewriteExpr) -> Self {
        self.permissions.insert(permission.to_string(), expr);
        self
    }

    pub fn with_cross_tenant_relation(mut self, relation: &str) -> Self {
        self.cross_tenant_relations.insert(relation.to_string());
        self
    }

    /// A name is resolvable if it is a declared relation or a permission.
    pub fn defines(&self, name: &str) -> bool {
        self.relations.contains(name) || self.permissions.contains_key(name)
    }

    pub fn rewrite(&self, name: &str) -> Option<&RewriteExpr> {
        self.permissions.get(name)
    }

    pub fn allows_cross_tenant(&self, relation: &str) -> bool {
        self.cross_tenant_relations.contains(relation)
    }

    /// Permission names whose rewrite depends on `relation`, directly or
    /// through chains of computed usersets. Used to decide which
    /// materialized entries a tuple write can affect.
    pub fn permissions_referencing(&self, relation: &str) -> Vec<String> {
        self.closure_over(relation, RewriteExpr::local_references)
    }

    /// Permission names a tuple under `relation` can only ever widen:
    /// reached through union/computed chains alone. Safe targets for
    /// grant write-through into materialized sets.
    pub fn permissions_granting(&self, relation: &str) -> Vec<String> {
        self.closure_over(relation, RewriteExpr::additive_references)
    }

    fn closure_over(
        &self,
        relation: &str,
        references: impl Fn(&RewriteExpr) -> Vec<&str>,
    ) -> Vec<String> {
        let mut affected = BTreeSet::new();
        let mut changed = true;
        while changed {
            changed = false;
            for (name, expr) in &self.permissions {
                if affected.contains(name) {
                    continue;
                }
                let refs = references(expr);
                let hit = refs
                    .iter()
                    .any(|r| *r == relation || affected.contains(*r));
                if hit {
                    affected.insert(name.clone());
                    changed = true;
                }
            }
        }
        affected.into_iter().collect()
    }

    fn validate(&self) -> Result<()> {
        for (permission, expr) in &self.permissions {
            for reference in expr.local_references() {
                if !self.defines(reference) {
                    return Err(NamespaceError::UnknownRelation {
                        object_type: self.object_type.clone(),
                        permission: permission.clone(),
                        relation: reference.to_string(),
                    });
                }
            }
        }
        self.check_cycles()
    }

    fn check_cycles(&self) -> Result<()> {
        // DFS over permission -> permission edges; tuple-to-userset edges
        // are excluded because they always cross to another object.
        let mut done: BTreeSet<&str> = BTreeSet::new();
        for start in self.permissions.keys() {
            if done.contains(start.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut on_path: BTreeSet<&str> = BTreeSet::new();
            self.dfs(start, &mut path, &mut on_path, &mut done)?;
        }
        Ok(())
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        path: &mut Vec<&'a str>,
        on_path: &mut BTreeSet<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Result<()> {
        if done.contains(node) {
            return Ok(());
        }
        if on_path.contains(node) {
            let mut cycle: Vec<&str> = path.clone();
            cycle.push(node);
            return Err(NamespaceError::RewriteCycle {
                object_type: self.object_type.clone(),
                path: cycle.join(" -> "),
            });
        }
        on_path.insert(node);
        path.push(node);
        if let Some(expr) = self.permissions.get(node) {
            for next in expr.rewrite_edges() {
                if self.permissions.contains_key(next) {
                    self.dfs(next, path, on_path, done)?;
                }
            }
        }
        path.pop();
        on_path.remove(node);
        done.insert(node);
        Ok(())
    }
}

/// Serialized form of a registry; `load -> save -> reload` is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDocument {
    pub namespaces: Vec<NamespaceDef>,
}

/// Immutable set of namespace definitions, validated on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceRegistry {
    namespaces: BTreeMap<String, NamespaceDef>,
}

impl NamespaceRegistry {
    pub fn new(defs: Vec<NamespaceDef>) -> Result<Self> {
        let mut namespaces = BTreeMap::new();
        for def in defs {
            def.validate()?;
            let object_type = def.object_type.clone();
            if namespaces.insert(object_type.clone(), def).is_some() {
                return Err(NamespaceError::DuplicateType(object_type));
            }
        }
        Ok(Self { namespaces })
    }

    pub fn empty() -> Self {
        Self {
            namespaces: BTreeMap::new(),
        }
    }

    pub fn from_document(doc: NamespaceDocument) -> Result<Self> {
        Self::new(doc.namespaces)
    }

    pub fn to_document(&self) -> NamespaceDocument {
        NamespaceDocument {
            namespaces: self.namespaces.values().cloned().collect(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: NamespaceDocument = serde_json::from_str(raw)
            .map_err(|e| NamespaceError::InvalidDocument(e.to_string()))?;
        Self::from_document(doc)
    }

    pub fn get(&self, object_type: &str) -> Option<&NamespaceDef> {
        self.namespaces.get(object_type)
    }

    pub fn contains_type(&self, object_type: &str) -> bool {
        self.namespaces.contains_key(object_type)
    }

    pub fn relation_exists(&self, object_type: &str, relation: &str) -> bool {
        self.get(object_type)
            .map(|def| def.defines(relation))
            .unwrap_or(false)
    }

    pub fn rewrite(&self, object_type: &str, name: &str) -> Option<&RewriteExpr> {
        self.get(object_type).and_then(|def| def.rewrite(name))
    }

    pub fn allows_cross_tenant(&self, object_type: &str, relation: &str) -> bool {
        self.get(object_type)
            .map(|def| def.allows_cross_tenant(relation))
            .unwrap_or(false)
    }
}

/// Handle to the active registry. Reload replaces the whole registry in one
/// pointer swap; readers clone an `Arc` and never observe a partial update.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Arc<NamespaceRegistry>>>,
}

impl SharedRegistry {
    pub fn new(registry: NamespaceRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn load(&self) -> Arc<NamespaceRegistry> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, registry: NamespaceRegistry) {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::new(registry);
        tracing::info!("namespace registry replaced");
    }
}
