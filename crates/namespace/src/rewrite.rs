use serde::{Deserialize, Serialize};

/// How a permission is computed from tuples and other permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteExpr {
    /// The direct tuples stored under the name being evaluated.
    This,

    /// Alias for another relation or permission on the same object.
    ComputedUserset(String),

    /// Walk the tupleset relation on this object; for each target object,
    /// evaluate the computed userset there. This is how `parent -> viewer`
    /// inheritance is expressed.
    TupleToUserset {
        tupleset: String,
        computed_userset: String,
    },

    /// Satisfied if any child is satisfied.
    Union(Vec<RewriteExpr>),

    /// Satisfied only if every child is satisfied.
    Intersection(Vec<RewriteExpr>),

    /// Satisfied if `include` is satisfied and `exclude` is not.
    Exclusion {
        include: Box<RewriteExpr>,
        exclude: Box<RewriteExpr>,
    },
}

impl RewriteExpr {
    pub fn computed(relation: &str) -> Self {
        RewriteExpr::ComputedUserset(relation.to_string())
    }

    pub fn union(children: Vec<RewriteExpr>) -> Self {
        RewriteExpr::Union(children)
    }

    pub fn intersection(children: Vec<RewriteExpr>) -> Self {
        RewriteExpr::Intersection(children)
    }

    pub fn arrow(tupleset: &str, computed_userset: &str) -> Self {
        RewriteExpr::TupleToUserset {
            tupleset: tupleset.to_string(),
            computed_userset: computed_userset.to_string(),
        }
    }

    pub fn exclusion(include: RewriteExpr, exclude: RewriteExpr) -> Self {
        RewriteExpr::Exclusion {
            include: Box::new(include),
            exclude: Box::new(exclude),
        }
    }

    /// Names on the *same* object type this expression refers to.
    ///
    /// Tuple-to-userset targets live on other objects and are excluded;
    /// its tupleset relation is local and included.
    pub fn local_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_local_references(&mut out);
        out
    }

    fn collect_local_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RewriteExpr::This => {}
            RewriteExpr::ComputedUserset(name) => out.push(name),
            RewriteExpr::TupleToUserset { tupleset, .. } => out.push(tupleset),
            RewriteExpr::Union(children) | RewriteExpr::Intersection(children) => {
                for child in children {
                    child.collect_local_references(out);
                }
            }
            RewriteExpr::Exclusion { include, exclude } => {
                include.collect_local_references(out);
                exclude.collect_local_references(out);
            }
        }
    }

    /// Local names through which a new tuple can only ever *add* access:
    /// computed-userset aliases reachable purely through unions. Names
    /// under intersection or exclusion are excluded, since a tuple there
    /// may restrict instead of grant.
    pub fn additive_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_additive_references(&mut out);
        out
    }

    fn collect_additive_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RewriteExpr::This
            | RewriteExpr::TupleToUserset { .. }
            | RewriteExpr::Intersection(_)
            | RewriteExpr::Exclusion { .. } => {}
            RewriteExpr::ComputedUserset(name) => out.push(name),
            RewriteExpr::Union(children) => {
                for child in children {
                    child.collect_additive_references(out);
                }
            }
        }
    }

    /// Local names that feed back into permission evaluation, i.e. the
    /// edges used for cycle detection. Tuple-to-userset is ignored
    /// entirely here: its evaluation always moves to a different object.
    pub fn rewrite_edges(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_rewrite_edges(&mut out);
        out
    }

    fn collect_rewrite_edges<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RewriteExpr::This | RewriteExpr::TupleToUserset { .. } => {}
            RewriteExpr::ComputedUserset(name) => out.push(name),
            RewriteExpr::Union(children) | RewriteExpr::Intersection(children) => {
                for child in children {
                    child.collect_rewrite_edges(out);
                }
            }
            RewriteExpr::Exclusion { include, exclude } => {
                include.collect_rewrite_edges(out);
                exclude.collect_rewrite_edges(out);
            }
        }
    }
}
