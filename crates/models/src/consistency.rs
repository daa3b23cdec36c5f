use serde::{Deserialize, Serialize};

/// Per-tenant monotonic revision. Every successful write that changes the
/// tuple set advances it by one.
pub type Revision = i64;

/// An authorization verdict. Verdicts are data; errors travel separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn from_bool(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Per-request staleness selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Serve from caches freely; staleness bounded only by TTL.
    MinimizeLatency,
    /// Only results produced at or after this revision are acceptable.
    AtLeastAsFresh(Revision),
    /// Bypass all caches and read the authoritative store.
    FullyConsistent,
}

impl ConsistencyMode {
    /// The revision floor this mode imposes on cached entries, if any.
    pub fn min_revision(&self) -> Option<Revision> {
        match self {
            ConsistencyMode::AtLeastAsFresh(rev) => Some(*rev),
            _ => None,
        }
    }

    pub fn allows_cache_read(&self) -> bool {
        !matches!(self, ConsistencyMode::FullyConsistent)
    }
}

impl Default for ConsistencyMode {
    fn default() -> Self {
        ConsistencyMode::MinimizeLatency
    }
}
