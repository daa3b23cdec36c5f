use crate::error::{BitmapError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use roaring::RoaringTreemap;
use std::fmt;
use warden_models::{Revision, SubjectRef};

/// Serialization format version prefixed to exported bitmaps.
const BITMAP_FORMAT_V1: u8 = 1;

/// Natural key of a materialized set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitmapKey {
    pub tenant_id: String,
    pub subject: SubjectRef,
    pub permission: String,
    pub resource_type: String,
}

impl BitmapKey {
    pub fn new(
        tenant_id: impl Into<String>,
        subject: SubjectRef,
        permission: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            subject,
            permission: permission.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl fmt::Display for BitmapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id, self.subject, self.permission, self.resource_type
        )
    }
}

#[derive(Debug, Clone)]
struct BitmapSlot {
    bitmap: RoaringTreemap,
    revision: Revision,
    stale: bool,
    updated_at: DateTime<Utc>,
}

/// In-memory materialized index. A key with no slot answers `unknown`;
/// callers fall back to the graph evaluator.
#[derive(Default)]
pub struct BitmapIndex {
    entries: DashMap<BitmapKey, BitmapSlot>,
}

impl BitmapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) membership probe. `None` means unknown: no fresh-enough
    /// materialized set exists for the key.
    pub fn check_access(
        &self,
        key: &BitmapKey,
        resource_int: i64,
        min_revision: Option<Revision>,
    ) -> Option<bool> {
        self.check_access_with_revision(key, resource_int, min_revision)
            .map(|(allowed, _)| allowed)
    }

    /// As [`BitmapIndex::check_access`], also returning the revision the
    /// answering set was materialized at.
    pub fn check_access_with_revision(
        &self,
        key: &BitmapKey,
        resource_int: i64,
        min_revision: Option<Revision>,
    ) -> Option<(bool, Revision)> {
        let slot = self.entries.get(key)?;
        if slot.stale {
            return None;
        }
        if let Some(min) = min_revision {
            if slot.revision < min {
                return None;
            }
        }
        Some((slot.bitmap.contains(resource_int as u64), slot.revision))
    }

    /// The full materialized set, if fresh enough.
    pub fn accessible_resources(
        &self,
        key: &BitmapKey,
        min_revision: Option<Revision>,
    ) -> Option<(RoaringTreemap, Revision)> {
        let slot = self.entries.get(key)?;
        if slot.stale {
            return None;
        }
        if let Some(min) = min_revision {
            if slot.revision < min {
                return None;
            }
        }
        Some((slot.bitmap.clone(), slot.revision))
    }

    /// Replace a key's set with a freshly recomputed one.
    pub fn store_full(&self, key: BitmapKey, bitmap: RoaringTreemap, revision: Revision) {
        self.entries.insert(
            key,
            BitmapSlot {
                bitmap,
                revision,
                stale: false,
                updated_at: Utc::now(),
            },
        );
    }

    /// Write-through for a single grant. Only mutates an existing
    /// materialized set; an absent key stays unknown until recomputed, so a
    /// partial set can never masquerade as the full answer.
    pub fn persist_grant(&self, key: &BitmapKey, resource_int: i64) -> bool {
        match self.entries.get_mut(key) {
            Some(mut slot) => {
                slot.bitmap.insert(resource_int as u64);
                slot.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Write-through for a single revocation.
    pub fn persist_revoke(&self, key: &BitmapKey, resource_int: i64) -> bool {
        match self.entries.get_mut(key) {
            Some(mut slot) => {
                slot.bitmap.remove(resource_int as u64);
                slot.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Mark a set stale so reads fall back to the evaluator until the next
    /// recompute lands. Used when the update queue cannot keep up.
    pub fn mark_stale(&self, key: &BitmapKey) {
        if let Some(mut slot) = self.entries.get_mut(key) {
            slot.stale = true;
        }
    }

    /// Drop entries matching the given fields; `None` matches everything.
    /// Returns how many entries were removed.
    pub fn invalidate(
        &self,
        tenant_id: Option<&str>,
        subject: Option<&SubjectRef>,
        permission: Option<&str>,
        resource_type: Option<&str>,
    ) -> usize {
        let doomed: Vec<BitmapKey> = self
            .entries
            .iter()
            .filter(|entry| {
                let key = entry.key();
                tenant_id.map_or(true, |t| key.tenant_id == t)
                    && subject.map_or(true, |s| &key.subject == s)
                    && permission.map_or(true, |p| key.permission == p)
                    && resource_type.map_or(true, |r| key.resource_type == r)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed.len()
    }

    /// Keys materialized for (tenant, permission, resource_type), i.e. the
    /// subjects whose sets a rewrite-affecting write may have changed.
    pub fn keys_for(&self, tenant_id: &str, permission: &str, resource_type: &str) -> Vec<BitmapKey> {
        self.entries
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.tenant_id == tenant_id
                    && key.permission == permission
                    && key.resource_type == resource_type
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Every key materialized for a tenant; the refresh set after a write.
    pub fn keys_for_tenant(&self, tenant_id: &str) -> Vec<BitmapKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// When a key's set was last touched (recompute or write-through).
    pub fn updated_at(&self, key: &BitmapKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|slot| slot.updated_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Versioned export for external storage.
    pub fn export(&self, key: &BitmapKey) -> Option<Result<(Vec<u8>, Revision)>> {
        let slot = self.entries.get(key)?;
        let mut buf = vec![BITMAP_FORMAT_V1];
        if let Err(err) = slot.bitmap.serialize_into(&mut buf) {
            return Some(Err(BitmapError::Serialization(err)));
        }
        Some(Ok((buf, slot.revision)))
    }

    /// Import a previously exported set.
    pub fn import(&self, key: BitmapKey, bytes: &[u8], revision: Revision) -> Result<()> {
        let (&version, body) = bytes
            .split_first()
            .ok_or(BitmapError::UnsupportedVersion(0))?;
        if version != BITMAP_FORMAT_V1 {
            return Err(BitmapError::UnsupportedVersion(version));
        }
        let bitmap = RoaringTreemap::deserialize_from(body)?;
        self.store_full(key, bitmap, revision);
        Ok(())
    }
}
