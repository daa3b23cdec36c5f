use crate::caveat::Caveat;
use crate::entity::{Entity, SubjectRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A single authorization fact: subject has `relation` on `object`.
///
/// Example: `user:alice` has `direct_viewer` on `doc:readme` in tenant `t1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RelationTuple {
    #[validate(length(min = 1))]
    pub tenant_id: String,
    #[validate(nested)]
    pub object: Entity,
    #[validate(length(min = 1))]
    pub relation: String,
    #[validate(nested)]
    pub subject: SubjectRef,
    /// Optional context-free condition evaluated at check time.
    #[validate(nested)]
    pub caveat: Option<Caveat>,
    pub created_at: DateTime<Utc>,
}

impl RelationTuple {
    pub fn new(
        tenant_id: impl Into<String>,
        object: Entity,
        relation: impl Into<String>,
        subject: SubjectRef,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            object,
            relation: relation.into(),
            subject,
            caveat: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.caveat = Some(caveat);
        self
    }

    pub fn key(&self) -> TupleKey {
        TupleKey {
            tenant_id: self.tenant_id.clone(),
            object_type: self.object.entity_type.clone(),
            object_id: self.object.entity_id.clone(),
            relation: self.relation.clone(),
            subject_type: self.subject.entity.entity_type.clone(),
            subject_id: self.subject.entity.entity_id.clone(),
            subject_relation: self.subject.relation.clone().unwrap_or_default(),
        }
    }
}

/// The unique key of a tuple. `subject_relation` is the empty string for
/// concrete subjects so the key stays totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Validate)]
pub struct TupleKey {
    #[validate(length(min = 1))]
    pub tenant_id: String,
    #[validate(length(min = 1))]
    pub object_type: String,
    #[validate(length(min = 1))]
    pub object_id: String,
    #[validate(length(min = 1))]
    pub relation: String,
    #[validate(length(min = 1))]
    pub subject_type: String,
    #[validate(length(min = 1))]
    pub subject_id: String,
    pub subject_relation: String,
}

impl TupleKey {
    pub fn subject(&self) -> SubjectRef {
        if self.subject_relation.is_empty() {
            SubjectRef::entity(self.subject_type.clone(), self.subject_id.clone())
        } else {
            SubjectRef::userset(
                self.subject_type.clone(),
                self.subject_id.clone(),
                self.subject_relation.clone(),
            )
        }
    }

    pub fn object(&self) -> Entity {
        Entity::new(self.object_type.clone(), self.object_id.clone())
    }
}

/// Narrows the subject side of a [`TupleFilter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectSelector {
    /// Concrete subjects and userset references alike.
    #[default]
    Any,
    /// Only concrete subjects (empty `subject_relation`).
    Concrete,
    /// Only userset references with this relation.
    Userset(String),
}

/// Field-wise tuple filter; unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TupleFilter {
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    #[serde(default)]
    pub subject_kind: SubjectSelector,
}

impl TupleFilter {
    pub fn for_object(object: &Entity) -> Self {
        Self {
            object_type: Some(object.entity_type.clone()),
            object_id: Some(object.entity_id.clone()),
            ..Default::default()
        }
    }

    pub fn relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        if let Some(t) = &self.object_type {
            if *t != tuple.object.entity_type {
                return false;
            }
        }
        if let Some(i) = &self.object_id {
            if *i != tuple.object.entity_id {
                return false;
            }
        }
        if let Some(r) = &self.relation {
            if *r != tuple.relation {
                return false;
            }
        }
        if let Some(t) = &self.subject_type {
            if *t != tuple.subject.entity.entity_type {
                return false;
            }
        }
        if let Some(i) = &self.subject_id {
            if *i != tuple.subject.entity.entity_id {
                return false;
            }
        }
        match &self.subject_kind {
            SubjectSelector::Any => true,
            SubjectSelector::Concrete => tuple.subject.relation.is_none(),
            SubjectSelector::Userset(rel) => tuple.subject.relation.as_deref() == Some(rel),
        }
    }
}
