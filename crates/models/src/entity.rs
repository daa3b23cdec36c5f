use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

/// A typed entity reference, e.g. `user:alice` or `doc:readme`.
///
/// Entities are not stored on their own; they exist exactly as long as some
/// relation tuple mentions them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Validate)]
pub struct Entity {
    #[validate(length(min = 1))]
    pub entity_type: String,
    #[validate(length(min = 1))]
    pub entity_id: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for Entity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((t, i)) if !t.is_empty() && !i.is_empty() => Ok(Entity::new(t, i)),
            _ => Err(format!("invalid entity reference: {}", s)),
        }
    }
}

/// The grantee side of a relation tuple.
///
/// Either a concrete entity (`user:alice`) or a userset reference
/// (`group:eng#member`, "every subject with `member` on `group:eng`").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Validate)]
pub struct SubjectRef {
    #[validate(nested)]
    pub entity: Entity,
    /// Non-empty for userset grants.
    #[validate(length(min = 1))]
    pub relation: Option<String>,
}

impl SubjectRef {
    pub fn entity(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity: Entity::new(entity_type, entity_id),
            relation: None,
        }
    }

    pub fn userset(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            entity: Entity::new(entity_type, entity_id),
            relation: Some(relation.into()),
        }
    }

    pub fn is_userset(&self) -> bool {
        self.relation.is_some()
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relation {
            Some(rel) => write!(f, "{}#{}", self.entity, rel),
            None => write!(f, "{}", self.entity),
        }
    }
}

impl FromStr for SubjectRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_part, relation) = match s.split_once('#') {
            Some((e, r)) if !r.is_empty() => (e, Some(r.to_string())),
            Some(_) => return Err(format!("invalid subject reference: {}", s)),
            None => (s, None),
        };
        let entity = Entity::from_str(entity_part)?;
        Ok(SubjectRef { entity, relation })
    }
}

impl From<Entity> for SubjectRef {
    fn from(entity: Entity) -> Self {
        SubjectRef {
            entity,
            relation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_display_and_parse() {
        let e = Entity::new("doc", "readme");
        assert_eq!(e.to_string(), "doc:readme");
        assert_eq!("doc:readme".parse::<Entity>().unwrap(), e);
    }

    #[test]
    fn entity_rejects_malformed() {
        assert!("doc".parse::<Entity>().is_err());
        assert!(":readme".parse::<Entity>().is_err());
        assert!("doc:".parse::<Entity>().is_err());
    }

    #[test]
    fn subject_roundtrip() {
        let concrete = SubjectRef::entity("user", "alice");
        assert_eq!(concrete.to_string(), "user:alice");
        assert_eq!("user:alice".parse::<SubjectRef>().unwrap(), concrete);
        assert!(!concrete.is_userset());

        let userset = SubjectRef::userset("group", "eng", "member");
        assert_eq!(userset.to_string(), "group:eng#member");
        assert_eq!("group:eng#member".parse::<SubjectRef>().unwrap(), userset);
        assert!(userset.is_userset());
    }

    #[test]
    fn subject_rejects_empty_relation() {
        assert!("group:eng#".parse::<SubjectRef>().is_err());
    }
}
