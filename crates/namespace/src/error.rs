use thiserror::Error;

pub type Result<T> = std::result::Result<T, NamespaceError>;

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("duplicate namespace definition for object type: {0}")]
    DuplicateType(String),

    #[error("{object_type}.{permission} references undefined relation: {relation}")]
    UnknownRelation {
        object_type: String,
        permission: String,
        relation: String,
    },

    #[error("rewrite cycle on object type {object_type}: {path}")]
    RewriteCycle { object_type: String, path: String },

    #[error("invalid namespace document: {0}")]
    InvalidDocument(String),
}
