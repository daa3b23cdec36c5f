// Namespace registry: per-object-type rewrite schemas, validated at load.

pub mod error;
pub mod registry;
pub mod rewrite;

pub use error::{NamespaceError, Result};
pub use registry::{NamespaceDef, NamespaceDocument, NamespaceRegistry, SharedRegistry};
pub use rewrite::RewriteExpr;
