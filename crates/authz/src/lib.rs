// The authorization engine: graph evaluator over the tuple store and
// namespace registry, fronted by the decision cache, bitmap index,
// consistency manager and circuit breaker.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;

pub use config::{EngineConfig, ZookieConfig};
pub use context::RequestContext;
pub use engine::{AuthzEngine, CheckOutcome, ExpandOutcome, LookupResourcesOutcome};
pub use error::{AuthzError, Result};
pub use evaluator::{EvaluatorConfig, GraphEvaluator};

// Commonly used model types, re-exported for embedders.
pub use warden_models::{
    Caveat, CaveatContext, CaveatExpr, ConsistencyMode, Decision, Entity, EngineEvent, EventSink,
    NoopEventSink, RelationTuple, Revision, SubjectRef, TracingEventSink, TupleFilter, TupleKey,
};
pub use warden_namespace::{NamespaceDef, NamespaceRegistry, RewriteExpr, SharedRegistry};
