// Core data model shared by every Warden crate.

pub mod caveat;
pub mod consistency;
pub mod entity;
pub mod events;
pub mod tuple;

pub use caveat::{Caveat, CaveatContext, CaveatError, CaveatExpr};
pub use consistency::{ConsistencyMode, Decision, Revision};
pub use entity::{Entity, SubjectRef};
pub use events::{EngineEvent, EventSink, NoopEventSink, TracingEventSink};
pub use tuple::{RelationTuple, SubjectSelector, TupleFilter, TupleKey};
