// Materialized permission bitmaps: per-(subject, permission, resource type)
// Roaring sets of resource ids, kept fresh by a background update queue.

pub mod config;
pub mod error;
pub mod index;
pub mod queue;
pub mod resource_map;
pub mod worker;

pub use config::BitmapConfig;
pub use error::{BitmapError, Result};
pub use index::{BitmapIndex, BitmapKey};
pub use queue::{EnqueueOutcome, FailOutcome, JobStatus, UpdateJob, UpdateQueue};
pub use resource_map::ResourceIdMap;
pub use worker::{ResourceResolver, WorkerPool};
