pub mod memory;
pub mod threads;
pub mod usage;

pub use memory::{
    CurationReport, EventKind, EventRole, MemoryEvent, MemoryStore, RetrieveQuery, ScoredEvent,
};
pub use threads::{ResolvedThread, ThreadStore};
pub use usage::{today, Bucket, UsageState, UsageStore};
