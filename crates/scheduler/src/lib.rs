pub mod job;
pub mod service;

pub use job::{next_fire, CronJob, JobStore, OutputRing, RunState};
pub use service::{is_silent, CronService};
