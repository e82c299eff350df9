pub mod commands;
pub mod dispatch;
pub mod exec;
pub mod memory_service;
pub mod queue;
pub mod reaper;
pub mod runner;
pub mod settings;
pub mod tasks;
pub mod tracker;
pub mod traits;

pub use dispatch::Dispatcher;
pub use memory_service::MemoryService;
pub use queue::TopicQueue;
pub use reaper::MediaReaper;
pub use runner::{AgentRunner, ChatRun};
pub use settings::{OverrideStore, SettingsStore};
pub use tasks::{BackgroundTasks, TaskEntry, TaskStatus};
pub use tracker::{TokenEvent, TokenTracker, TrackerStats};
pub use traits::{CronControl, Egress, Transcriber};
