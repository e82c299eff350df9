pub mod config;
pub mod error;
pub mod event;
pub mod keys;
pub mod paths;

pub use config::{Config, Limits};
pub use error::{Error, Result};
pub use event::{InboundEvent, InboundKind, MediaKind, OutboundMessage, OutboundPayload};
pub use keys::{topic_key, ThreadKey, ROOT_TOPIC};
pub use paths::Paths;
