pub mod format;
pub mod telegram;
pub mod transcribe;

pub use telegram::{TelegramChannel, TelegramEgress};
pub use transcribe::CommandTranscriber;
