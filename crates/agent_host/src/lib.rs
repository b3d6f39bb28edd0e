//! Agent Host - conversation orchestration
//!
//! Connects the session and settings stores to the completion client:
//! - Builds request messages from stored history and attachments
//! - Streams replies into the conversation, one turn at a time
//! - Regenerates, stops and deletes turns

pub mod context;
pub mod orchestrator;

pub use context::to_chat_messages;
pub use orchestrator::{Orchestrator, TurnError, TurnOutcome, TurnStatus};
