pub mod channel;
pub mod config;
pub mod content;
pub mod conversation;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod lead;
pub mod lock;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod sequencer;
pub mod store;
pub mod tenant;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{FollowupError, Result};
