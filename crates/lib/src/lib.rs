//! Clawgate core library: chat channel adapters, webhook intake, per-conversation
//! dispatch to the reasoning backend, scheduler and heartbeat.

pub mod backend;
pub mod channels;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod heartbeat;
pub mod intake;
pub mod message;
pub mod prompt;
pub mod scheduler;
pub mod session;
pub mod skills;

pub use error::{GatewayError, Result};
pub use message::{Channel, Message, Origin};
