//! Message types published through the relay

pub mod messages;

pub use messages::*;
