//! Testing utilities and mock implementations
//!
//! This module provides an in-memory broker for exercising the connection
//! supervisor without a running AMQP server.

pub mod mocks;

pub use mocks::*;
