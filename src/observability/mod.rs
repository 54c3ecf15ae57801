//! Observability for the relay: structured logging via `tracing`

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, parse_span_events, LogFormat};

// Span macro for structured logging
pub use logging::broker_span;
