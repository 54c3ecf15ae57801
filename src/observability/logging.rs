//! Subscriber setup for the relay's `tracing` output
//!
//! Settings come from the environment:
//!
//! | Variable     | Values                                  | Default |
//! |--------------|-----------------------------------------|---------|
//! | `LOG_LEVEL`  | `error`, `warn`, `info`, `debug`, `trace` | `info`  |
//! | `LOG_FORMAT` | `json`, `pretty`, `compact`             | `json`  |
//! | `LOG_SPANS`  | `true` to log span open/close           | off     |
//! | `RUST_LOG`   | full filter directive, replaces the above level | unset |
//!
//! The AMQP client crates are held at `warn` unless `RUST_LOG` says otherwise.
//! Broker URIs are only ever logged through [`crate::transport::amqp::redact_uri`]
//! or an [`Endpoint`](crate::transport::amqp::Endpoint)'s Display.
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=debug amqp-relay run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const NOISY_DEPENDENCIES: [&str; 4] = [
    "lapin=warn",
    "amq_protocol=warn",
    "pinky_swear=warn",
    "tokio=warn",
];

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    Pretty,
    /// Single-line colored output without targets
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Install the global subscriber
///
/// Panics if a global subscriber is already set, like `SubscriberInitExt::init`.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => level_filter(level),
    };
    let spans = span_events(include_spans);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(spans))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .init(),
    }
}

/// Install the global subscriber from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    let var = |name: &str| env::var(name).unwrap_or_default();

    init_logging(
        parse_level(&var("LOG_LEVEL")),
        LogFormat::parse(&var("LOG_FORMAT")),
        parse_span_events(&var("LOG_SPANS")),
    );
}

/// Parse a `LOG_LEVEL` value, falling back to INFO
pub fn parse_level(value: &str) -> Level {
    match value.trim().to_ascii_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Parse a `LOG_SPANS` value; only `true` in any case enables span events
pub fn parse_span_events(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn level_filter(level: Level) -> EnvFilter {
    NOISY_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), EnvFilter::add_directive)
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Create a broker connection operation span
#[macro_export]
macro_rules! broker_span {
    ($($field:tt)*) => {
        tracing::info_span!("broker_operation", $($field)*)
    };
}

pub use broker_span;
