//! Logging settings as read from their environment values

use amqp_relay::observability::logging::{parse_level, parse_span_events, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_values() {
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse(" compact "), LogFormat::Compact);
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    // Unset and unknown formats keep machine-readable output
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    assert_eq!(LogFormat::default(), LogFormat::Json);
}

#[test]
fn test_log_level_from_env_value() {
    let test_cases = vec![
        ("ERROR", Level::ERROR),
        ("warn", Level::WARN),
        ("Debug", Level::DEBUG),
        ("trace", Level::TRACE),
        ("verbose", Level::INFO),
        ("", Level::INFO),
    ];

    for (input, expected) in test_cases {
        assert_eq!(parse_level(input), expected, "Failed for input: {input}");
    }
}

#[test]
fn test_log_spans_requires_literal_true() {
    assert!(parse_span_events("TRUE"));
    assert!(!parse_span_events(""));
    assert!(!parse_span_events("1"));
}

#[test]
fn test_broker_span_without_subscriber() {
    // Spans must be constructible before logging is initialized
    let span = amqp_relay::broker_span!(operation = "close_watcher", generation = 1u64);
    let _entered = span.enter();
}
