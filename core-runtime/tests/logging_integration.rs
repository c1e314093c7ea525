//! Integration tests for logging system

use std::sync::Arc;

use bridge_traits::log::LogLevel;
use core_runtime::events::{CoreEvent, EventBus, EventStream};
use core_runtime::logging::{init_logging, EventBusLogSink, LogFormat, LoggingConfig};
use core_runtime::Error;

// The global subscriber can only be installed once per process, so the whole
// lifecycle lives in a single test.
#[tokio::test]
async fn test_logging_forwards_to_event_bus() {
    let bus = EventBus::new(32);
    let mut logs = EventStream::new(bus.subscribe())
        .filter(|event| matches!(event, CoreEvent::Log(_)));

    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_log_sink(Arc::new(
            EventBusLogSink::new(bus.clone()).with_min_level(LogLevel::Info),
        ));
    init_logging(config).unwrap();

    tracing::info!(target: "core_pipeline::orchestrator", chapters = 5, "Conversion started");
    tracing::debug!(target: "core_pipeline::orchestrator", "below sink level");
    tracing::warn!(target: "core_memory::monitor", "Memory pressure rising");

    match logs.recv().await.unwrap() {
        CoreEvent::Log(event) => {
            assert_eq!(event.level, LogLevel::Info);
            assert_eq!(event.target, "core_pipeline::orchestrator");
            assert_eq!(event.message, "Conversion started chapters=5");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    match logs.recv().await.unwrap() {
        CoreEvent::Log(event) => assert_eq!(event.level, LogLevel::Warn),
        other => panic!("unexpected event: {:?}", other),
    }

    let second = init_logging(LoggingConfig::default());
    assert!(matches!(second, Err(Error::Config(_))));
}

#[test]
fn test_format_selection() {
    #[cfg(debug_assertions)]
    assert_eq!(LogFormat::default(), LogFormat::Pretty);

    #[cfg(not(debug_assertions))]
    assert_eq!(LogFormat::default(), LogFormat::Json);
}
