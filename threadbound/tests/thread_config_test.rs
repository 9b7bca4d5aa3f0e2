// Integration tests for config types in threadbound::config

use std::time::Duration;

use threadbound::config::*;

#[test]
fn test_thread_config_defaults() {
    let config = ThreadConfig::default();

    assert!(config.name.is_none());
    assert!(config.stack_size.is_none());
    assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
    assert_eq!(config.shutdown_policy, ShutdownPolicy::DropPending);
    assert!(config.idle_timeout.is_none());
}

#[test]
fn test_thread_config_builders() {
    let config = ThreadConfig::named("isp")
        .with_shutdown_policy(ShutdownPolicy::DrainPending)
        .with_stack_size(256 * 1024)
        .with_event_capacity(0);

    assert_eq!(config.name.as_deref(), Some("isp"));
    assert_eq!(config.shutdown_policy, ShutdownPolicy::DrainPending);
    assert_eq!(config.stack_size, Some(256 * 1024));
    // Capacity is clamped so the dispatcher can always fetch an event.
    assert_eq!(config.event_capacity, 1);
}

#[test]
fn test_named_thread_uses_config_name() {
    let thread = threadbound::Thread::with_config(ThreadConfig::named("sensor-0")).unwrap();
    assert_eq!(thread.name(), "sensor-0");

    let unnamed = threadbound::Thread::new().unwrap();
    assert!(unnamed.name().starts_with(DEFAULT_THREAD_NAME_PREFIX));

    let config = ThreadConfig {
        idle_timeout: Some(Duration::from_millis(5)),
        ..Default::default()
    };
    let polling = threadbound::Thread::with_config(config).unwrap();
    polling.start().unwrap();
    polling.exit(0);
    assert!(polling.wait(Some(Duration::from_secs(1))).unwrap());
}

#[test]
fn test_config_debug_format() {
    let config = ThreadConfig::default();
    assert!(format!("{:?}", config).contains("shutdown_policy"));
}
