// Logging for threadbound
//
// Unified logging set-up on top of the `tracing` ecosystem. The runtime
// itself only emits `tracing` events; applications choose how they are
// collected by calling one of the `init*` functions once at start-up.
//
// # Usage Examples
//
// ```rust
// use threadbound::logging;
//
// // Development: DEBUG level, file/line info, runtime internals at TRACE
// logging::init_development();
//
// // Production: INFO level, JSON output
// logging::init_production();
//
// // Custom
// let config = logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     json_format: false,
//     ..Default::default()
// };
// logging::init(config);
// ```
//
// ## Spans and lifecycle events
//
// ```rust
// let span = threadbound::thread_span!("camera-worker");
// let _guard = span.enter();
//
// threadbound::log_lifecycle!("camera-worker", "started");
// threadbound::log_message!("invoke", "delivered", queue = 3);
// ```

use std::io;
use std::sync::Once;

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, registry::LookupSpan, EnvFilter, Layer};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(filters) = &config.target_filters {
        for directive in filters.split(',') {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring invalid log filter {:?}: {}", directive, e),
            }
        }
    }
    filter
}

fn console_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_ansi(atty::is(atty::Stream::Stdout))
        .with_file(config.show_file_line)
        .with_line_number(config.show_file_line)
        .with_thread_names(config.show_thread_info)
        .with_thread_ids(config.show_thread_info);

    match (config.json_format, config.show_time) {
        (true, true) => layer.json().flatten_event(true).boxed(),
        (true, false) => layer.json().flatten_event(true).without_time().boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    }
}

/// Initialize the logging system with the given configuration
///
/// Sets up the global tracing subscriber. Safe to call multiple times; only
/// the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer(&config));
        set_global_subscriber(subscriber);
    });
}

// Helper function to set the global subscriber
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Open `path` for appending log output, creating it if needed.
pub fn file_writer(path: &str) -> io::Result<Box<dyn io::Write + Send + Sync + 'static>> {
    use std::fs::OpenOptions;

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    Ok(Box::new(file))
}

/// Initialize logging to both the console and `log_file`.
///
/// The file is opened up front so that an unusable path is reported to the
/// caller instead of being discovered on the first event.
pub fn init_with_file(config: LogConfig, log_file: &str) -> Result<(), io::Error> {
    drop(file_writer(log_file)?);

    INIT.call_once(|| {
        let log_file_path = log_file.to_string();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(move || match file_writer(&log_file_path) {
                Ok(writer) => writer,
                Err(_) => Box::new(std::io::stderr()),
            })
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer(&config))
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

/// INFO level, human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// Initialize logging optimized for development environments
///
/// - DEBUG level, TRACE for the thread and dispatcher internals
/// - Colorized console output with file/line information
/// - Thread names and IDs displayed
pub fn init_development() {
    let config = LogConfig {
        level: Level::DEBUG,
        json_format: false,
        show_file_line: true,
        show_thread_info: true,
        show_time: true,
        target_filters: Some("threadbound=debug,threadbound::thread=trace".to_string()),
    };
    init(config);
}

/// Initialize logging optimized for production environments
///
/// JSON output without file/line information, thread information kept for
/// diagnosing cross-thread delivery.
pub fn init_production() {
    let config = LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
    };
    init(config);
}

/// Initialize logging for tests: warnings and errors only, no timestamps.
pub fn init_test() {
    let config = LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    };
    init(config);
}

/// Create a span for work running on a runtime thread
///
/// ```rust
/// let span = threadbound::thread_span!("camera-worker");
/// let _guard = span.enter();
///
/// let span = threadbound::thread_span!("camera-worker", iteration = 3);
/// ```
#[macro_export]
macro_rules! thread_span {
    ($thread:expr) => {
        tracing::info_span!("thread", name = $thread)
    };
    ($thread:expr, $($fields:tt)*) => {
        tracing::info_span!("thread", name = $thread, $($fields)*)
    };
}

/// Create a span for message delivery
#[macro_export]
macro_rules! message_span {
    ($message_type:expr) => {
        tracing::debug_span!("message", type = $message_type)
    };
    ($message_type:expr, $($fields:tt)*) => {
        tracing::debug_span!("message", type = $message_type, $($fields)*)
    };
}

/// Log thread lifecycle events
///
/// ```rust
/// threadbound::log_lifecycle!("camera-worker", "started");
/// threadbound::log_lifecycle!("camera-worker", "stopped", code = 0);
/// ```
#[macro_export]
macro_rules! log_lifecycle {
    ($thread:expr, $event:expr) => {
        tracing::info!(thread = $thread, event = $event);
    };
    ($thread:expr, $event:expr, $($fields:tt)*) => {
        tracing::info!(thread = $thread, event = $event, $($fields)*);
    };
}

/// Log message processing events
#[macro_export]
macro_rules! log_message {
    ($message_type:expr, $status:expr) => {
        tracing::debug!(message_type = $message_type, status = $status);
    };
    ($message_type:expr, $status:expr, $($fields:tt)*) => {
        tracing::debug!(message_type = $message_type, status = $status, $($fields)*);
    };
}

/// Get the current tracing dispatcher
///
/// Useful for threads spawned outside the runtime that should log with the
/// same configuration.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}
