//! Utilities for logging.
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Json,
}

/// Configure the global logger.
///
/// `RUST_LOG` takes precedence over `default_level` when set. Calling this
/// more than once is a no-op.
pub fn configure_global_logger(default_level: Level, format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default_level).into())
        .from_env_lossy();

    let builder = SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_thread_names(true);

    let _ = match format {
        LogFormat::HumanReadable => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Initialize logging for tests.
///
/// Output goes through the test writer so it's only shown for failing tests.
pub fn init_test() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env_lossy();

    let _ = SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
