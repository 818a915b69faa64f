//! Logging setup for the cohorts CLI
//!
//! Logs go to stderr so that command output on stdout stays machine-readable.
//! `RUST_LOG` takes precedence over `--level`.

use std::io;
pub use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};
use uuid::Uuid;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TracingFormat {
    /// Multi-line, human-readable
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event, with the enclosing spans
    Json,
}

/// Minimum level of logged events
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Everything
    Trace,
    /// Cache hits, misses and writes
    Debug,
    /// Batch totals and clears
    Info,
    /// Recovered entries and failed patients (default)
    Warn,
    /// Errors only
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Filter directives for the crates of this workspace
fn directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    ["cohorts", "cohorts_cli", "cohorts_cache"]
        .map(|target| format!("{target}={level}"))
        .join(",")
}

fn fmt_layer(format: TracingFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);
    match format {
        TracingFormat::Pretty => layer.pretty().boxed(),
        TracingFormat::Compact => layer.compact().with_target(false).boxed(),
        TracingFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
    }
}

/// Install the global subscriber
pub fn init_tracing(format: TracingFormat, level: Level) -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(level)))
        .map_err(|e| miette::miette!("Invalid log filter: {e}"))?;

    tracing_subscriber::registry()
        .with(fmt_layer(format))
        .with(filter)
        .try_init()
        .map_err(|e| miette::miette!("Failed to install log subscriber: {e}"))
}

/// Root span for one invocation; every event logged inside it carries the
/// invocation's correlation id
///
/// Error level so the span stays enabled under any `--level`.
pub fn invocation_span(command: &str) -> tracing::Span {
    tracing::error_span!(
        "cohorts",
        command,
        correlation_id = %Uuid::new_v4(),
        version = env!("CARGO_PKG_VERSION"),
    )
}
