//! # Logging Setup
//!
//! One-shot `tracing` subscriber installation for the node binary. Output
//! goes to stderr in either human or JSON form; what gets logged is
//! controlled by an `EnvFilter`, so operators can turn a single module up
//! to `debug` (say, the retry engine while chasing a delivery problem)
//! without drowning in the rest.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Colored, line-per-event output for a human at a terminal.
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    /// Maps a `--log-format` value to a format, treating anything that is
    /// not `"json"` as pretty. A typo'd flag should degrade to readable
    /// output, not kill the node at startup.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber. Must run once, before anything logs;
/// a second call panics because the global dispatcher is already set.
///
/// `default_filter` applies when `RUST_LOG` is unset; when set, `RUST_LOG`
/// wins outright. Both use `EnvFilter` directive syntax, e.g.
/// `verid_node=debug,verid_protocol=info`.
pub fn init_logging(default_filter: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true))
                .init();
        }
    }

    tracing::info!(?format, "logging initialized");
}
