//! Structured logging setup for the key management service

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines (for production)
    Json,
    /// Human-readable lines (for development and the admin CLI)
    Console,
}

impl LogFormat {
    /// Parse a format name, falling back to JSON for anything unknown
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "console" | "pretty" | "text" => LogFormat::Console,
            _ => LogFormat::Json,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging in the given format.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) -> bool {
    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter(default_level))
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()
            .is_ok(),
        LogFormat::Console => tracing_subscriber::fmt()
            .with_env_filter(env_filter(default_level))
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(
            service = service_name,
            format = ?format,
            "Logging initialized"
        );
    }
    installed
}

/// Initialize structured JSON logging
///
/// This sets up:
/// - JSON formatted logs
/// - Environment-based log level filtering
/// - Service name tagging
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}

/// Initialize simple console logging (for development)
pub fn init_console_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Console);
}
