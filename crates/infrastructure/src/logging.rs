use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LogFormat, LogLevel};

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` overrides the configured level when present. `text` is meant
/// for a terminal (`keel once`, a foreground daemon); `json` emits one
/// flattened object per line for daemons whose stdout feeds a log
/// aggregator.
///
/// A process gets exactly one subscriber; a second call fails.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::new(level.as_str()),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_ansi(false)
            .try_init(),
        LogFormat::Text => builder.try_init(),
    };

    installed.map_err(|e| ConfigError::Logging(e.to_string()))
}
