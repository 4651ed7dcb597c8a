//! Global logging setup.
//!
//! The bucket crates only emit `tracing` events; an embedding binary (or a
//! test that wants to see merge logs) installs a subscriber once with
//! [`init`]. `RUST_LOG`, when set, overrides the configured level.
//!
//! ```no_run
//! use henyey_common::{logging, LoggingConfig};
//!
//! logging::init(&LoggingConfig::default()).expect("logging already initialized");
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};

/// Build the filter for `config`, preferring `RUST_LOG` when present.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Initialize the global tracing subscriber.
///
/// # Errors
///
/// Fails if a global subscriber has already been installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config);

    let result = match config.format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    result.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            format: LogFormat::Text,
        };
        // Another test binary thread may have won the race; either way the
        // second call in this process must fail.
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
