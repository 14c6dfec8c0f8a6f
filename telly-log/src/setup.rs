use std::env;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    #[default]
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  telly_pipeline::agent > agent started
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-12-04T12:10:32Z  INFO telly_pipeline::agent: agent started
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The verbosity of log output.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Disables logging entirely.
    Off,
    /// Only errors.
    Error,
    /// Errors and warnings.
    Warn,
    /// Informational messages and above.
    #[default]
    Info,
    /// Debug messages and above.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    /// Returns the corresponding `tracing` level filter.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for the crates of this workspace.
    pub level: LogLevel,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE` variable to `full`.
    pub enable_backtraces: bool,
}

/// Builds the default directives: INFO for third-party crates, the configured level for ours.
fn default_filter(level: LogLevel) -> EnvFilter {
    let level = level.level_filter();
    let mut filter = EnvFilter::default().add_directive(LevelFilter::INFO.into());

    for name in crate::CRATE_NAMES {
        if let Ok(directive) = format!("{name}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    filter
}

/// Initialize the logging system.
///
/// The `RUST_LOG` environment variable takes precedence over the configured level. Calling this
/// function more than once has no effect.
///
/// # Example
///
/// ```
/// let config = telly_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// telly_log::init(&config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        // SAFETY: called during startup before any other thread reads the environment.
        unsafe { env::set_var("RUST_BACKTRACE", "full") };
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match (config.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => {
            registry.with(fmt::layer().pretty()).try_init()
        }
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            registry.with(fmt::layer().with_ansi(false)).try_init()
        }
        (LogFormat::Json, _) => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("logging was already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Auto);
        assert!(!config.enable_backtraces);
    }

    #[test]
    fn test_log_config_lowercase() {
        let config: LogConfig =
            serde_json::from_str(r#"{"level": "trace", "format": "json"}"#).unwrap();
        assert_eq!(config.level.level_filter(), LevelFilter::TRACE);
        assert_eq!(config.format, LogFormat::Json);
    }
}
