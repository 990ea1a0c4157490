//! `tracing` subscriber driven by [`LoggingConfig`].
//!
//! The configuration deserializes from the `logging` section of a
//! [`Settings`](crate::Settings) document and may be overridden from the
//! environment with `BEEPCORE_LOG` (level) and `BEEPCORE_LOG_FORMAT`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

pub const LEVEL_ENV: &str = "BEEPCORE_LOG";
pub const FORMAT_ENV: &str = "BEEPCORE_LOG_FORMAT";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
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

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// How the process-wide subscriber is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Tag events with the emitting module, e.g. `beepcore_channel::close`.
    pub targets: bool,
    /// Tag events with the worker thread name. Deliveries run on
    /// `beepcore-worker-*` threads.
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::default(),
            targets: false,
            thread_names: true,
        }
    }
}

impl LoggingConfig {
    /// Apply `BEEPCORE_LOG` and `BEEPCORE_LOG_FORMAT` when set.
    pub fn with_env_overrides(self) -> Self {
        self.overridden(
            std::env::var(LEVEL_ENV).ok().as_deref(),
            std::env::var(FORMAT_ENV).ok().as_deref(),
        )
    }

    /// Values that fail to parse leave the configured setting alone.
    fn overridden(mut self, level: Option<&str>, format: Option<&str>) -> Self {
        if let Some(level) = level.and_then(|value| value.parse().ok()) {
            self.level = level;
        }
        if let Some(format) = format.and_then(|value| value.parse().ok()) {
            self.format = format;
        }
        self
    }

    /// Install a global subscriber writing to stderr. Returns false when one
    /// was already installed.
    pub fn init(&self) -> bool {
        let builder = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(self.level.as_filter())
            .with_ansi(false)
            .with_target(self.targets)
            .with_thread_names(self.thread_names);

        match self.format {
            LogFormat::Text => builder.try_init().is_ok(),
            LogFormat::Json => builder.json().try_init().is_ok(),
        }
    }
}

/// Shorthand for [`LoggingConfig::init`].
pub fn init_logging(config: &LoggingConfig) -> bool {
    config.init()
}
