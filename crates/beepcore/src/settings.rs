use std::sync::Arc;

use beepcore_channel::{ChannelConfig, Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;

/// Channel and logging configuration read from one document.
///
/// ```json
/// { "channel": { "serialize": true }, "logging": { "level": "debug" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub channel: ChannelConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Install the subscriber, with environment overrides applied, then
    /// build the context. A subscriber installed earlier is kept.
    pub fn start(self) -> Result<Arc<Context>> {
        let logging = self.logging.with_env_overrides();
        if !logging.init() {
            tracing::debug!("subscriber already installed, logging settings ignored");
        }
        Context::new(self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, LogLevel};

    #[test]
    fn test_sections_are_optional() {
        let settings = Settings::from_json(r#"{"logging": {"format": "json"}}"#).unwrap();
        assert_eq!(settings.channel, ChannelConfig::default());
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_start_builds_the_configured_context() {
        let settings = Settings::from_json(
            r#"{"channel": {"serialize": true, "pool": {"threads": 2}}, "logging": {"level": "off"}}"#,
        )
        .unwrap();
        let context = settings.start().unwrap();
        assert!(context.config().serialize);
        assert_eq!(context.config().pool.threads, 2);
    }

    #[test]
    fn test_malformed_document_is_a_config_error() {
        assert!(matches!(
            Settings::from_json("{\"channel\": 3}"),
            Err(beepcore_channel::ChannelError::Config(_))
        ));
    }
}
