/// Pipeline configuration
///
/// Loaded from a TOML file; the provider token may instead come from the
/// `A5_API_TOKEN` environment variable (a `.env` file is honoured).
///
/// ```toml
/// timezone = "-03:00"
///
/// [provider]
/// url = "https://a5.example.org/api"
///
/// [log]
/// level = "info"
/// file = "hydrofuse.log"
/// console_timestamps = true
/// ```

use std::path::Path;

use chrono::FixedOffset;
use serde::Deserialize;

use crate::ingest::a5::A5Client;
use crate::logging::{LogLevel, Logger};
use crate::model::{ConfigurationError, ProviderError};
use crate::timegrid::parse_utc_offset;

pub const TOKEN_ENV_VAR: &str = "A5_API_TOKEN";

fn default_timezone() -> String {
    "-03:00".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub console_timestamps: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub provider: ProviderConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub log: LogConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let config: PipelineConfig = toml::from_str(raw).map_err(|e| ConfigurationError::Malformed(e.to_string()))?;
        config.timezone_offset()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Malformed(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn timezone_offset(&self) -> Result<FixedOffset, ConfigurationError> {
        parse_utc_offset(&self.timezone).map_err(|message| ConfigurationError::InvalidValue {
            context: "config".to_string(),
            field: "timezone".to_string(),
            message,
        })
    }

    /// The configured token, else `A5_API_TOKEN` from the environment.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(token) = &self.provider.token {
            return Some(token.clone());
        }
        dotenv::dotenv().ok();
        std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty())
    }

    pub fn logger(&self) -> Logger {
        Logger::new(self.log.level, self.log.file.as_deref(), self.log.console_timestamps)
    }

    pub fn run_context(&self) -> Result<RunContext, ConfigurationError> {
        Ok(RunContext::new(self.timezone_offset()?, self.logger()))
    }

    pub fn client(&self) -> Result<A5Client, ProviderError> {
        A5Client::new(&self.provider.url, self.resolve_token())
    }
}

/// What a topology needs from its environment: the zone naive timestamps
/// are read in, and where to log.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub timezone: FixedOffset,
    pub logger: Logger,
}

impl RunContext {
    pub fn new(timezone: FixedOffset, logger: Logger) -> Self {
        RunContext { timezone, logger }
    }

    /// A context that logs nothing.
    pub fn quiet(timezone: FixedOffset) -> Self {
        RunContext::new(timezone, Logger::disabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = PipelineConfig::from_toml_str("[provider]\nurl = \"http://localhost:3005\"\n")
            .expect("minimal config should parse");
        assert_eq!(config.timezone, "-03:00");
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.log.file.is_none());
        assert_eq!(config.timezone_offset().unwrap().local_minus_utc(), -3 * 3600);
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
            timezone = "+01:00"

            [provider]
            url = "http://localhost:3005"
            token = "secret"

            [log]
            level = "warn"
            console_timestamps = true
        "#;
        let config = PipelineConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.resolve_token().as_deref(), Some("secret"), "explicit token wins over environment");
        assert_eq!(config.log.level, LogLevel::Warning);
        assert!(config.log.console_timestamps);
        assert_eq!(config.logger().min_level(), LogLevel::Warning);
        assert_eq!(config.run_context().unwrap().timezone.local_minus_utc(), 3600);
    }

    #[test]
    fn test_invalid_timezone_is_rejected() {
        let raw = "timezone = \"Mars/Olympus\"\n[provider]\nurl = \"http://localhost\"\n";
        assert!(matches!(
            PipelineConfig::from_toml_str(raw),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let raw = "[provider]\nurl = \"http://localhost\"\nretries = 3\n";
        assert!(matches!(PipelineConfig::from_toml_str(raw), Err(ConfigurationError::Malformed(_))));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let result = PipelineConfig::load(Path::new("/nonexistent/hydrofuse.toml"));
        assert!(matches!(result, Err(ConfigurationError::Malformed(msg)) if msg.contains("hydrofuse.toml")));
    }
}
