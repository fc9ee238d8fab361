use serde::Deserialize;
use serde_with::serde_as;
use sysprobe_config::{deser::PermissiveBool, GenericConfiguration};
use sysprobe_error::{generic_error, ErrorContext as _, GenericError};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::WARN.into()
}

const fn default_false() -> bool {
    false
}

/// Logging configuration.
///
/// Logs always go to standard error, since standard output carries query results.
#[serde_as]
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_level")]
    pub(crate) log_level: LogLevel,

    #[serde_as(as = "PermissiveBool")]
    #[serde(default = "default_false")]
    pub(crate) log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` instance from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config
            .as_typed()
            .error_context("Failed to extract logging configuration.")?;
        Ok(logging_config)
    }

    /// Overrides the configured level, typically from a command-line verbosity flag.
    pub fn with_level_override(mut self, level: LevelFilter) -> Self {
        self.log_level = level.into();
        self
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(try_from = "String")]
pub(crate) struct LogLevel(EnvFilter);

impl LogLevel {
    pub fn as_env_filter(&self) -> EnvFilter {
        // `EnvFilter` isn't `Clone` on every version we support, so rebuild it from its display form.
        EnvFilter::builder().parse_lossy(self.0.to_string())
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_level_rejected() {
        assert!(LogLevel::try_from(String::new()).is_err());
    }

    #[test]
    fn directive_level_parses() {
        let level = LogLevel::try_from("sysprobe=debug,info".to_string()).unwrap();
        let rendered = level.as_env_filter().to_string();
        assert!(rendered.contains("sysprobe=debug"), "{}", rendered);
    }

    #[test]
    fn defaults_from_empty_configuration() {
        let config = LoggingConfiguration::from_configuration(&GenericConfiguration::empty()).unwrap();
        assert!(!config.log_format_json);
        assert!(config.log_level.as_env_filter().to_string().contains("warn"));
    }
}
