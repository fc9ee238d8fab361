//! Logging.

use sysprobe_error::{generic_error, GenericError};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::LoggingConfiguration;

mod layer;
use self::layer::build_formatting_layer;

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are written to standard error, either in a pipe-delimited human-readable format or, if `log_format_json` is
/// set, as flattened JSON objects. Filtering follows `log_level`, which accepts anything `EnvFilter` does (for example,
/// `info` or `sysprobe=trace,warn`).
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    let filter = config.log_level.as_env_filter();
    let output_layer = build_formatting_layer(config, std::io::stderr);

    tracing_subscriber::registry()
        .with(output_layer.with_filter(filter))
        .try_init()
        .map_err(|e| generic_error!("Failed to install logging subscriber: {}", e))
}
