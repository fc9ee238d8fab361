//! Command-line front end for `sysprobe`.
//!
//! Runs a single query against the local OS and prints the result to standard output as JSON. Failures are logged to
//! standard error and reported through the exit code.

#![deny(warnings)]
use clap::Parser as _;
use sysprobe::{BindingContext, Probe};
use sysprobe_app::prelude::*;
use sysprobe_config::{ConfigurationLoader, GenericConfiguration};
use sysprobe_error::{render_chain, ErrorContext as _, GenericError};
use tracing::debug;

mod config;
use self::config::Cli;

mod query;

fn main() {
    let cli = Cli::parse();

    let configuration = load_configuration(&cli).unwrap_or_else(|e| {
        fatal_and_exit(format!("failed to load configuration: {}", render_chain(&e)))
    });

    let logging_config = match LoggingConfiguration::from_configuration(&configuration) {
        Ok(config) => config,
        Err(e) => fatal_and_exit(format!("invalid logging configuration: {}", render_chain(&e))),
    };
    let logging_config = match cli.log_level() {
        Some(level) => logging_config.with_level_override(level),
        None => logging_config,
    };
    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", render_chain(&e)));
    }

    let context = BindingContext::from_configuration(&configuration).unwrap_or_else(|e| {
        fatal_and_exit(format!("invalid binding configuration: {}", render_chain(&e)))
    });
    let probe = Probe::new(context);

    match query::run(&probe, &cli).and_then(|value| print(&value, cli.pretty)) {
        Ok(()) => {}
        Err(e) => {
            debug!(exit_code = e.exit_code(), "Query failed.");
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn load_configuration(cli: &Cli) -> Result<GenericConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = &cli.config_file {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
    }
    let loader = loader
        .from_environment("sysprobe")
        .error_context("Failed to read environment configuration.")?;
    Ok(loader.into_generic())
}

fn print(value: &serde_json::Value, pretty: bool) -> Result<(), query::QueryError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(rendered) => {
            println!("{}", rendered);
            Ok(())
        }
        Err(source) => Err(query::QueryError::Render {
            query: "output".to_string(),
            source,
        }),
    }
}
