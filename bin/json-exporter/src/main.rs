//! JSON exporter.
//!
//! Serves a Prometheus exposition endpoint whose every scrape fetches a set of JSON endpoints, extracts the configured
//! values from them, and returns the results as gauges.

#![deny(missing_docs)]
use std::path::Path;

use anyhow::Context as _;
use clap::Parser as _;
use jsonscrape_app::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
use jsonscrape_config::{ConfigurationLoader, GenericConfiguration};
use tokio::net::TcpListener;
use tracing::{error, info};

mod api;
use self::api::ExporterAPIHandler;

mod config;
use self::config::{Cli, ExporterConfiguration};

mod exporter;
use self::exporter::Exporter;

const APP_NAME: &str = "json-exporter";
const ENV_PREFIX: &str = "JSON_EXPORTER";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = load_configuration(cli.config_file.as_deref())
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:#}", e)));

    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load logging configuration: {:#}", e)));
    if let Err(e) = initialize_logging(&logging_config, APP_NAME) {
        fatal_and_exit(format!("failed to initialize logging: {:#}", e));
    }

    match run(cli, configuration).await {
        Ok(()) => info!("JSON exporter stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

/// Loads exporter settings from the optional settings file, overridden by `JSON_EXPORTER_*` environment variables.
fn load_configuration(config_file: Option<&Path>) -> Result<GenericConfiguration, anyhow::Error> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = config_file {
        loader = loader
            .from_yaml(path)
            .with_context(|| format!("Failed to load settings from '{}'.", path.display()))?;
    }

    let loader = loader.from_environment(ENV_PREFIX)?;
    Ok(loader.into_generic())
}

async fn run(cli: Cli, configuration: GenericConfiguration) -> Result<(), anyhow::Error> {
    let config = ExporterConfiguration::from_configuration(&configuration)?;
    let exporter = Exporter::from_files(&config, &cli.endpoints_file, &cli.definitions_file)?;

    let listener = TcpListener::bind(config.listen_address())
        .await
        .with_context(|| format!("Failed to bind to '{}'.", config.listen_address()))?;
    info!(listen_address = %config.listen_address(), "Serving metrics.");

    axum::serve(listener, ExporterAPIHandler::new(exporter).into_router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Exposition server failed.")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
        std::future::pending::<()>().await;
    }

    info!("Received shutdown signal. Stopping...");
}
