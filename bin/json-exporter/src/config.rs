use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use jsonscrape::collector::FetchFailurePolicy;
use jsonscrape_config::GenericConfiguration;

const DEFAULT_LISTEN_ADDRESS: ([u8; 4], u16) = ([0, 0, 0, 0], 7979);
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Exposes values found in JSON documents as Prometheus gauges.
#[derive(Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the exporter settings file.
    #[arg(short = 'c', long = "config")]
    pub config_file: Option<PathBuf>,

    /// Path to the file listing the endpoints to scrape.
    #[arg(value_name = "ENDPOINTS_FILE")]
    pub endpoints_file: PathBuf,

    /// Path to the file holding the metric definitions.
    #[arg(value_name = "CONFIG_PATH")]
    pub definitions_file: PathBuf,
}

/// Exporter settings.
#[derive(Clone, Debug)]
pub struct ExporterConfiguration {
    listen_address: SocketAddr,
    metric_prefix: String,
    fetch_timeout: Duration,
    abort_round_on_fetch_error: bool,
}

impl ExporterConfiguration {
    /// Creates a new `ExporterConfiguration` instance from the given configuration.
    ///
    /// # Errors
    ///
    /// If any setting is present but has the wrong type, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, anyhow::Error> {
        Ok(Self {
            listen_address: config
                .try_get_typed::<String>("listen_address")?
                .map(|raw| raw.parse::<SocketAddr>().with_context(|| format!("Invalid listen address '{}'.", raw)))
                .transpose()?
                .unwrap_or_else(|| SocketAddr::from(DEFAULT_LISTEN_ADDRESS)),
            metric_prefix: config.try_get_typed("metric_prefix")?.unwrap_or_default(),
            fetch_timeout: Duration::from_secs(
                config
                    .try_get_typed("fetch_timeout_secs")?
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            abort_round_on_fetch_error: config.try_get_typed("abort_round_on_fetch_error")?.unwrap_or(false),
        })
    }

    /// Returns the address the exposition server listens on.
    pub const fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Returns the metric prefix applied to endpoints that don't specify their own.
    pub fn metric_prefix(&self) -> &str {
        &self.metric_prefix
    }

    /// Returns the timeout for a single endpoint fetch.
    pub const fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Returns what a scrape round does when an endpoint can't be fetched.
    pub const fn fetch_failure_policy(&self) -> FetchFailurePolicy {
        if self.abort_round_on_fetch_error {
            FetchFailurePolicy::AbortRound
        } else {
            FetchFailurePolicy::Isolate
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use jsonscrape_config::ConfigurationLoader;

    use super::*;

    fn configuration(yaml: &str) -> GenericConfiguration {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic()
    }

    #[test]
    fn defaults() {
        let config = ExporterConfiguration::from_configuration(&configuration("{}\n")).unwrap();

        assert_eq!(config.listen_address(), "0.0.0.0:7979".parse().unwrap());
        assert_eq!(config.metric_prefix(), "");
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.fetch_failure_policy(), FetchFailurePolicy::Isolate);
    }

    #[test]
    fn overrides() {
        let yaml = concat!(
            "listen_address: 127.0.0.1:9100\n",
            "metric_prefix: app_\n",
            "fetch_timeout_secs: 2\n",
            "abort_round_on_fetch_error: true\n",
        );
        let config = ExporterConfiguration::from_configuration(&configuration(yaml)).unwrap();

        assert_eq!(config.listen_address(), "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.metric_prefix(), "app_");
        assert_eq!(config.fetch_timeout(), Duration::from_secs(2));
        assert_eq!(config.fetch_failure_policy(), FetchFailurePolicy::AbortRound);
    }

    #[test]
    fn invalid_listen_address() {
        let result = ExporterConfiguration::from_configuration(&configuration("listen_address: nowhere\n"));
        assert!(result.is_err());
    }

    #[test]
    fn parses_cli() {
        let args = ["json-exporter", "-c", "settings.yaml", "endpoints.yaml", "metrics.yaml"];
        let cli = Cli::try_parse_from(args).unwrap();

        assert_eq!(cli.config_file, Some(PathBuf::from("settings.yaml")));
        assert_eq!(cli.endpoints_file, PathBuf::from("endpoints.yaml"));
        assert_eq!(cli.definitions_file, PathBuf::from("metrics.yaml"));
    }

    #[test]
    fn cli_requires_both_files() {
        assert!(Cli::try_parse_from(["json-exporter", "endpoints.yaml"]).is_err());
    }
}
