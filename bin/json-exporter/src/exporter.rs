use std::path::Path;

use anyhow::Context as _;
use jsonscrape::{
    collector::{Collector, RoundSummary},
    definition::{load_definitions, load_endpoints},
    fetch::{Fetcher, HttpFetcher},
    registry::GaugeRegistry,
};
use tracing::info;

use crate::config::ExporterConfiguration;

/// Everything needed to run scrape rounds and render their results.
pub struct Exporter {
    collector: Collector,
    registry: GaugeRegistry,
    fetcher: Box<dyn Fetcher>,
}

impl Exporter {
    /// Creates a new `Exporter` from already loaded parts.
    pub fn new(collector: Collector, registry: GaugeRegistry, fetcher: Box<dyn Fetcher>) -> Self {
        Self {
            collector,
            registry,
            fetcher,
        }
    }

    /// Loads endpoints and metric definitions from disk, and prepares them for scraping.
    ///
    /// # Errors
    ///
    /// If either file can't be loaded, any definition is invalid, or the HTTP client can't be built, an error is
    /// returned.
    pub fn from_files(
        config: &ExporterConfiguration, endpoints_file: &Path, definitions_file: &Path,
    ) -> Result<Self, anyhow::Error> {
        let endpoints = load_endpoints(endpoints_file, config.metric_prefix())
            .with_context(|| format!("Failed to load endpoints from '{}'.", endpoints_file.display()))?;
        let definitions = load_definitions(definitions_file)
            .with_context(|| format!("Failed to load metric definitions from '{}'.", definitions_file.display()))?;

        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints, &mut registry)
            .context("Failed to prepare scrapers.")?
            .with_fetch_failure_policy(config.fetch_failure_policy());
        let fetcher = HttpFetcher::new(config.fetch_timeout()).context("Failed to create HTTP fetcher.")?;

        info!(
            endpoints = endpoints.len(),
            definitions = definitions.len(),
            scrapers = collector.scraper_count(),
            "Loaded configuration."
        );

        Ok(Self::new(collector, registry, Box::new(fetcher)))
    }

    /// Runs a single scrape round, and renders the registry in the Prometheus text exposition format.
    pub async fn scrape(&mut self) -> (RoundSummary, String) {
        let summary = self.collector.collect(&*self.fetcher, &mut self.registry).await;
        (summary, self.registry.render())
    }
}
