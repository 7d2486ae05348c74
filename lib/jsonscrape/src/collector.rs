//! Scrape rounds.
use indexmap::{map::Entry, IndexMap};
use tracing::{debug, error, warn};

use crate::{
    definition::{ConfigError, Endpoint, MetricDefinition},
    extract::{Payload, PreparedScraper},
    fetch::Fetcher,
    registry::{MetricFamily, MetricRegistry},
};

/// What to do with the rest of a round when fetching an endpoint fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FetchFailurePolicy {
    /// Log the failure and continue with the next endpoint.
    #[default]
    Isolate,

    /// Log the failure and end the round. Endpoints after the failing one are not fetched.
    AbortRound,
}

/// Outcome of a single scrape round.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RoundSummary {
    /// Endpoints whose payload was fetched and decoded.
    pub endpoints_scraped: usize,

    /// Endpoints that could not be fetched, or whose payload was not valid JSON.
    pub endpoints_failed: usize,

    /// Samples accepted by the registry.
    pub samples_recorded: usize,

    /// Scrapers that failed, and samples the registry rejected.
    pub scrape_errors: usize,

    /// Whether the round ended early because of a fetch failure.
    pub aborted: bool,
}

struct EndpointScrapers {
    endpoint: Endpoint,
    scrapers: Vec<PreparedScraper>,
}

/// Drives scrape rounds over every configured endpoint.
///
/// Every metric definition is bound to every endpoint once, at construction, and the resulting metric families are
/// registered at the same time. Rounds then reuse those scrapers as-is: the collector holds no other state.
pub struct Collector {
    endpoints: Vec<EndpointScrapers>,
    policy: FetchFailurePolicy,
}

impl Collector {
    /// Creates a new `Collector`, registering every metric family it can produce with `registry`.
    ///
    /// Scrapers are built endpoint-major: all definitions for the first endpoint, then all definitions for the second,
    /// and so on. A family produced by more than one scraper is registered once, as long as every scraper agrees on its
    /// label names.
    ///
    /// # Errors
    ///
    /// If any definition fails to compile, two scrapers disagree on the label names of a family, or the registry
    /// rejects a family, an error is returned.
    pub fn new<R>(
        definitions: &[MetricDefinition], endpoints: &[Endpoint], registry: &mut R,
    ) -> Result<Self, ConfigError>
    where
        R: MetricRegistry,
    {
        let mut registered: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut bound = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let mut scrapers = Vec::with_capacity(definitions.len());
            for definition in definitions {
                let scraper = PreparedScraper::prepare(definition, endpoint)?;
                for family in scraper.families() {
                    register_family(&mut registered, registry, family)?;
                }
                scrapers.push(scraper);
            }

            bound.push(EndpointScrapers {
                endpoint: endpoint.clone(),
                scrapers,
            });
        }

        debug!(
            endpoints = bound.len(),
            definitions = definitions.len(),
            families = registered.len(),
            "Prepared scrapers."
        );

        Ok(Self {
            endpoints: bound,
            policy: FetchFailurePolicy::default(),
        })
    }

    /// Sets the fetch failure policy.
    pub fn with_fetch_failure_policy(mut self, policy: FetchFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the fetch failure policy.
    pub fn fetch_failure_policy(&self) -> FetchFailurePolicy {
        self.policy
    }

    /// Returns the total number of prepared scrapers.
    pub fn scraper_count(&self) -> usize {
        self.endpoints.iter().map(|bound| bound.scrapers.len()).sum()
    }

    /// Runs a single scrape round.
    ///
    /// Endpoints are fetched one at a time, in the order they were configured. Each payload is decoded once and
    /// handed to every scraper bound to its endpoint, and the resulting samples are recorded in `registry`. Failures
    /// are logged and skipped, unless the fetch failure policy says otherwise.
    pub async fn collect<F, R>(&self, fetcher: &F, registry: &mut R) -> RoundSummary
    where
        F: Fetcher + ?Sized,
        R: MetricRegistry,
    {
        let mut summary = RoundSummary::default();

        for bound in &self.endpoints {
            let url = bound.endpoint.url();

            let bytes = match fetcher.fetch(url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(endpoint = url, error = %e, "Failed to fetch endpoint.");
                    summary.endpoints_failed += 1;

                    if self.policy == FetchFailurePolicy::AbortRound {
                        summary.aborted = true;
                        break;
                    }
                    continue;
                }
            };

            let payload = match Payload::from_slice(&bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(endpoint = url, error = %e, "Skipping endpoint.");
                    summary.endpoints_failed += 1;
                    continue;
                }
            };
            summary.endpoints_scraped += 1;

            for scraper in &bound.scrapers {
                let samples = match scraper.scrape(&payload) {
                    Ok(samples) => samples,
                    Err(e) => {
                        error!(metric = scraper.metric_name(), endpoint = url, error = %e, "Failed to scrape metric.");
                        summary.scrape_errors += 1;
                        continue;
                    }
                };

                for sample in &samples {
                    match registry.set(sample) {
                        Ok(()) => summary.samples_recorded += 1,
                        Err(e) => {
                            warn!(metric = sample.name(), endpoint = url, error = %e, "Dropping sample.");
                            summary.scrape_errors += 1;
                        }
                    }
                }
            }
        }

        debug!(
            endpoints_scraped = summary.endpoints_scraped,
            endpoints_failed = summary.endpoints_failed,
            samples_recorded = summary.samples_recorded,
            scrape_errors = summary.scrape_errors,
            aborted = summary.aborted,
            "Finished scrape round."
        );

        summary
    }
}

fn register_family<R>(
    registered: &mut IndexMap<String, Vec<String>>, registry: &mut R, family: MetricFamily,
) -> Result<(), ConfigError>
where
    R: MetricRegistry,
{
    match registered.entry(family.name().to_string()) {
        Entry::Occupied(entry) => {
            if entry.get().as_slice() != family.label_names() {
                return Err(ConfigError::ConflictingFamily {
                    name: family.name().to_string(),
                    existing: entry.get().clone(),
                    conflicting: family.label_names().to_vec(),
                });
            }
            Ok(())
        }
        Entry::Vacant(entry) => {
            entry.insert(family.label_names().to_vec());
            registry
                .register(family)
                .map_err(|source| ConfigError::Registration { source })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::{
        definition::{ScrapeKind, ENDPOINT_LABEL},
        extract::LabelSet,
        fetch::FetchError,
        registry::GaugeRegistry,
    };

    /// Serves canned payloads, and records the order in which URLs were fetched.
    #[derive(Default)]
    struct StaticFetcher {
        payloads: HashMap<String, &'static str>,
        fetched: std::sync::Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        fn with_payload(mut self, url: &str, payload: &'static str) -> Self {
            self.payloads.insert(url.to_string(), payload);
            self
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            match self.payloads.get(url) {
                Some(payload) => Ok(Bytes::from_static(payload.as_bytes())),
                None => Err(FetchError::Status {
                    url: url.to_string(),
                    status: StatusCode::NOT_FOUND,
                }),
            }
        }
    }

    fn endpoint_labels(url: &str) -> LabelSet {
        let mut labels = LabelSet::new();
        labels.insert(ENDPOINT_LABEL.to_string(), url.to_string());
        labels
    }

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("http://a/stats", ""),
            Endpoint::new("http://b/stats", ""),
            Endpoint::new("http://c/stats", ""),
        ]
    }

    #[tokio::test]
    async fn fetch_failures_are_isolated_by_default() {
        let definitions = vec![MetricDefinition::new("requests", "$.requests")];
        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints(), &mut registry).unwrap();

        let fetcher = StaticFetcher::default()
            .with_payload("http://a/stats", r#"{"requests":1}"#)
            .with_payload("http://c/stats", r#"{"requests":3}"#);

        let summary = collector.collect(&fetcher, &mut registry).await;
        assert_eq!(
            summary,
            RoundSummary {
                endpoints_scraped: 2,
                endpoints_failed: 1,
                samples_recorded: 2,
                scrape_errors: 0,
                aborted: false,
            }
        );
        assert_eq!(fetcher.fetched(), vec!["http://a/stats", "http://b/stats", "http://c/stats"]);
        assert_eq!(registry.get("requests", &endpoint_labels("http://a/stats")), Some(1.0));
        assert_eq!(registry.get("requests", &endpoint_labels("http://c/stats")), Some(3.0));
    }

    #[tokio::test]
    async fn abort_policy_ends_round_on_fetch_failure() {
        let definitions = vec![MetricDefinition::new("requests", "$.requests")];
        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints(), &mut registry)
            .unwrap()
            .with_fetch_failure_policy(FetchFailurePolicy::AbortRound);

        let fetcher = StaticFetcher::default()
            .with_payload("http://a/stats", r#"{"requests":1}"#)
            .with_payload("http://c/stats", r#"{"requests":3}"#);

        let summary = collector.collect(&fetcher, &mut registry).await;
        assert!(summary.aborted);
        assert_eq!(summary.endpoints_scraped, 1);
        assert_eq!(summary.endpoints_failed, 1);
        assert_eq!(fetcher.fetched(), vec!["http://a/stats", "http://b/stats"]);
        assert_eq!(registry.get("requests", &endpoint_labels("http://c/stats")), None);
    }

    #[tokio::test]
    async fn invalid_payload_skips_endpoint() {
        let definitions = vec![MetricDefinition::new("requests", "$.requests")];
        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints()[..2], &mut registry).unwrap();

        let fetcher = StaticFetcher::default()
            .with_payload("http://a/stats", "not json")
            .with_payload("http://b/stats", r#"{"requests":2}"#);

        let summary = collector.collect(&fetcher, &mut registry).await;
        assert_eq!(summary.endpoints_failed, 1);
        assert_eq!(summary.endpoints_scraped, 1);
        assert_eq!(summary.samples_recorded, 1);
    }

    #[tokio::test]
    async fn unresolved_metrics_do_not_block_others() {
        let definitions = vec![
            MetricDefinition::new("status", "$.status"),
            MetricDefinition::new("missing", "$.missing"),
            MetricDefinition::new("requests", "$.requests"),
        ];
        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints()[..1], &mut registry).unwrap();

        let fetcher = StaticFetcher::default().with_payload("http://a/stats", r#"{"status":"ok","requests":5}"#);

        let summary = collector.collect(&fetcher, &mut registry).await;
        assert_eq!(summary.samples_recorded, 1);
        assert_eq!(summary.scrape_errors, 0);
        assert_eq!(registry.get("requests", &endpoint_labels("http://a/stats")), Some(5.0));
        assert_eq!(registry.get("status", &endpoint_labels("http://a/stats")), None);
    }

    #[tokio::test]
    async fn parse_errors_are_counted_and_later_scrapers_still_run() {
        let definitions = vec![
            MetricDefinition::new("huge", "$.huge"),
            MetricDefinition::new("requests", "$.requests"),
        ];
        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints()[..1], &mut registry).unwrap();

        let fetcher = StaticFetcher::default().with_payload("http://a/stats", r#"{"huge":1e400,"requests":5}"#);

        let summary = collector.collect(&fetcher, &mut registry).await;
        assert_eq!(
            summary,
            RoundSummary {
                endpoints_scraped: 1,
                endpoints_failed: 0,
                samples_recorded: 1,
                scrape_errors: 1,
                aborted: false,
            }
        );
        assert_eq!(registry.get("huge", &endpoint_labels("http://a/stats")), None);
        assert_eq!(registry.get("requests", &endpoint_labels("http://a/stats")), Some(5.0));
    }

    #[tokio::test]
    async fn object_definitions_record_every_sub_metric() {
        let definitions = vec![MetricDefinition::new("user", "$")
            .with_kind(ScrapeKind::Object)
            .with_label("user", "$.id")
            .with_value("score", "$.score")
            .with_value("up", "1")];
        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints()[..1], &mut registry).unwrap();

        let fetcher = StaticFetcher::default().with_payload("http://a/stats", r#"{"id":"u1","score":7}"#);
        let summary = collector.collect(&fetcher, &mut registry).await;
        assert_eq!(summary.samples_recorded, 2);

        let mut labels = endpoint_labels("http://a/stats");
        labels.insert("user".to_string(), "u1".to_string());
        assert_eq!(registry.get("user_score", &labels), Some(7.0));
        assert_eq!(registry.get("user_up", &labels), Some(1.0));
    }

    #[test]
    fn shared_families_are_registered_once() {
        let definitions = vec![MetricDefinition::new("requests", "$.requests")];
        let mut registry = GaugeRegistry::new();
        let collector = Collector::new(&definitions, &endpoints(), &mut registry).unwrap();

        assert_eq!(collector.scraper_count(), 3);
        assert!(registry.family("requests").is_some());
    }

    #[test]
    fn prefixes_split_families() {
        let definitions = vec![MetricDefinition::new("requests", "$.requests")];
        let endpoints = vec![Endpoint::new("http://a/stats", "a_"), Endpoint::new("http://b/stats", "b_")];
        let mut registry = GaugeRegistry::new();
        Collector::new(&definitions, &endpoints, &mut registry).unwrap();

        assert!(registry.family("a_requests").is_some());
        assert!(registry.family("b_requests").is_some());
    }

    #[test]
    fn conflicting_families_are_rejected() {
        let definitions = vec![
            MetricDefinition::new("requests", "$.requests").with_label("env", "prod"),
            MetricDefinition::new("requests", "$.other"),
        ];
        let mut registry = GaugeRegistry::new();
        let err = Collector::new(&definitions, &endpoints()[..1], &mut registry).err().unwrap();
        assert!(matches!(err, ConfigError::ConflictingFamily { .. }));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let definitions = vec![MetricDefinition::new("requests", "$.[")];
        let mut registry = GaugeRegistry::new();
        let err = Collector::new(&definitions, &endpoints()[..1], &mut registry).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidPath { .. }));
    }
}
