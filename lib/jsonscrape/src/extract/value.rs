use snafu::ResultExt as _;
use tracing::{debug, warn};

use super::{
    check_kind, is_number, parse_value, static_labels, ExtractError, LabelSet, Parse, Payload, Sample, ScrapeError,
};
use crate::{
    definition::{ConfigError, Endpoint, MetricDefinition},
    path::{compile_path, is_expression, CompiledPath, Match},
    registry::MetricFamily,
};

/// Extracts a single value per scrape.
///
/// Only the first match of the root path is used. Any further matches are ignored, with a warning, so that an ambiguous
/// expression still produces at most one sample per scrape.
#[derive(Clone, Debug)]
pub struct ValueExtractor {
    metric_name: String,
    help: String,
    label_names: Vec<String>,
    endpoint: String,
    path: CompiledPath,
    labels: LabelSet,
}

impl ValueExtractor {
    pub(super) fn from_definition(definition: &MetricDefinition, endpoint: &Endpoint) -> Result<Self, ConfigError> {
        // Expression labels have no matched node to resolve against here, so samples only carry the literal ones.
        for (label, raw) in definition.labels().iter().filter(|(_, raw)| is_expression(raw)) {
            warn!(
                metric = %definition.name(),
                endpoint = %endpoint.url(),
                label = %label,
                path = %raw,
                "Ignoring path expression label on value metric."
            );
        }

        Self::root(definition, endpoint)
    }

    /// Builds the root portion of a definition: name, root path and static labels.
    pub(super) fn root(definition: &MetricDefinition, endpoint: &Endpoint) -> Result<Self, ConfigError> {
        let raw_path = definition.path();
        if !is_expression(raw_path) {
            return Err(ConfigError::LiteralRootPath {
                metric: definition.name().to_string(),
                path: raw_path.to_string(),
            });
        }

        let path = compile_path(raw_path).map_err(|source| ConfigError::InvalidPath {
            metric: definition.name().to_string(),
            field: "path".to_string(),
            source,
        })?;

        Ok(Self {
            metric_name: format!("{}{}", endpoint.prefix(), definition.name()),
            help: definition.help().to_string(),
            label_names: definition.label_names(),
            endpoint: endpoint.url().to_string(),
            path,
            labels: static_labels(definition, endpoint),
        })
    }

    /// Returns the metric name, including the endpoint prefix.
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Returns the compiled root path.
    pub fn path(&self) -> &CompiledPath {
        &self.path
    }

    /// Returns the static labels attached to every sample.
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub(super) fn help(&self) -> &str {
        &self.help
    }

    pub(super) fn label_names(&self) -> &[String] {
        &self.label_names
    }

    pub(super) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(super) fn family(&self) -> MetricFamily {
        MetricFamily::new(self.metric_name.clone(), self.help.clone(), self.label_names.clone())
    }

    /// Evaluates the root path, returning its first match.
    ///
    /// Surplus matches are logged and discarded.
    pub(super) fn first_match<'a>(&self, payload: &'a Payload) -> Result<Match<'a>, ExtractError> {
        let mut matches = self.path.matches(payload.document());
        let first = matches.next().ok_or_else(|| ExtractError::NoMatch {
            path: self.path.to_string(),
        })?;

        let ignored = matches.len();
        if ignored > 0 {
            warn!(
                metric = %self.metric_name,
                path = %self.path,
                endpoint = %self.endpoint,
                ignored,
                "Ignoring non-first matches for path."
            );
        }

        Ok(first)
    }

    /// Extracts the sample for this scrape, if any.
    ///
    /// A missing match or a non-numeric match is logged and yields no sample.
    ///
    /// # Errors
    ///
    /// If the first match is numeric but can't be represented as a 64-bit float, an error is returned.
    pub fn extract(&self, payload: &Payload) -> Result<Option<Sample>, ScrapeError> {
        let number = match self
            .first_match(payload)
            .and_then(|first| check_kind(&self.path, first, is_number, "a number"))
        {
            Ok(number) => number,
            Err(e) => {
                warn!(
                    metric = %self.metric_name,
                    endpoint = %self.endpoint,
                    error = %e,
                    "Skipping value."
                );
                return Ok(None);
            }
        };

        let text = number.raw();
        let value = parse_value(&text).context(Parse {
            path: self.path.to_string(),
            text: text.clone(),
        })?;

        debug!(metric = %self.metric_name, labels = ?self.labels, value, "Metric updated.");
        Ok(Some(Sample::new(self.metric_name.clone(), self.labels.clone(), value)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{definition::ENDPOINT_LABEL, extract::ParseValueError};

    fn endpoint() -> Endpoint {
        Endpoint::new("http://localhost/stats", "app_")
    }

    fn extractor(path: &str) -> ValueExtractor {
        let definition = MetricDefinition::new("x", path).with_label("env", "prod");
        ValueExtractor::from_definition(&definition, &endpoint()).unwrap()
    }

    fn payload(bytes: &[u8]) -> Payload {
        Payload::from_slice(bytes).unwrap()
    }

    #[test]
    fn extracts_number() {
        let sample = extractor("$.x").extract(&payload(br#"{"x":42}"#)).unwrap().unwrap();

        assert_eq!(sample.name(), "app_x");
        assert_eq!(sample.value(), 42.0);
        assert_eq!(sample.labels()["env"], "prod");
        assert_eq!(sample.labels()[ENDPOINT_LABEL], "http://localhost/stats");
        assert_eq!(sample.labels().len(), 2);
    }

    #[test]
    fn skips_non_numeric_match() {
        let sample = extractor("$.x").extract(&payload(br#"{"x":"abc"}"#)).unwrap();
        assert!(sample.is_none());
    }

    #[test]
    fn skips_missing_match() {
        let sample = extractor("$.y").extract(&payload(br#"{"x":1}"#)).unwrap();
        assert!(sample.is_none());
    }

    #[test]
    fn uses_only_first_match() {
        let sample = extractor("$.a[*]").extract(&payload(br#"{"a":[1,2,3]}"#)).unwrap().unwrap();
        assert_eq!(sample.value(), 1.0);
    }

    #[test]
    fn non_numeric_first_match_is_not_skipped_over() {
        // The first match decides the outcome even when a later match would have been numeric.
        let sample = extractor("$.a[*]").extract(&payload(br#"{"a":["x",2]}"#)).unwrap();
        assert!(sample.is_none());
    }

    #[test]
    fn extracts_floats_and_negatives() {
        let extractor = extractor("$.x");
        let sample = extractor.extract(&Payload::from(json!({"x": -1.5e3}))).unwrap().unwrap();
        assert_eq!(sample.value(), -1500.0);
    }

    #[test]
    fn expression_labels_are_left_out() {
        let definition = MetricDefinition::new("x", "$.x")
            .with_label("host", "$.host")
            .with_label("env", "prod");
        let extractor = ValueExtractor::from_definition(&definition, &endpoint()).unwrap();

        let sample = extractor
            .extract(&payload(br#"{"x":3,"host":"db1"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(sample.value(), 3.0);
        assert_eq!(sample.labels().len(), 2);
        assert_eq!(sample.labels()["env"], "prod");
        assert_eq!(sample.labels()[ENDPOINT_LABEL], "http://localhost/stats");

        // The family still declares the label; the registry leaves it empty.
        assert_eq!(
            extractor.family().label_names(),
            &["host".to_string(), "env".to_string(), ENDPOINT_LABEL.to_string()]
        );
    }

    #[test]
    fn out_of_range_number_is_a_parse_error() {
        let err = extractor("$.huge")
            .extract(&payload(br#"{"huge":1e400,"x":5}"#))
            .unwrap_err();

        let ScrapeError::Parse { text, source, .. } = err;
        assert_eq!(text, "1e400");
        assert!(matches!(source, ParseValueError::OutOfRange));

        // Other values in the same payload are unaffected.
        let sample = extractor("$.x").extract(&payload(br#"{"huge":1e400,"x":5}"#)).unwrap().unwrap();
        assert_eq!(sample.value(), 5.0);
    }

    #[test]
    fn rejects_literal_root_path() {
        let definition = MetricDefinition::new("x", "42");
        let err = ValueExtractor::from_definition(&definition, &endpoint()).unwrap_err();
        assert!(matches!(err, ConfigError::LiteralRootPath { .. }));
    }

    #[test]
    fn family_declares_endpoint_label() {
        let family = extractor("$.x").family();
        assert_eq!(family.name(), "app_x");
        assert_eq!(family.help(), "x");
        assert_eq!(family.label_names(), &["env".to_string(), ENDPOINT_LABEL.to_string()]);
    }

    #[test]
    fn repeated_scrapes_are_identical() {
        let extractor = extractor("$.x");
        let payload = payload(br#"{"x":7}"#);

        let first = extractor.extract(&payload).unwrap();
        let second = extractor.extract(&payload).unwrap();
        assert_eq!(first, second);
    }
}
