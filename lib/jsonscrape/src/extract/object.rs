use indexmap::IndexMap;
use tracing::{debug, error, warn};

use super::{
    check_kind, first_of_kind, is_container, is_number, parse_value, LabelSet, Payload, Sample, ValueExtractor,
};
use crate::{
    definition::{ConfigError, Endpoint, MetricDefinition},
    path::{CompiledPath, ValueSpec},
    registry::MetricFamily,
};

/// Extracts a family of related values, sharing one dynamic label set, from a single matched object or array.
///
/// Label and sub-metric expressions are evaluated relative to the matched node. Each label and each sub-metric is
/// resolved independently: one that can't be resolved is logged and left out, without affecting the others.
#[derive(Clone, Debug)]
pub struct ObjectExtractor {
    root: ValueExtractor,
    label_paths: IndexMap<String, CompiledPath>,
    values: Vec<SubMetric>,
}

#[derive(Clone, Debug)]
struct SubMetric {
    name: String,
    metric_name: String,
    spec: ValueSpec,
}

impl ObjectExtractor {
    pub(super) fn from_definition(definition: &MetricDefinition, endpoint: &Endpoint) -> Result<Self, ConfigError> {
        let root = ValueExtractor::root(definition, endpoint)?;

        let mut label_paths = IndexMap::new();
        for (label, raw) in definition.labels() {
            if let ValueSpec::Expression(path) = classify(definition, "labels", label, raw)? {
                label_paths.insert(label.clone(), path);
            }
        }

        let mut values = Vec::with_capacity(definition.values().len());
        for (name, raw) in definition.values() {
            values.push(SubMetric {
                name: name.clone(),
                metric_name: format!("{}_{}", root.metric_name(), name),
                spec: classify(definition, "values", name, raw)?,
            });
        }

        Ok(Self {
            root,
            label_paths,
            values,
        })
    }

    /// Returns the extractor for the root path.
    pub fn root(&self) -> &ValueExtractor {
        &self.root
    }

    /// Returns the names of the metric families this extractor produces, one per sub-metric.
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|sub| sub.metric_name.as_str())
    }

    pub(super) fn families(&self) -> Vec<MetricFamily> {
        self.values
            .iter()
            .map(|sub| {
                MetricFamily::new(
                    sub.metric_name.clone(),
                    format!("{} - {}", self.root.help(), sub.name),
                    self.root.label_names().to_vec(),
                )
            })
            .collect()
    }

    /// Extracts all resolvable samples for this scrape.
    pub fn extract(&self, payload: &Payload) -> Vec<Sample> {
        let container = match self
            .root
            .first_match(payload)
            .and_then(|first| check_kind(self.root.path(), first, is_container, "an object or array"))
        {
            Ok(container) => container,
            Err(e) => {
                warn!(
                    metric = %self.root.metric_name(),
                    endpoint = %self.root.endpoint(),
                    error = %e,
                    "Skipping object."
                );
                return Vec::new();
            }
        };
        let node = container.node();

        let labels = self.resolve_labels(node);

        let mut samples = Vec::with_capacity(self.values.len());
        for sub in &self.values {
            if let Some(value) = self.resolve_value(sub, node) {
                debug!(metric = %sub.metric_name, labels = ?labels, value, "Metric updated.");
                samples.push(Sample::new(sub.metric_name.clone(), labels.clone(), value));
            }
        }

        samples
    }

    fn resolve_labels(&self, node: &serde_json::Value) -> LabelSet {
        let mut labels = self.root.labels().clone();
        for (label, path) in &self.label_paths {
            match path.first_match(node) {
                Some(found) => {
                    labels.insert(label.clone(), found.label_value());
                }
                None => warn!(
                    metric = %self.root.metric_name(),
                    endpoint = %self.root.endpoint(),
                    label = %label,
                    path = %path,
                    "Could not find value for label path."
                ),
            }
        }

        labels
    }

    fn resolve_value(&self, sub: &SubMetric, node: &serde_json::Value) -> Option<f64> {
        match &sub.spec {
            ValueSpec::Literal(raw) => match parse_value(raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!(
                        metric = %sub.metric_name,
                        value = %raw,
                        error = %e,
                        "Could not use configured value as float."
                    );
                    None
                }
            },
            ValueSpec::Expression(path) => {
                let number = match first_of_kind(path, node, is_number, "a number") {
                    Ok(number) => number,
                    Err(e) => {
                        warn!(
                            metric = %sub.metric_name,
                            endpoint = %self.root.endpoint(),
                            error = %e,
                            "Skipping sub-metric."
                        );
                        return None;
                    }
                };

                let text = number.raw();
                match parse_value(&text) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        error!(
                            metric = %sub.metric_name,
                            path = %path,
                            value = %text,
                            error = %e,
                            "Could not parse numerical value as float."
                        );
                        None
                    }
                }
            }
        }
    }
}

fn classify(definition: &MetricDefinition, section: &str, key: &str, raw: &str) -> Result<ValueSpec, ConfigError> {
    ValueSpec::classify(raw).map_err(|source| ConfigError::InvalidPath {
        metric: definition.name().to_string(),
        field: format!("{}.{}", section, key),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ScrapeKind, ENDPOINT_LABEL};

    fn endpoint() -> Endpoint {
        Endpoint::new("http://localhost/users", "")
    }

    fn object(definition: MetricDefinition) -> ObjectExtractor {
        ObjectExtractor::from_definition(&definition.with_kind(ScrapeKind::Object), &endpoint()).unwrap()
    }

    fn payload(bytes: &[u8]) -> Payload {
        Payload::from_slice(bytes).unwrap()
    }

    #[test]
    fn resolves_labels_and_values() {
        let extractor = object(
            MetricDefinition::new("user", "$")
                .with_label("user", "$.id")
                .with_value("score", "$.score"),
        );

        let samples = extractor.extract(&payload(br#"{"id":"u1","score":7}"#));
        assert_eq!(samples.len(), 1);

        let sample = &samples[0];
        assert_eq!(sample.name(), "user_score");
        assert_eq!(sample.value(), 7.0);
        assert_eq!(sample.labels()["user"], "u1");
        assert_eq!(sample.labels()[ENDPOINT_LABEL], "http://localhost/users");
    }

    #[test]
    fn missing_label_is_left_unset() {
        let extractor = object(
            MetricDefinition::new("user", "$")
                .with_label("user", "$.id")
                .with_label("team", "$.team")
                .with_value("score", "$.score"),
        );

        let samples = extractor.extract(&payload(br#"{"id":"u1","score":7}"#));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels()["user"], "u1");
        assert!(!samples[0].labels().contains_key("team"));
    }

    #[test]
    fn literal_labels_and_values_pass_through() {
        let extractor = object(
            MetricDefinition::new("svc", "$.service")
                .with_label("env", "prod")
                .with_value("up", "1")
                .with_value("broken", "not-a-number")
                .with_value("latency", "$.latency"),
        );

        let samples = extractor.extract(&payload(br#"{"service":{"latency":0.25}}"#));
        let names = samples.iter().map(Sample::name).collect::<Vec<_>>();
        assert_eq!(names, vec!["svc_up", "svc_latency"]);

        assert_eq!(samples[0].value(), 1.0);
        assert_eq!(samples[1].value(), 0.25);
        assert!(samples.iter().all(|s| s.labels()["env"] == "prod"));
    }

    #[test]
    fn failed_sub_metrics_do_not_block_others() {
        let extractor = object(
            MetricDefinition::new("stats", "$")
                .with_value("missing", "$.nope")
                .with_value("text", "$.name")
                .with_value("count", "$.count"),
        );

        let samples = extractor.extract(&payload(br#"{"name":"a","count":3}"#));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name(), "stats_count");
        assert_eq!(samples[0].value(), 3.0);
    }

    #[test]
    fn out_of_range_sub_metric_is_skipped() {
        let extractor = object(
            MetricDefinition::new("disk", "$")
                .with_label("device", "$.device")
                .with_value("huge", "$.huge")
                .with_value("used", "$.used"),
        );

        let samples = extractor.extract(&payload(br#"{"device":"sda","huge":1e400,"used":12}"#));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name(), "disk_used");
        assert_eq!(samples[0].value(), 12.0);
        assert_eq!(samples[0].labels()["device"], "sda");
    }

    #[test]
    fn non_string_labels_use_raw_text() {
        let extractor = object(
            MetricDefinition::new("shard", "$.shards[*]")
                .with_label("id", "$.id")
                .with_value("size", "$.size"),
        );

        let samples = extractor.extract(&payload(br#"{"shards":[{"id":3,"size":10},{"id":4,"size":20}]}"#));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels()["id"], "3");
        assert_eq!(samples[0].value(), 10.0);
    }

    #[test]
    fn scalar_root_is_skipped() {
        let extractor = object(MetricDefinition::new("x", "$.x").with_value("v", "$.v"));
        assert!(extractor.extract(&payload(br#"{"x":5}"#)).is_empty());
    }

    #[test]
    fn array_root_is_accepted() {
        let extractor = object(MetricDefinition::new("list", "$.items").with_value("first", "$[0]"));

        let samples = extractor.extract(&payload(br#"{"items":[9,8]}"#));
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value(), 9.0);
    }

    #[test]
    fn families_cover_every_sub_metric() {
        let extractor = object(
            MetricDefinition::new("user", "$")
                .with_help("Users")
                .with_label("user", "$.id")
                .with_value("score", "$.score")
                .with_value("age", "$.age"),
        );

        let families = extractor.families();
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].name(), "user_score");
        assert_eq!(families[0].help(), "Users - score");
        assert_eq!(families[1].name(), "user_age");
        assert_eq!(families[1].label_names(), &["user".to_string(), ENDPOINT_LABEL.to_string()]);
    }

    #[test]
    fn invalid_value_path_is_a_config_error() {
        let definition = MetricDefinition::new("x", "$")
            .with_kind(ScrapeKind::Object)
            .with_value("v", "$.[");
        let err = ObjectExtractor::from_definition(&definition, &endpoint()).unwrap_err();

        match err {
            ConfigError::InvalidPath { field, .. } => assert_eq!(field, "values.v"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
