//! Metric registry.
//!
//! The registry is where extracted samples end up. Metric families must be registered exactly once, with a fixed set of
//! label names, before any sample is recorded for them. Label values vary per sample, but label names never do.
use std::fmt::Write as _;

use indexmap::IndexMap;
use snafu::Snafu;
use tracing::debug;

use crate::extract::{LabelSet, Sample};

const SERIES_LIMIT: usize = 10_000;

/// A registry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// The metric family name is not a valid Prometheus metric name.
    #[snafu(display("Invalid metric name '{}'.", name))]
    InvalidMetricName {
        /// Metric family name.
        name: String,
    },

    /// A label name is not a valid Prometheus label name.
    #[snafu(display("Invalid label name '{}' for metric '{}'.", label, name))]
    InvalidLabelName {
        /// Metric family name.
        name: String,

        /// Label name.
        label: String,
    },

    /// The metric family was already registered.
    #[snafu(display("Metric '{}' is already registered.", name))]
    AlreadyRegistered {
        /// Metric family name.
        name: String,
    },

    /// A sample was recorded for a metric family that was never registered.
    #[snafu(display("Metric '{}' is not registered.", name))]
    UnknownMetric {
        /// Metric family name.
        name: String,
    },

    /// A sample carried a label that its metric family does not declare.
    #[snafu(display("Label '{}' is not declared by metric '{}'.", label, name))]
    UndeclaredLabel {
        /// Metric family name.
        name: String,

        /// Label name.
        label: String,
    },

    /// The registry holds as many series as it is allowed to.
    #[snafu(display("Series limit of {} reached; dropping new series for metric '{}'.", limit, name))]
    SeriesLimit {
        /// Metric family name.
        name: String,

        /// Maximum number of series.
        limit: usize,
    },
}

/// Description of a metric family.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricFamily {
    name: String,
    help: String,
    label_names: Vec<String>,
}

impl MetricFamily {
    /// Creates a new `MetricFamily`.
    pub fn new<N: Into<String>, H: Into<String>>(name: N, help: H, label_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names,
        }
    }

    /// Returns the family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the help text.
    pub fn help(&self) -> &str {
        &self.help
    }

    /// Returns the label names, in declaration order.
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }
}

/// A sink for extracted samples.
pub trait MetricRegistry {
    /// Registers a metric family.
    ///
    /// # Errors
    ///
    /// If the family was already registered, or its name or label names are invalid, an error is returned.
    fn register(&mut self, family: MetricFamily) -> Result<(), RegistryError>;

    /// Records the value of a sample, replacing any previous value for the same label set.
    ///
    /// # Errors
    ///
    /// If the sample's metric family is not registered, or the sample carries undeclared labels, an error is returned.
    fn set(&mut self, sample: &Sample) -> Result<(), RegistryError>;
}

struct GaugeFamily {
    family: MetricFamily,
    series: IndexMap<LabelSet, f64>,
}

/// An in-memory registry of gauges.
///
/// Series are kept in first-seen order, and hold their last recorded value until overwritten. Declared labels missing
/// from a sample are recorded with an empty value, which the exposition format treats the same as an absent label.
///
/// # Limits
///
/// - Number of series across all families is limited to 10,000.
#[derive(Default)]
pub struct GaugeRegistry {
    families: IndexMap<String, GaugeFamily>,
    series: usize,
}

impl GaugeRegistry {
    /// Creates an empty `GaugeRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registered family with the given name, if any.
    pub fn family(&self, name: &str) -> Option<&MetricFamily> {
        self.families.get(name).map(|gauges| &gauges.family)
    }

    /// Returns the current value of the given series, if it has been recorded.
    ///
    /// Labels declared by the family but absent from `labels` are looked up as empty.
    pub fn get(&self, name: &str, labels: &LabelSet) -> Option<f64> {
        let gauges = self.families.get(name)?;
        let key = normalize_labels(&gauges.family, labels).ok()?;
        gauges.series.get(&key).copied()
    }

    /// Returns the total number of series across all families.
    pub fn series_count(&self) -> usize {
        self.series
    }

    /// Renders every family in the Prometheus text exposition format.
    ///
    /// Families without any recorded series are omitted.
    pub fn render(&self) -> String {
        let mut payload = String::new();
        for gauges in self.families.values() {
            if gauges.series.is_empty() {
                debug!("No series for metric '{}'. Skipping.", gauges.family.name());
                continue;
            }

            write_family(&mut payload, gauges);
        }

        payload
    }
}

impl MetricRegistry for GaugeRegistry {
    fn register(&mut self, family: MetricFamily) -> Result<(), RegistryError> {
        if !is_valid_metric_name(family.name()) {
            return Err(RegistryError::InvalidMetricName {
                name: family.name().to_string(),
            });
        }

        if let Some(label) = family.label_names().iter().find(|label| !is_valid_label_name(label)) {
            return Err(RegistryError::InvalidLabelName {
                name: family.name().to_string(),
                label: label.clone(),
            });
        }

        if self.families.contains_key(family.name()) {
            return Err(RegistryError::AlreadyRegistered {
                name: family.name().to_string(),
            });
        }

        self.families.insert(
            family.name().to_string(),
            GaugeFamily {
                family,
                series: IndexMap::new(),
            },
        );
        Ok(())
    }

    fn set(&mut self, sample: &Sample) -> Result<(), RegistryError> {
        let gauges = self
            .families
            .get_mut(sample.name())
            .ok_or_else(|| RegistryError::UnknownMetric {
                name: sample.name().to_string(),
            })?;

        let key = normalize_labels(&gauges.family, sample.labels())?;
        match gauges.series.get_mut(&key) {
            Some(existing) => *existing = sample.value(),
            None => {
                if self.series >= SERIES_LIMIT {
                    return Err(RegistryError::SeriesLimit {
                        name: sample.name().to_string(),
                        limit: SERIES_LIMIT,
                    });
                }

                gauges.series.insert(key, sample.value());
                self.series += 1;
            }
        }

        Ok(())
    }
}

/// Expands `labels` to exactly the family's declared label names.
fn normalize_labels(family: &MetricFamily, labels: &LabelSet) -> Result<LabelSet, RegistryError> {
    if let Some(label) = labels.keys().find(|label| !family.label_names().contains(label)) {
        return Err(RegistryError::UndeclaredLabel {
            name: family.name().to_string(),
            label: label.clone(),
        });
    }

    Ok(family
        .label_names()
        .iter()
        .map(|name| (name.clone(), labels.get(name).cloned().unwrap_or_default()))
        .collect())
}

fn write_family(payload: &mut String, gauges: &GaugeFamily) {
    let family = &gauges.family;

    // Writing to a `String` can't fail.
    let _ = writeln!(payload, "# HELP {} {}", family.name(), escape_help(family.help()));
    let _ = writeln!(payload, "# TYPE {} gauge", family.name());

    for (labels, value) in &gauges.series {
        payload.push_str(family.name());

        let mut has_labels = false;
        for name in family.label_names() {
            let label_value = match labels.get(name) {
                Some(value) if !value.is_empty() => value,
                _ => continue,
            };

            payload.push(if has_labels { ',' } else { '{' });
            let _ = write!(payload, "{}=\"{}\"", name, escape_label_value(label_value));
            has_labels = true;
        }
        if has_labels {
            payload.push('}');
        }

        let _ = writeln!(payload, " {}", format_value(*value));
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn is_valid_metric_name(name: &str) -> bool {
    // Matches a regular expression of [a-zA-Z_:][a-zA-Z0-9_:]*.
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    // Matches a regular expression of [a-zA-Z_][a-zA-Z0-9_]*.
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
