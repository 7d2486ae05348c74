//! Sample extraction.
//!
//! A [`PreparedScraper`] binds one [`MetricDefinition`] to one [`Endpoint`], with every path expression compiled up
//! front. Scraping a decoded [`Payload`] yields zero or more [`Sample`]s; the scraper itself holds no state between
//! scrapes, so identical payloads always produce identical samples.
use std::{collections::BTreeMap, num::ParseFloatError};

use serde_json::Value;
use snafu::{ensure, ResultExt as _, Snafu};

use crate::{
    definition::{ConfigError, Endpoint, MetricDefinition, ScrapeKind, ENDPOINT_LABEL},
    path::{CompiledPath, Match, MatchKind},
    registry::MetricFamily,
};

mod object;
pub use self::object::ObjectExtractor;

mod value;
pub use self::value::ValueExtractor;

/// A set of labels identifying one series within a metric family.
pub type LabelSet = BTreeMap<String, String>;

/// A single extracted sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    name: String,
    labels: LabelSet,
    value: f64,
}

impl Sample {
    /// Creates a new `Sample`.
    pub fn new<N: Into<String>>(name: N, labels: LabelSet, value: f64) -> Self {
        Self {
            name: name.into(),
            labels,
            value,
        }
    }

    /// Returns the metric family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the labels.
    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Returns the value.
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// A failure to resolve a node from a payload.
///
/// Extraction errors are always recoverable: the affected sample, label or sub-metric is skipped and the error is
/// logged.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ExtractError {
    /// The payload was not valid JSON.
    #[snafu(display("Payload is not valid JSON: {}", source))]
    InvalidPayload {
        /// Error source.
        source: serde_json::Error,
    },

    /// The path expression did not match anything.
    #[snafu(display("No value found for path '{}'.", path))]
    NoMatch {
        /// Canonical path expression.
        path: String,
    },

    /// The path expression matched a node of the wrong type.
    #[snafu(display("Expected {} for path '{}', found {} ({}).", expected, path, actual, raw))]
    UnexpectedKind {
        /// Canonical path expression.
        path: String,

        /// Description of the accepted kinds.
        expected: &'static str,

        /// Kind of the matched node.
        actual: MatchKind,

        /// Raw text of the matched node.
        raw: String,
    },
}

/// A scrape failure surfaced to the caller.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ScrapeError {
    /// A numeric match could not be parsed as a 64-bit float.
    #[snafu(display("Failed to parse value '{}' for path '{}' as float: {}", text, path, source))]
    Parse {
        /// Canonical path expression.
        path: String,

        /// Matched text.
        text: String,

        /// Error source.
        source: ParseValueError,
    },
}

/// A failure to turn numeric text into a 64-bit float.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParseValueError {
    /// The text is not a number.
    #[snafu(display("{}", source))]
    Malformed {
        /// Error source.
        source: ParseFloatError,
    },

    /// The number is too large in magnitude to be represented.
    #[snafu(display("number out of range"))]
    OutOfRange,
}

/// A decoded JSON payload.
///
/// Each fetched document is decoded once and shared by every scraper bound to the endpoint it came from.
#[derive(Clone, Debug)]
pub struct Payload {
    document: Value,
}

impl Payload {
    /// Decodes a payload from raw bytes.
    ///
    /// Numbers keep their source text, so a number that doesn't fit in a 64-bit float only fails the values that
    /// read it.
    ///
    /// # Errors
    ///
    /// If the bytes are not valid JSON, an error is returned.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ExtractError> {
        let document = serde_json::from_slice(bytes).context(InvalidPayload)?;
        Ok(Self { document })
    }

    /// Returns the root of the document.
    pub fn document(&self) -> &Value {
        &self.document
    }
}

impl From<Value> for Payload {
    fn from(document: Value) -> Self {
        Self { document }
    }
}

/// Extraction strategy for a scraper.
#[derive(Clone, Debug)]
pub enum Extractor {
    /// Single value per scrape.
    Value(ValueExtractor),

    /// Labels and sub-metric values resolved from one matched object or array.
    Object(ObjectExtractor),
}

/// A metric definition bound to an endpoint, ready to scrape.
#[derive(Clone, Debug)]
pub struct PreparedScraper {
    metric_name: String,
    endpoint: Endpoint,
    extractor: Extractor,
}

impl PreparedScraper {
    /// Compiles the given definition for the given endpoint.
    ///
    /// # Errors
    ///
    /// If the definition is invalid, or any of its path expressions fail to compile, an error is returned.
    pub fn prepare(definition: &MetricDefinition, endpoint: &Endpoint) -> Result<Self, ConfigError> {
        definition.validate()?;

        let extractor = match definition.kind() {
            ScrapeKind::Value => Extractor::Value(ValueExtractor::from_definition(definition, endpoint)?),
            ScrapeKind::Object => Extractor::Object(ObjectExtractor::from_definition(definition, endpoint)?),
        };

        Ok(Self {
            metric_name: format!("{}{}", endpoint.prefix(), definition.name()),
            endpoint: endpoint.clone(),
            extractor,
        })
    }

    /// Returns the metric name, including the endpoint prefix.
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Returns the endpoint this scraper is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the extraction strategy.
    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Returns every metric family this scraper produces samples for.
    pub fn families(&self) -> Vec<MetricFamily> {
        match &self.extractor {
            Extractor::Value(extractor) => vec![extractor.family()],
            Extractor::Object(extractor) => extractor.families(),
        }
    }

    /// Scrapes the given payload.
    ///
    /// # Errors
    ///
    /// If a value-type scrape matches a number that cannot be parsed as a float, an error is returned. All other
    /// failures are logged and result in fewer samples.
    pub fn scrape(&self, payload: &Payload) -> Result<Vec<Sample>, ScrapeError> {
        match &self.extractor {
            Extractor::Value(extractor) => Ok(extractor.extract(payload)?.into_iter().collect()),
            Extractor::Object(extractor) => Ok(extractor.extract(payload)),
        }
    }
}

/// Static labels shared by every sample of a definition bound to an endpoint.
///
/// Only literal labels are included, along with the reserved endpoint label.
fn static_labels(definition: &MetricDefinition, endpoint: &Endpoint) -> LabelSet {
    let mut labels = definition
        .labels()
        .iter()
        .filter(|(_, raw)| !crate::path::is_expression(raw))
        .map(|(name, raw)| (name.clone(), raw.clone()))
        .collect::<LabelSet>();
    labels.insert(ENDPOINT_LABEL.to_string(), endpoint.url().to_string());
    labels
}

/// Resolves the first match of `path` within `node`, requiring it to be of an accepted kind.
fn first_of_kind<'a>(
    path: &CompiledPath, node: &'a Value, accept: fn(MatchKind) -> bool, expected: &'static str,
) -> Result<Match<'a>, ExtractError> {
    let first = path.first_match(node).ok_or_else(|| ExtractError::NoMatch {
        path: path.to_string(),
    })?;
    check_kind(path, first, accept, expected)
}

fn check_kind<'a>(
    path: &CompiledPath, candidate: Match<'a>, accept: fn(MatchKind) -> bool, expected: &'static str,
) -> Result<Match<'a>, ExtractError> {
    if accept(candidate.kind()) {
        Ok(candidate)
    } else {
        Err(ExtractError::UnexpectedKind {
            path: path.to_string(),
            expected,
            actual: candidate.kind(),
            raw: candidate.raw(),
        })
    }
}

fn is_number(kind: MatchKind) -> bool {
    kind == MatchKind::Number
}

fn is_container(kind: MatchKind) -> bool {
    kind.is_container()
}

/// Parses numeric text as a 64-bit float.
///
/// Explicit spellings of infinity and NaN are accepted. Digits that overflow to infinity are rejected.
fn parse_value(text: &str) -> Result<f64, ParseValueError> {
    let text = text.trim();
    let value = text.parse::<f64>().context(Malformed)?;
    ensure!(value.is_finite() || !text.bytes().any(|b| b.is_ascii_digit()), OutOfRange);
    Ok(value)
}
