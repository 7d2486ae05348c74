//! Metric definitions and endpoints.
use std::{fmt, io, path::Path, path::PathBuf, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use snafu::{ResultExt as _, Snafu};

use crate::{path::CompileError, registry::RegistryError};

/// Label name reserved for the endpoint a sample was scraped from.
///
/// Every metric family declares it, and every sample carries the endpoint URL under it.
pub const ENDPOINT_LABEL: &str = "endpoint";

/// A configuration error.
///
/// Configuration errors are only raised at startup, and are fatal.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    Io {
        /// Path to the file.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// A configuration file was not valid YAML, or did not have the expected shape.
    #[snafu(display("Failed to parse '{}': {}", path.display(), source))]
    Yaml {
        /// Path to the file.
        path: PathBuf,

        /// Error source.
        source: serde_yaml::Error,
    },

    /// A metric definition had an empty name.
    #[snafu(display("Metric definition is missing a name."))]
    EmptyName,

    /// A metric definition referenced an unknown scrape type.
    #[snafu(display("Unknown scrape type '{}'; expected 'value' or 'object'.", kind))]
    UnknownScrapeKind {
        /// Scrape type as written in the configuration.
        kind: String,
    },

    /// A metric definition's root path was a literal rather than a path expression.
    #[snafu(display("Root path '{}' for metric '{}' must be a path expression starting with '$'.", path, metric))]
    LiteralRootPath {
        /// Metric name.
        metric: String,

        /// Root path as written in the configuration.
        path: String,
    },

    /// A path expression in a metric definition failed to compile.
    #[snafu(display("Invalid path for '{}' in metric '{}': {}", field, metric, source))]
    InvalidPath {
        /// Metric name.
        metric: String,

        /// Definition field holding the path, such as `path` or `labels.user`.
        field: String,

        /// Error source.
        source: CompileError,
    },

    /// A metric definition declared a reserved label name.
    #[snafu(display("Label '{}' of metric '{}' is reserved.", label, metric))]
    ReservedLabel {
        /// Metric name.
        metric: String,

        /// Label name.
        label: String,
    },

    /// Two definitions resolved to the same metric family with different label names.
    #[snafu(display(
        "Metric family '{}' is declared more than once with different labels ({:?} vs {:?}).",
        name,
        existing,
        conflicting
    ))]
    ConflictingFamily {
        /// Metric family name.
        name: String,

        /// Label names of the first declaration.
        existing: Vec<String>,

        /// Label names of the conflicting declaration.
        conflicting: Vec<String>,
    },

    /// The registry rejected a metric family.
    #[snafu(display("Failed to register metric family: {}", source))]
    Registration {
        /// Error source.
        source: RegistryError,
    },
}

/// How a metric definition is scraped.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String")]
pub enum ScrapeKind {
    /// The root path resolves to a single number.
    #[default]
    Value,

    /// The root path resolves to an object or array, from which labels and sub-metric values are resolved.
    Object,
}

impl ScrapeKind {
    /// Returns the configuration name of this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ScrapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrapeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "value" => Ok(Self::Value),
            "object" => Ok(Self::Object),
            other => Err(ConfigError::UnknownScrapeKind { kind: other.to_string() }),
        }
    }
}

impl TryFrom<String> for ScrapeKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Definition of a single metric.
///
/// Definitions are loaded once at startup, and are immutable afterwards. Label and value mappings keep their
/// declaration order.
#[derive(Clone, Debug, Deserialize)]
pub struct MetricDefinition {
    name: String,
    path: String,

    #[serde(default, deserialize_with = "deserialize_scalar_map")]
    labels: IndexMap<String, String>,

    #[serde(default, rename = "type")]
    kind: ScrapeKind,

    #[serde(default)]
    help: Option<String>,

    #[serde(default, deserialize_with = "deserialize_scalar_map")]
    values: IndexMap<String, String>,
}

impl MetricDefinition {
    /// Creates a new value-type `MetricDefinition` with the given name and root path.
    pub fn new<N, P>(name: N, path: P) -> Self
    where
        N: Into<String>,
        P: Into<String>,
    {
        Self {
            name: name.into(),
            path: path.into(),
            labels: IndexMap::new(),
            kind: ScrapeKind::Value,
            help: None,
            values: IndexMap::new(),
        }
    }

    /// Sets the scrape kind.
    pub fn with_kind(mut self, kind: ScrapeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the help text.
    pub fn with_help<H: Into<String>>(mut self, help: H) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Adds a label, either literal or a path expression.
    pub fn with_label<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Adds a sub-metric value, either literal or a path expression.
    ///
    /// Only used by object-type definitions.
    pub fn with_value<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Returns the metric name, without any endpoint prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the raw root path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the scrape kind.
    pub fn kind(&self) -> ScrapeKind {
        self.kind
    }

    /// Returns the help text, falling back to the metric name when none was configured.
    pub fn help(&self) -> &str {
        match self.help.as_deref() {
            Some(help) if !help.is_empty() => help,
            _ => &self.name,
        }
    }

    /// Returns the raw label mapping.
    pub fn labels(&self) -> &IndexMap<String, String> {
        &self.labels
    }

    /// Returns the raw sub-metric value mapping.
    pub fn values(&self) -> &IndexMap<String, String> {
        &self.values
    }

    /// Returns the label names of every metric family produced by this definition.
    ///
    /// This is the declared label names, in declaration order, followed by [`ENDPOINT_LABEL`].
    pub fn label_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.labels.len() + 1);
        names.extend(self.labels.keys().cloned());
        names.push(ENDPOINT_LABEL.to_string());
        names
    }

    /// Checks the parts of the definition that don't depend on path compilation.
    ///
    /// # Errors
    ///
    /// If the name is empty, or a reserved label name is declared, an error is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        if self.labels.contains_key(ENDPOINT_LABEL) {
            return Err(ConfigError::ReservedLabel {
                metric: self.name.clone(),
                label: ENDPOINT_LABEL.to_string(),
            });
        }

        Ok(())
    }
}

/// A JSON endpoint to scrape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    url: String,
    prefix: String,
}

impl Endpoint {
    /// Creates a new `Endpoint`.
    pub fn new<U: Into<String>, P: Into<String>>(url: U, prefix: P) -> Self {
        Self {
            url: url.into(),
            prefix: prefix.into(),
        }
    }

    /// Returns the URL to fetch.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the prefix prepended to the name of every metric scraped from this endpoint.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// An endpoint entry, as written in the endpoints file.
#[derive(Clone, Debug, Deserialize)]
pub struct EndpointEntry {
    url: String,

    #[serde(default)]
    prefix: Option<String>,
}

impl EndpointEntry {
    /// Resolves this entry into an [`Endpoint`], using `default_prefix` when the entry has no prefix of its own.
    pub fn into_endpoint(self, default_prefix: &str) -> Endpoint {
        let prefix = self.prefix.unwrap_or_else(|| default_prefix.to_string());
        Endpoint::new(self.url, prefix)
    }
}

/// Parses a YAML list of metric definitions.
///
/// # Errors
///
/// If the document is not a valid list of definitions, or any definition fails validation, an error is returned.
pub fn parse_definitions(source: &str, origin: &Path) -> Result<Vec<MetricDefinition>, ConfigError> {
    let definitions: Vec<MetricDefinition> = serde_yaml::from_str(source).context(Yaml { path: origin })?;
    for definition in &definitions {
        definition.validate()?;
    }

    Ok(definitions)
}

/// Loads metric definitions from the given YAML file.
///
/// # Errors
///
/// If the file cannot be read or parsed, or any definition fails validation, an error is returned.
pub fn load_definitions<P: AsRef<Path>>(path: P) -> Result<Vec<MetricDefinition>, ConfigError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).context(Io { path })?;
    parse_definitions(&source, path)
}

/// Parses a YAML list of endpoint entries.
///
/// # Errors
///
/// If the document is not a valid list of endpoint entries, an error is returned.
pub fn parse_endpoints(source: &str, origin: &Path, default_prefix: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let entries: Vec<EndpointEntry> = serde_yaml::from_str(source).context(Yaml { path: origin })?;
    Ok(entries
        .into_iter()
        .map(|entry| entry.into_endpoint(default_prefix))
        .collect())
}

/// Loads endpoints from the given YAML file.
///
/// # Errors
///
/// If the file cannot be read or parsed, an error is returned.
pub fn load_endpoints<P: AsRef<Path>>(path: P, default_prefix: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).context(Io { path })?;
    parse_endpoints(&source, path, default_prefix)
}

/// A scalar configuration value.
///
/// Label and value mappings are string-to-string, but YAML authors routinely write bare numbers and booleans (`count:
/// 1`), so any scalar is accepted and kept in its textual form.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<Scalar> for String {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::String(s) => s,
            Scalar::Integer(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn deserialize_scalar_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<IndexMap<String, Scalar>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| (name, String::from(value)))
        .collect())
}
