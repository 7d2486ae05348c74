//! Path expressions.
//!
//! Every configured string is either a literal value or a path expression. Path expressions are recognized by their
//! leading `$` and are compiled once at startup into a [`CompiledPath`], which always exposes first-match semantics: no
//! matter how ambiguous the original expression is, consumers only ever act on the first match and treat any others as
//! surplus.
//!
//! The grammar itself is RFC 9535 JSONPath, as implemented by `serde_json_path`. On top of that grammar, the canonical
//! form of a compiled expression carries a trailing `+` qualifier, which marks it as a single-result expression.
//! Authors may write the qualifier themselves or leave it off; both forms compile to the same thing.
use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;
use serde_json_path::JsonPath;
use snafu::{ResultExt as _, Snafu};

/// Leading character that marks a configured string as a path expression.
pub const EXPRESSION_MARKER: char = '$';

/// Trailing qualifier that marks a path expression as yielding only its first match.
pub const FIRST_MATCH_QUALIFIER: char = '+';

/// A path compilation error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CompileError {
    /// The expression was empty.
    #[snafu(display("Path expression must not be empty."))]
    Empty,

    /// The expression was rejected by the grammar.
    #[snafu(display("Failed to parse path expression '{}': {}", expression, source))]
    InvalidGrammar {
        /// Expression as written in the configuration.
        expression: String,

        /// Error source.
        source: serde_json_path::ParseError,
    },
}

/// Returns `true` if the given raw configuration value is a path expression.
pub fn is_expression(raw: &str) -> bool {
    raw.starts_with(EXPRESSION_MARKER)
}

/// Compiles a single path expression.
///
/// The first-match qualifier is appended when missing, so the resulting expression always resolves to a single result.
///
/// # Errors
///
/// If the expression is empty, or the grammar rejects it, an error is returned.
pub fn compile_path(expression: &str) -> Result<CompiledPath, CompileError> {
    if expression.is_empty() {
        return Err(CompileError::Empty);
    }

    let mut canonical = expression.to_string();
    if !canonical.ends_with(FIRST_MATCH_QUALIFIER) {
        canonical.push(FIRST_MATCH_QUALIFIER);
    }

    // The grammar knows nothing about our qualifier, so it only ever sees the bare query.
    let bare = &canonical[..canonical.len() - FIRST_MATCH_QUALIFIER.len_utf8()];
    let query = JsonPath::parse(bare).context(InvalidGrammar { expression })?;

    Ok(CompiledPath { canonical, query })
}

/// Compiles every path expression in the given mapping.
///
/// Entries whose value does not start with [`EXPRESSION_MARKER`] are literals: they are skipped, and do not appear in
/// the returned mapping. Declaration order is preserved.
///
/// # Errors
///
/// If any expression fails to compile, an error is returned.
pub fn compile_paths(mapping: &IndexMap<String, String>) -> Result<IndexMap<String, CompiledPath>, CompileError> {
    let mut compiled = IndexMap::with_capacity(mapping.len());
    for (name, raw) in mapping {
        if !is_expression(raw) {
            continue;
        }

        compiled.insert(name.clone(), compile_path(raw)?);
    }

    Ok(compiled)
}

/// A compiled, single-result path expression.
#[derive(Clone, Debug)]
pub struct CompiledPath {
    canonical: String,
    query: JsonPath,
}

impl CompiledPath {
    /// Returns the canonical form of the expression, including the first-match qualifier.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Evaluates the expression against the given document, returning every match in document order.
    pub fn matches<'a>(&self, document: &'a Value) -> Matches<'a> {
        Matches {
            inner: self.query.query(document).all().into_iter(),
        }
    }

    /// Evaluates the expression against the given document, returning only the first match.
    pub fn first_match<'a>(&self, document: &'a Value) -> Option<Match<'a>> {
        self.matches(document).next()
    }
}

impl fmt::Display for CompiledPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl PartialEq for CompiledPath {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

/// An ordered sequence of path matches.
pub struct Matches<'a> {
    inner: std::vec::IntoIter<&'a Value>,
}

impl<'a> Iterator for Matches<'a> {
    type Item = Match<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(Match::new)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Matches<'_> {}

/// Type of a matched JSON node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchKind {
    /// `null`.
    Null,

    /// `true` or `false`.
    Bool,

    /// Any JSON number.
    Number,

    /// Any JSON string.
    String,

    /// Any JSON array.
    Array,

    /// Any JSON object.
    Object,
}

impl MatchKind {
    /// Returns the name of this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Returns `true` if this kind can hold other nodes.
    pub const fn is_container(&self) -> bool {
        matches!(self, Self::Array | Self::Object)
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single typed match.
#[derive(Clone, Copy, Debug)]
pub struct Match<'a> {
    node: &'a Value,
}

impl<'a> Match<'a> {
    fn new(node: &'a Value) -> Self {
        Self { node }
    }

    /// Returns the type of the matched node.
    pub fn kind(&self) -> MatchKind {
        match self.node {
            Value::Null => MatchKind::Null,
            Value::Bool(_) => MatchKind::Bool,
            Value::Number(_) => MatchKind::Number,
            Value::String(_) => MatchKind::String,
            Value::Array(_) => MatchKind::Array,
            Value::Object(_) => MatchKind::Object,
        }
    }

    /// Returns the matched node.
    pub fn node(&self) -> &'a Value {
        self.node
    }

    /// Returns the matched node as raw JSON text.
    ///
    /// Strings keep their enclosing quotes.
    pub fn raw(&self) -> String {
        self.node.to_string()
    }

    /// Returns the matched node as a label value.
    ///
    /// Strings are unquoted; every other kind is rendered as raw JSON text.
    pub fn label_value(&self) -> String {
        match self.node {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A configured value that is either a literal or a path expression.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueSpec {
    /// A static value, used as-is.
    Literal(String),

    /// A path expression, evaluated per scrape.
    Expression(CompiledPath),
}

impl ValueSpec {
    /// Classifies and, when needed, compiles the given raw configuration value.
    ///
    /// # Errors
    ///
    /// If the value is a path expression that fails to compile, an error is returned.
    pub fn classify(raw: &str) -> Result<Self, CompileError> {
        if is_expression(raw) {
            compile_path(raw).map(Self::Expression)
        } else {
            Ok(Self::Literal(raw.to_string()))
        }
    }
}
