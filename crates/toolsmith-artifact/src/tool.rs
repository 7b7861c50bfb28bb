//! Tool artifacts
//!
//! The persisted [`CachedTool`] and the transient values that flow through
//! the pipeline around it ([`GeneratedCode`], [`ExecutionResult`]).

use crate::hash::PromptHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Declared kind of a tool's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Plain text
    Text,
    /// JSON document
    Json,
    /// HTML fragment or document
    Html,
    /// Raster image (binary body or data URL)
    Image,
    /// SVG document
    Svg,
    /// Comma-separated values
    Csv,
    /// XML document
    Xml,
}

impl OutputKind {
    /// All kinds, in declaration order
    pub const ALL: [OutputKind; 7] = [
        OutputKind::Text,
        OutputKind::Json,
        OutputKind::Html,
        OutputKind::Image,
        OutputKind::Svg,
        OutputKind::Csv,
        OutputKind::Xml,
    ];

    /// Lowercase name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Text => "text",
            OutputKind::Json => "json",
            OutputKind::Html => "html",
            OutputKind::Image => "image",
            OutputKind::Svg => "svg",
            OutputKind::Csv => "csv",
            OutputKind::Xml => "xml",
        }
    }

    /// Content type a tool of this kind is expected to serve
    #[inline]
    #[must_use]
    pub fn default_content_type(&self) -> &'static str {
        match self {
            OutputKind::Text => "text/plain; charset=utf-8",
            OutputKind::Json => "application/json",
            OutputKind::Html => "text/html; charset=utf-8",
            OutputKind::Image => "image/png",
            OutputKind::Svg => "image/svg+xml",
            OutputKind::Csv => "text/csv; charset=utf-8",
            OutputKind::Xml => "application/xml",
        }
    }

    /// Whether output of this kind is free-form text
    ///
    /// Free-form output is where an embedded error message is most likely
    /// to masquerade as a result.
    #[inline]
    #[must_use]
    pub fn is_text_like(&self) -> bool {
        matches!(self, OutputKind::Text | OutputKind::Csv)
    }
}

impl Default for OutputKind {
    fn default() -> Self {
        OutputKind::Text
    }
}

impl Display for OutputKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = UnknownOutputKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        OutputKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or(UnknownOutputKind(lowered))
    }
}

/// Unrecognized output kind name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown output kind: '{0}'")]
pub struct UnknownOutputKind(pub String);

/// How a generated module exposed its entry point before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolEntry {
    /// `export default { fetch(request) { ... } }`
    DefaultFetch,
    /// `export default function (input) { ... }`
    DefaultFunction,
    /// `export function handle(input) { ... }`
    NamedHandle,
}

/// Candidate code returned by the code generator
///
/// Transient: consumed by the compiler and discarded once a [`CachedTool`]
/// is derived or the attempt fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedCode {
    /// Candidate module source
    pub source: String,
    /// Input the generator expects the tool to handle
    #[serde(default)]
    pub example_input: String,
    /// Declared output kind
    #[serde(default)]
    pub output_kind: OutputKind,
    /// Human-readable description of the output
    #[serde(default)]
    pub output_description: String,
}

impl GeneratedCode {
    /// Create generated code with default metadata
    #[inline]
    #[must_use]
    pub fn new(source: impl Into<String>, output_kind: OutputKind) -> Self {
        Self {
            source: source.into(),
            example_input: String::new(),
            output_kind,
            output_description: String::new(),
        }
    }

    /// With example input
    #[inline]
    #[must_use]
    pub fn with_example_input(mut self, input: impl Into<String>) -> Self {
        self.example_input = input.into();
        self
    }

    /// With output description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.output_description = description.into();
        self
    }
}

/// A validated, compiled tool
///
/// Only ever written after validation succeeds; never updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTool {
    /// Prompt hash this tool was built for
    pub hash: PromptHash,
    /// Self-contained executable module
    pub bundled_code: String,
    /// When the tool was validated and stored
    pub created_at: DateTime<Utc>,
    /// Resolved external packages, in first-import order
    pub packages: Vec<String>,
    /// Declared output kind
    pub output_kind: OutputKind,
    /// Human-readable description of the output
    pub output_description: String,
    /// Original entry shape of the generated module
    pub entry: ToolEntry,
}

impl CachedTool {
    /// Object-store key for this tool (`tools/<hash>.json`)
    #[inline]
    #[must_use]
    pub fn object_key(hash: &PromptHash) -> String {
        format!("tools/{hash}.json")
    }

    /// Serialize to the persisted JSON layout
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Deserialize from the persisted JSON layout
    ///
    /// # Errors
    /// Returns error if the bytes are not a valid serialized tool
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Result of one execution of a tool
///
/// Never persisted; recomputed from the cached artifact for every input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Response body
    pub output: String,
    /// Content type the tool declared for its response
    pub content_type: String,
    /// Hosts the tool contacted, in request order
    #[serde(default)]
    pub egress: Vec<String>,
    /// Wall-clock duration in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Create result with no recorded egress
    #[inline]
    #[must_use]
    pub fn new(output: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            content_type: content_type.into(),
            egress: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Media type without parameters, lowercased (`text/html; charset=utf-8` → `text/html`)
    #[must_use]
    pub fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}
