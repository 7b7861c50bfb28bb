//! Request and response types

use serde::{Deserialize, Serialize};
use toolsmith_artifact::{GeneratedCode, OutputKind};

/// A request to build (or reuse) and run a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    /// Natural-language tool description; the cache key
    pub prompt: String,
    /// Runtime input passed to the tool
    #[serde(default)]
    pub input: String,
    /// Discard any cached build first
    #[serde(default)]
    pub force_regenerate: bool,
}

impl ToolRequest {
    /// Create request for a prompt with empty input
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            input: String::new(),
            force_regenerate: false,
        }
    }

    /// With runtime input
    #[must_use]
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    /// Force regeneration
    #[must_use]
    pub fn force(mut self) -> Self {
        self.force_regenerate = true;
        self
    }
}

/// Successful pipeline response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    /// Tool output body
    pub output: String,
    /// Content type reported by the tool
    pub content_type: String,
    /// Declared output kind
    pub output_kind: OutputKind,
    /// Declared output description
    pub output_description: String,
    /// Full prompt hash
    pub tool_hash: String,
    /// Packages the tool imports
    pub packages: Vec<String>,
    /// Whether the build came from the cache
    pub cached: bool,
    /// Generated source, present only on a fresh build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_code: Option<GeneratedCode>,
    /// Non-fatal problems (cache write failures, gate warnings)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}
