//! Validation gate
//!
//! Runs freshly compiled code once against the generator's example input and
//! rejects output that is empty, looks like a leaked error, or does not match
//! the declared [`OutputKind`]. The checks are heuristics; they are kept loose
//! enough that correct tools are never rejected for formatting quirks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use toolsmith_artifact::{ExecutionResult, OutputKind, PromptHash};
use toolsmith_sandbox::IsolatedExecutor;

/// Lowercase substrings that mark leaked error text
pub const DEFAULT_ERROR_MARKERS: &[&str] = &[
    "error:",
    "exception",
    "traceback",
    "uncaught",
    "referenceerror",
    "typeerror",
    "syntaxerror",
    "[object object]",
    "undefined is not",
];

static HTML_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)<(!doctype\s+html|html|head|body|div|span|p|a|h[1-6]|ul|ol|li|table|tr|td|section|article|main|header|footer|nav|pre|code|img|br|strong|em|form|button|style)[\s>/]",
    )
    .expect("html tag regex is valid")
});

static XML_PROLOG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^(\s*(<\?xml.*?\?>|<!--.*?-->|<!doctype[^>]*>))*\s*")
        .expect("xml prolog regex is valid")
});

/// Which validation check rejected a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    /// Output was empty or whitespace
    EmptyOutput,
    /// Text output contained an error marker
    ErrorOutput,
    /// Output did not match the declared kind
    KindMismatch,
    /// The sanity run itself failed
    Execution,
}

impl ValidationCheck {
    /// snake_case name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyOutput => "empty_output",
            Self::ErrorOutput => "error_output",
            Self::KindMismatch => "kind_mismatch",
            Self::Execution => "execution",
        }
    }
}

impl Display for ValidationCheck {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a validation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Output looks right
    Valid,
    /// Output rejected
    Invalid {
        /// Failed check
        check: ValidationCheck,
        /// Human-readable reason
        error: String,
    },
}

impl Validation {
    fn invalid(check: ValidationCheck, error: impl Into<String>) -> Self {
        Self::Invalid {
            check,
            error: error.into(),
        }
    }

    /// Whether validation passed
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Validation gate
#[derive(Debug, Clone)]
pub struct Validator {
    markers: Vec<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::with_markers(DEFAULT_ERROR_MARKERS.iter().copied())
    }
}

impl Validator {
    /// Create validator with the default error markers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create validator with custom error markers
    pub fn with_markers<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Execute once under the validation key and check the output
    ///
    /// The validation isolate is always evicted afterwards, so production
    /// executions never reuse it.
    pub async fn validate(
        &self,
        executor: &dyn IsolatedExecutor,
        bundled_code: &str,
        example_input: &str,
        declared: OutputKind,
        hash: &PromptHash,
    ) -> Validation {
        let key = hash.validation_key();
        let outcome = executor.execute(bundled_code, example_input, &key).await;
        executor.evict(&key).await;

        match outcome {
            Ok(result) => {
                let validation = self.check_output(&result, declared);
                if let Validation::Invalid { check, error } = &validation {
                    tracing::debug!(hash = %hash.short(), %check, %error, "validation rejected output");
                }
                validation
            }
            Err(e) => {
                tracing::debug!(hash = %hash.short(), error = %e, "validation run failed");
                Validation::invalid(ValidationCheck::Execution, e.to_string())
            }
        }
    }

    /// Check an execution result against a declared kind
    #[must_use]
    pub fn check_output(&self, result: &ExecutionResult, declared: OutputKind) -> Validation {
        let body = result.output.trim();
        if body.is_empty() {
            return Validation::invalid(ValidationCheck::EmptyOutput, "tool produced empty output");
        }

        let media = result.media_type();
        if declared.is_text_like() || media == "text/plain" {
            let lowered = body.to_ascii_lowercase();
            if let Some(marker) = self.markers.iter().find(|m| lowered.contains(m.as_str())) {
                return Validation::invalid(
                    ValidationCheck::ErrorOutput,
                    format!("output contains error marker '{marker}'"),
                );
            }
        }

        if media.ends_with("json") && looks_like_svg(body) {
            return mismatch(declared, OutputKind::Svg);
        }

        let shape_ok = match declared {
            OutputKind::Text | OutputKind::Csv => true,
            OutputKind::Json => serde_json::from_str::<serde_json::Value>(body).is_ok(),
            OutputKind::Svg => looks_like_svg(body),
            OutputKind::Html => looks_like_html(body),
            OutputKind::Xml => body.starts_with('<'),
            OutputKind::Image => {
                media.starts_with("image/") || body.starts_with("data:image/") || looks_like_svg(body)
            }
        };

        if shape_ok {
            Validation::Valid
        } else {
            mismatch(declared, observed_kind(body, &media))
        }
    }
}

fn mismatch(declared: OutputKind, observed: OutputKind) -> Validation {
    Validation::invalid(
        ValidationCheck::KindMismatch,
        format!("declared output kind {declared} but observed {observed}"),
    )
}

fn strip_prolog(body: &str) -> &str {
    match XML_PROLOG.find(body) {
        Some(m) => &body[m.end()..],
        None => body.trim_start(),
    }
}

fn looks_like_svg(body: &str) -> bool {
    strip_prolog(body)
        .get(..4)
        .is_some_and(|head| head.eq_ignore_ascii_case("<svg"))
}

fn looks_like_html(body: &str) -> bool {
    HTML_TAG.is_match(body)
}

/// Best guess at what a body actually is, for mismatch messages
fn observed_kind(body: &str, media: &str) -> OutputKind {
    if looks_like_svg(body) {
        OutputKind::Svg
    } else if body.starts_with('{') || body.starts_with('[') {
        if serde_json::from_str::<serde_json::Value>(body).is_ok() {
            OutputKind::Json
        } else {
            OutputKind::Text
        }
    } else if body.starts_with("data:image/") || media.starts_with("image/") {
        OutputKind::Image
    } else if looks_like_html(body) {
        OutputKind::Html
    } else if body.starts_with('<') {
        OutputKind::Xml
    } else if media == "text/csv" {
        OutputKind::Csv
    } else {
        OutputKind::Text
    }
}
