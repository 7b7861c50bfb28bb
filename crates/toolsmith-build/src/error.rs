//! Error types for the build stage
//!
//! Provides error handling for:
//! - Compile operations (scan, resolve, bundle)
//! - Build cache operations (read, write, delete)
//! - Knowledge base loading

use std::path::PathBuf;

/// Errors during compilation
///
/// Cloneable so a single build failure can be handed to every caller that
/// awaited the same build.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// A package import could not be resolved to runnable code
    #[error("resolution failed for package '{package}': {detail}")]
    ResolutionFailed { package: String, detail: String },

    /// Syntax error, missing entry point or bundler failure
    #[error("compile failed: {detail}")]
    CompileFailed { detail: String },
}

impl CompileError {
    /// Create resolution error for package
    pub fn resolution_failed(package: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ResolutionFailed {
            package: package.into(),
            detail: detail.into(),
        }
    }

    /// Create compile failure
    pub fn compile_failed(detail: impl Into<String>) -> Self {
        Self::CompileFailed {
            detail: detail.into(),
        }
    }

    /// Short reason label (`resolution failed` / `compile failed`)
    #[inline]
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ResolutionFailed { .. } => "resolution failed",
            Self::CompileFailed { .. } => "compile failed",
        }
    }

    /// Package that failed to resolve, if any
    #[inline]
    #[must_use]
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::ResolutionFailed { package, .. } => Some(package),
            Self::CompileFailed { .. } => None,
        }
    }
}

/// Errors during build cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Backing store unreachable
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// IO error on the object store
    #[error("io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Stored object could not be decoded
    #[error("corrupt cache object {key}: {detail}")]
    Corrupt { key: String, detail: String },

    /// Tool could not be encoded for storage
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Create IO error for key
    pub fn io_error(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }
}

/// Errors loading a package knowledge base file
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeBaseError {
    /// IO error reading the file
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML format error
    #[error("invalid knowledge base toml: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON format error
    #[error("invalid knowledge base json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display() {
        let err = CompileError::resolution_failed("left-pad", "404 Not Found");
        assert_eq!(
            err.to_string(),
            "resolution failed for package 'left-pad': 404 Not Found"
        );
        assert_eq!(err.reason(), "resolution failed");
        assert_eq!(err.package(), Some("left-pad"));
    }

    #[test]
    fn compile_failed_has_no_package() {
        let err = CompileError::compile_failed("unexpected token at 3:7");
        assert_eq!(err.reason(), "compile failed");
        assert_eq!(err.package(), None);
    }

    #[test]
    fn cache_error_display() {
        let err = CacheError::Corrupt {
            key: "tools/abc.json".to_string(),
            detail: "expected value".to_string(),
        };
        assert!(err.to_string().contains("tools/abc.json"));
    }
}
