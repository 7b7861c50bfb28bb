//! Execution errors
//!
//! Every variant means the sandbox itself failed. A tool that computes an
//! error-shaped body still produces a normal [`toolsmith_artifact::ExecutionResult`].

/// Sandbox-level execution failure
///
/// Cloneable so one failed build can be reported to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The runtime process could not be started or prepared
    #[error("sandbox failed to start: {detail}")]
    Spawn { detail: String },

    /// The tool's handler threw, or the module failed to load
    #[error("tool handler failed: {detail}")]
    HandlerFailed { detail: String },

    /// Wall-clock limit exceeded; the process was killed
    #[error("execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Input larger than the configured bound
    #[error("input is {size} bytes, limit is {limit}")]
    InputTooLarge { size: usize, limit: usize },

    /// Output larger than the configured bound; the process was killed
    #[error("output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },

    /// Missing or malformed result envelope
    #[error("sandbox protocol error: {detail}")]
    Protocol { detail: String },

    /// The tool contacted a host outside the network policy
    #[error("egress to '{host}' denied by network policy")]
    EgressDenied { host: String },
}

impl ExecutionError {
    /// Create spawn error
    pub fn spawn(detail: impl Into<String>) -> Self {
        Self::Spawn {
            detail: detail.into(),
        }
    }

    /// Create handler failure
    pub fn handler_failed(detail: impl Into<String>) -> Self {
        Self::HandlerFailed {
            detail: detail.into(),
        }
    }

    /// Create protocol error
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    /// Stable snake_case label
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::Timeout { .. } => "timeout",
            Self::InputTooLarge { .. } => "input_too_large",
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::Protocol { .. } => "protocol",
            Self::EgressDenied { .. } => "egress_denied",
        }
    }
}
