//! Toolsmith Core - prompt-to-tool pipeline
//!
//! Turns a natural-language tool description into a cached, validated,
//! sandboxed tool and runs it:
//! - Generates candidate code through a pluggable [`CodeGenerator`]
//! - Refuses packages the isolate cannot run before compiling
//! - Validates compiled code with a sanity run before caching it
//! - Shares one build between concurrent requests for the same prompt
//! - Executes every request in an isolated runtime
//!
//! # Example
//!
//! ```rust,ignore
//! use toolsmith_core::{Orchestrator, ToolRequest, ToolsmithConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ToolsmithConfig::default().apply_env();
//! let orchestrator = Orchestrator::from_config(&config)?;
//!
//! let request = ToolRequest::new("Convert markdown to HTML").with_input("# Hello");
//! let response = orchestrator.run(request).await?;
//!
//! println!("{} ({})", response.output, response.content_type);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod generator;
pub mod inflight;
pub mod orchestrator;
pub mod types;
pub mod validator;

// Re-exports for convenience
pub use config::{
    CacheBackend, CacheSettings, CompilerSettings, GeneratorSettings, KnowledgeBaseSettings,
    PipelineSettings, SandboxSettings, ToolsmithConfig,
};
pub use error::{redact, ConfigError, ErrorDetails, ErrorResponse, GeneratorError, PipelineError};
pub use generator::{strip_code_fences, CodeGenerator, HttpGenerator, UnconfiguredGenerator};
pub use inflight::InflightRegistry;
pub use orchestrator::{Orchestrator, RetryPolicy};
pub use types::{ToolRequest, ToolResponse};
pub use validator::{Validation, ValidationCheck, Validator};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the pipeline
    pub use crate::{
        CodeGenerator, Orchestrator, PipelineError, RetryPolicy, ToolRequest, ToolResponse,
        ToolsmithConfig, Validator,
    };
    pub use toolsmith_artifact::{GeneratedCode, OutputKind, PromptHash};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
