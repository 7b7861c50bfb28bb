//! Toolsmith Artifacts
//!
//! Content-addressed identities and the artifacts stored against them.
//!
//! # Core Concepts
//!
//! - [`PromptHash`]: 32-byte Blake3 digest of a normalized prompt
//! - [`CachedTool`]: validated, bundled tool persisted per prompt hash
//! - [`GeneratedCode`]: transient generator output awaiting compilation
//! - [`ExecutionResult`]: output of a single sandboxed run
//!
//! # Example
//!
//! ```rust
//! use toolsmith_artifact::PromptHash;
//!
//! let a = PromptHash::of_prompt("Make a UUID generator");
//! let b = PromptHash::of_prompt("  make a uuid generator ");
//! assert_eq!(a, b);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod hash;
mod tool;

pub use hash::{normalize_prompt, HashError, PromptHash};
pub use tool::{
    CachedTool, ExecutionResult, GeneratedCode, OutputKind, ToolEntry, UnknownOutputKind,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
