//! Toolsmith Sandbox
//!
//! Isolated execution of bundled tools.
//!
//! # Guarantees
//!
//! - One fresh runtime process per execution; environment cleared, input on stdin
//! - Wall-clock, heap, input and output bounds; the process is killed on violation
//! - Outbound `fetch` calls are attributed (`x-toolsmith-tool` header) and
//!   checked against a [`NetworkPolicy`]; denied and local hosts are also
//!   denied by runtime permission flags
//! - The result envelope is bound to a per-run nonce the tool cannot read
//! - Sandbox failures ([`ExecutionError`]) are distinct from tool output that
//!   merely describes an error
//!
//! # Example
//!
//! ```rust,ignore
//! use toolsmith_sandbox::prelude::*;
//!
//! let sandbox = ProcessSandbox::new(SandboxConfig::default())?;
//! let result = sandbox.execute(&bundled_code, "# Hello", "tool:3f2a…").await?;
//! println!("{} ({})", result.output, result.content_type);
//! ```

#![warn(unreachable_pub)]

pub mod error;
pub mod executor;
pub mod harness;
pub mod policy;

pub use error::ExecutionError;
pub use executor::{IsolatedExecutor, ProcessSandbox, SandboxConfig};
pub use policy::NetworkPolicy;

/// Common imports
pub mod prelude {
    pub use crate::error::ExecutionError;
    pub use crate::executor::{IsolatedExecutor, ProcessSandbox, SandboxConfig};
    pub use crate::policy::NetworkPolicy;
    pub use toolsmith_artifact::ExecutionResult;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
