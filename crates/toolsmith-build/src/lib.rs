//! Toolsmith Build Layer
//!
//! Everything between generated source and a cached, runnable module.
//!
//! # Core Operations
//!
//! - **Scan**: parse module source and list its package imports
//! - **Gate**: classify packages against the compatibility knowledge base
//! - **Compile**: resolve packages and normalize the entry point
//! - **Cache**: persist validated tools by prompt hash
//!
//! # Architecture
//!
//! ```text
//! source → scan_imports → CompatibilityGate → Compiler → (validation) → BuildCache
//!                              ↑
//!                        KnowledgeBase (read-only)
//! ```
//!
//! # Example
//!
//! ```rust
//! use toolsmith_build::CompatibilityGate;
//!
//! let gate = CompatibilityGate::builtin();
//! let report = gate.check(&["uuid".to_string(), "node:fs".to_string()]);
//! assert!(!report.is_compatible());
//! assert_eq!(report.incompatible_names(), vec!["fs".to_string()]);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
pub mod cache;
pub mod compiler;
pub mod error;
pub mod gate;
pub mod imports;

// Re-exports for convenience
pub use cache::{BuildCache, CacheStats, MemoryBuildCache, ObjectStoreCache};
pub use compiler::{
    CdnResolver, CompiledModule, Compiler, EsmBundler, PackageResolver, StaticResolver,
    DEFAULT_CDN_BASE, DEFAULT_MAX_BUNDLE_BYTES,
};
pub use error::{CacheError, CompileError, KnowledgeBaseError};
pub use gate::{
    CompatibilityGate, CompatibilityReport, IncompatiblePackage, KnowledgeBase,
    PackageCompatibilityRecord,
};
pub use imports::{scan_imports, ImportScan};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the build layer
    pub use crate::cache::{BuildCache, MemoryBuildCache, ObjectStoreCache};
    pub use crate::compiler::{CompiledModule, Compiler, EsmBundler, PackageResolver};
    pub use crate::error::{CacheError, CompileError};
    pub use crate::gate::{CompatibilityGate, CompatibilityReport, KnowledgeBase};
    pub use toolsmith_artifact::{CachedTool, OutputKind, PromptHash};
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn scan_gate_compile_flow() {
        let source = r##"import { marked } from "marked";
export default { async fetch(req) { return new Response(await marked.parse("# hi")); } };
"##;
        let scan = scan_imports(source).unwrap();
        let report = CompatibilityGate::builtin().check(&scan.packages());
        assert!(report.is_compatible());

        let module = EsmBundler::new(Arc::new(StaticResolver::default()))
            .compile(source)
            .await
            .unwrap();
        assert_eq!(module.packages, report.compatible);
    }

    #[test]
    fn gate_blocks_before_compile() {
        let scan = scan_imports("import fs from \"fs\";\nexport default () => fs.readFileSync(\"x\");\n").unwrap();
        let report = CompatibilityGate::builtin().check(&scan.packages());
        assert_eq!(report.incompatible_names(), vec!["fs".to_string()]);
    }
}
