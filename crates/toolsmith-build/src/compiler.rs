//! ESM compiler
//!
//! Turns generated module source into one runnable module:
//! 1. Scan imports and the entry shape ([`scan_imports`])
//! 2. Resolve every package specifier through a [`PackageResolver`]
//! 3. Rewrite each specifier in place to its resolved URL
//! 4. Normalize the entry point to `export async function handle(input)`
//!    returning `{ body, contentType }`
//!
//! Either every package specifier is rewritten or the compile fails.

use crate::error::CompileError;
use crate::imports::{cdn_path, package_root, scan_imports, ImportScan};
use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use toolsmith_artifact::ToolEntry;

/// Default module CDN
pub const DEFAULT_CDN_BASE: &str = "https://esm.sh";

/// Default bundle size ceiling (2 MiB)
pub const DEFAULT_MAX_BUNDLE_BYTES: usize = 2 * 1024 * 1024;

/// Binding the default export is rebound to
const DEFAULT_BINDING: &str = "__toolsmith_default";

/// Binding a named `handle` export is renamed to
const HANDLE_BINDING: &str = "__toolsmith_handle";

/// Converts any handler return value to `{ body, contentType }`
const NORMALIZE_JS: &str = r#"
async function __toolsmithNormalize(value) {
  const text = "text/plain; charset=utf-8";
  if (value instanceof Response) {
    const contentType = value.headers.get("content-type") ?? text;
    const media = contentType.split(";")[0].trim().toLowerCase();
    if (media.startsWith("image/") && media !== "image/svg+xml") {
      const bytes = new Uint8Array(await value.arrayBuffer());
      let binary = "";
      for (let i = 0; i < bytes.length; i += 0x8000) {
        binary += String.fromCharCode(...bytes.subarray(i, i + 0x8000));
      }
      return { body: `data:${media};base64,${btoa(binary)}`, contentType };
    }
    return { body: await value.text(), contentType };
  }
  if (typeof value === "string") {
    return { body: value, contentType: text };
  }
  if (value && typeof value === "object" && typeof value.body === "string" && typeof value.contentType === "string") {
    return { body: value.body, contentType: value.contentType };
  }
  return { body: JSON.stringify(value ?? null), contentType: "application/json" };
}
"#;

/// Entry adapter for a rebound default export (fetch object or function)
const DEFAULT_ADAPTER_JS: &str = r#"
export async function handle(input) {
  const entry = __toolsmith_default;
  let result;
  if (entry && typeof entry.fetch === "function") {
    const request = new Request("https://tool.local/?input=" + encodeURIComponent(input ?? ""));
    result = await entry.fetch(request, {}, {});
  } else if (typeof entry === "function") {
    result = await entry(input ?? "");
  } else {
    throw new TypeError("default export is neither a fetch handler nor a function");
  }
  return __toolsmithNormalize(result);
}
"#;

/// Entry adapter for a renamed `handle` export
const HANDLE_ADAPTER_JS: &str = r#"
export async function handle(input) {
  return __toolsmithNormalize(await __toolsmith_handle(input ?? ""));
}
"#;

/// Output of a successful compile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    /// Self-contained module exporting `handle(input)`
    pub bundled_code: String,
    /// Distinct package roots in first-import order
    pub packages: Vec<String>,
    /// Entry shape of the source module
    pub entry: ToolEntry,
}

/// Source-to-module compiler
#[async_trait]
pub trait Compiler: Send + Sync + Debug {
    /// Compile module source
    async fn compile(&self, source: &str) -> Result<CompiledModule, CompileError>;
}

/// Maps a package specifier to an importable URL
#[async_trait]
pub trait PackageResolver: Send + Sync + Debug {
    /// Resolve `specifier` (e.g. `uuid`, `date-fns/format`, `marked@12`)
    ///
    /// # Errors
    /// Returns `ResolutionFailed` if the package cannot be served
    async fn resolve(&self, specifier: &str) -> Result<String, CompileError>;
}

fn join_url(base: &str, specifier: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), cdn_path(specifier))
}

/// Resolver probing an esm.sh-style CDN with HTTP HEAD
///
/// Successful resolutions are memoized for the life of the resolver.
#[derive(Debug, Clone)]
pub struct CdnResolver {
    client: reqwest::Client,
    base_url: String,
    resolved: Cache<String, String>,
}

impl CdnResolver {
    /// Create resolver for `base_url` with per-request timeout
    ///
    /// # Errors
    /// Returns `CompileFailed` if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CompileError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompileError::compile_failed(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            resolved: Cache::new(1_000),
        })
    }

    /// CDN base URL
    #[inline]
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PackageResolver for CdnResolver {
    async fn resolve(&self, specifier: &str) -> Result<String, CompileError> {
        let url = join_url(&self.base_url, specifier);
        if let Some(hit) = self.resolved.get(&url).await {
            return Ok(hit);
        }

        let package = package_root(specifier);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| CompileError::resolution_failed(&package, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CompileError::resolution_failed(
                package,
                format!("{url} answered {status}"),
            ));
        }

        tracing::debug!(package = %package, url = %url, "resolved package");
        self.resolved.insert(url.clone(), url.clone()).await;
        Ok(url)
    }
}

/// Offline resolver: maps packages to CDN URLs without probing
///
/// With an allow-list, packages outside it fail to resolve.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    base_url: String,
    known: Option<Vec<String>>,
}

impl StaticResolver {
    /// Resolve every package against `base_url`
    #[inline]
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            known: None,
        }
    }

    /// Resolve only the listed package roots
    #[must_use]
    pub fn only<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.known = Some(packages.into_iter().map(|p| package_root(p.as_ref())).collect());
        self
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CDN_BASE)
    }
}

#[async_trait]
impl PackageResolver for StaticResolver {
    async fn resolve(&self, specifier: &str) -> Result<String, CompileError> {
        let package = package_root(specifier);
        match &self.known {
            Some(known) if !known.contains(&package) => Err(CompileError::resolution_failed(
                package,
                "package not found",
            )),
            _ => Ok(join_url(&self.base_url, specifier)),
        }
    }
}

/// Default compiler: CDN import rewrite plus entry normalization
#[derive(Debug, Clone)]
pub struct EsmBundler {
    resolver: Arc<dyn PackageResolver>,
    max_bundle_bytes: usize,
}

impl EsmBundler {
    /// Create bundler over a resolver
    #[inline]
    #[must_use]
    pub fn new(resolver: Arc<dyn PackageResolver>) -> Self {
        Self {
            resolver,
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
        }
    }

    /// With bundle size ceiling
    #[inline]
    #[must_use]
    pub fn with_max_bundle_bytes(mut self, max: usize) -> Self {
        self.max_bundle_bytes = max;
        self
    }

    async fn resolve_all(&self, scan: &ImportScan) -> Result<HashMap<String, String>, CompileError> {
        let mut urls = HashMap::new();
        for site in scan.sites.iter().filter(|s| s.is_package()) {
            if urls.contains_key(&site.specifier) {
                continue;
            }
            let url = self.resolver.resolve(&site.specifier).await?;
            urls.insert(site.specifier.clone(), url);
        }
        Ok(urls)
    }
}

#[async_trait]
impl Compiler for EsmBundler {
    async fn compile(&self, source: &str) -> Result<CompiledModule, CompileError> {
        let scan = scan_imports(source)?;
        let entry = scan
            .entry()
            .ok_or_else(|| CompileError::compile_failed("no entry point"))?;
        let urls = self.resolve_all(&scan).await?;

        let mut edits: Vec<(Range<usize>, String)> = Vec::new();
        for site in scan.sites.iter().filter(|s| s.is_package()) {
            let url = urls.get(&site.specifier).ok_or_else(|| {
                CompileError::resolution_failed(package_root(&site.specifier), "unresolved")
            })?;
            edits.push((site.range.clone(), url.clone()));
        }

        let adapter = if let Some(default) = &scan.default_export {
            edits.push((default.prefix.clone(), format!("const {DEFAULT_BINDING} = ")));
            edits.push((default.statement_end..default.statement_end, ";".to_string()));
            DEFAULT_ADAPTER_JS
        } else {
            HANDLE_ADAPTER_JS
        };
        if let Some(name) = &scan.named_handle {
            edits.push((name.clone(), HANDLE_BINDING.to_string()));
        }

        let mut bundled = source.to_string();
        edits.sort_by_key(|(range, _)| std::cmp::Reverse((range.start, range.end)));
        for (range, text) in edits {
            bundled.replace_range(range, &text);
        }
        bundled.push('\n');
        bundled.push_str(NORMALIZE_JS);
        bundled.push_str(adapter);

        if bundled.len() > self.max_bundle_bytes {
            return Err(CompileError::compile_failed(format!(
                "bundle is {} bytes, limit is {}",
                bundled.len(),
                self.max_bundle_bytes
            )));
        }

        let packages = scan.packages();
        tracing::debug!(
            packages = ?packages,
            entry = ?entry,
            bytes = bundled.len(),
            "compiled module"
        );

        Ok(CompiledModule {
            bundled_code: bundled,
            packages,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bundler() -> EsmBundler {
        EsmBundler::new(Arc::new(StaticResolver::default()))
    }

    const UUID_TOOL: &str = r#"import { v4 as uuidv4 } from "uuid";
export default {
  async fetch(request) {
    return new Response(JSON.stringify({ id: uuidv4() }), {
      headers: { "content-type": "application/json" },
    });
  },
}
"#;

    #[tokio::test]
    async fn rewrites_package_imports_to_cdn_urls() {
        let module = bundler().compile(UUID_TOOL).await.unwrap();
        assert!(module.bundled_code.contains(r#"from "https://esm.sh/uuid""#));
        assert!(!module.bundled_code.contains(r#"from "uuid""#));
        assert_eq!(module.packages, vec!["uuid".to_string()]);
        assert_eq!(module.entry, ToolEntry::DefaultFetch);
    }

    #[tokio::test]
    async fn default_export_is_rebound_and_adapted() {
        let module = bundler().compile(UUID_TOOL).await.unwrap();
        assert!(!module.bundled_code.contains("export default"));
        assert!(module.bundled_code.contains("const __toolsmith_default = {"));
        assert!(module.bundled_code.contains("export async function handle(input)"));
        assert_eq!(module.bundled_code.matches("export async function handle").count(), 1);
    }

    #[tokio::test]
    async fn named_handle_is_wrapped() {
        let source = r#"import { marked } from "marked";
export async function handle(input) {
  return new Response(await marked.parse(input), { headers: { "content-type": "text/html" } });
}
"#;
        let module = bundler().compile(source).await.unwrap();
        assert_eq!(module.entry, ToolEntry::NamedHandle);
        assert!(module.bundled_code.contains("export async function __toolsmith_handle(input)"));
        assert!(module.bundled_code.contains("await __toolsmith_handle(input"));
        assert!(module.bundled_code.contains("https://esm.sh/marked"));
    }

    #[tokio::test]
    async fn relative_and_url_imports_are_untouched() {
        let source = r#"import { x } from "./local.js";
import y from "https://cdn.example.com/y.js";
export default (input) => x + y + input;
"#;
        let module = bundler().compile(source).await.unwrap();
        assert!(module.bundled_code.contains(r#"from "./local.js""#));
        assert!(module.bundled_code.contains(r#"from "https://cdn.example.com/y.js""#));
        assert!(module.packages.is_empty());
        assert_eq!(module.entry, ToolEntry::DefaultFunction);
    }

    #[tokio::test]
    async fn subpath_and_version_survive_rewrite() {
        let source = r#"import { format } from "date-fns/format";
import { marked } from "npm:marked@12";
export function handle(input) { return format(new Date(input), "PPP") + marked.parse(input); }
"#;
        let module = bundler().compile(source).await.unwrap();
        assert!(module.bundled_code.contains("https://esm.sh/date-fns/format"));
        assert!(module.bundled_code.contains("https://esm.sh/marked@12"));
        assert_eq!(module.packages, vec!["date-fns".to_string(), "marked".to_string()]);
    }

    #[tokio::test]
    async fn unresolvable_package_fails_whole_compile() {
        let resolver = StaticResolver::default().only(["uuid"]);
        let bundler = EsmBundler::new(Arc::new(resolver));
        let source = r#"import { v4 } from "uuid";
import pad from "left-pad";
export default (input) => pad(v4(), 40);
"#;
        let err = bundler.compile(source).await.unwrap_err();
        assert_eq!(err.package(), Some("left-pad"));
        assert_eq!(err.reason(), "resolution failed");
    }

    #[tokio::test]
    async fn module_without_entry_is_rejected() {
        let err = bundler().compile("export const x = 1;\n").await.unwrap_err();
        assert_eq!(err, CompileError::compile_failed("no entry point"));
    }

    #[tokio::test]
    async fn syntax_error_is_compile_failure() {
        let err = bundler().compile("export default {{{").await.unwrap_err();
        assert_eq!(err.reason(), "compile failed");
    }

    #[tokio::test]
    async fn oversized_bundle_is_rejected() {
        let bundler = bundler().with_max_bundle_bytes(64);
        let err = bundler.compile(UUID_TOOL).await.unwrap_err();
        assert!(err.to_string().contains("limit is 64"));
    }

    #[test]
    fn cdn_urls_join_cleanly() {
        assert_eq!(join_url("https://esm.sh/", "node:uuid"), "https://esm.sh/uuid");
        assert_eq!(join_url("https://esm.sh", "@scope/pkg/sub"), "https://esm.sh/@scope/pkg/sub");
    }
}
