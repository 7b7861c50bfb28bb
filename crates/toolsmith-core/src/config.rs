//! Configuration
//!
//! `ToolsmithConfig` is read from TOML; every field has a default so an
//! empty file (or no file) is a valid configuration. A few settings can be
//! overridden from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `TOOLSMITH_GENERATOR_URL` | `generator.endpoint` |
//! | `TOOLSMITH_CACHE_DIR` | `cache.root` (and selects the object-store backend) |
//! | `TOOLSMITH_RUNTIME` | `sandbox.runtime` |

use crate::error::ConfigError;
use crate::generator::{CodeGenerator, HttpGenerator, UnconfiguredGenerator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use toolsmith_build::{
    BuildCache, CdnResolver, Compiler, EsmBundler, KnowledgeBase, MemoryBuildCache,
    ObjectStoreCache, PackageResolver, StaticResolver, DEFAULT_CDN_BASE, DEFAULT_MAX_BUNDLE_BYTES,
};
use toolsmith_sandbox::{IsolatedExecutor, NetworkPolicy, ProcessSandbox, SandboxConfig};

/// Generator endpoint override
pub const ENV_GENERATOR_URL: &str = "TOOLSMITH_GENERATOR_URL";
/// Object-store root override
pub const ENV_CACHE_DIR: &str = "TOOLSMITH_CACHE_DIR";
/// Runtime command override
pub const ENV_RUNTIME: &str = "TOOLSMITH_RUNTIME";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsmithConfig {
    /// Retry and deadline settings
    pub pipeline: PipelineSettings,
    /// Build cache backend
    pub cache: CacheSettings,
    /// Package resolution and bundling
    pub compiler: CompilerSettings,
    /// Isolated runtime limits
    pub sandbox: SandboxSettings,
    /// Code generator client
    pub generator: GeneratorSettings,
    /// Extra package compatibility records
    pub knowledge_base: KnowledgeBaseSettings,
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Build attempts per request (1 = no retry)
    pub max_attempts: u32,
    /// Pause between attempts
    pub retry_backoff_ms: u64,
    /// Overall request deadline
    pub request_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_backoff_ms: 500,
            request_timeout_secs: 120,
        }
    }
}

/// Cache backend choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackend {
    /// In-process moka cache
    #[default]
    Memory,
    /// One JSON object per tool on disk
    ObjectStore,
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Backend
    pub backend: CacheBackend,
    /// Object-store root directory
    pub root: PathBuf,
    /// Memory cache capacity (entries)
    pub capacity: u64,
    /// Memory cache time-to-live
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            root: PathBuf::from(".toolsmith"),
            capacity: 10_000,
            ttl_secs: None,
        }
    }
}

/// Compiler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// ESM CDN base URL
    pub cdn_base_url: String,
    /// Per-package resolution timeout
    pub resolve_timeout_secs: u64,
    /// Bundle size limit
    pub max_bundle_bytes: usize,
    /// Rewrite imports without checking the CDN
    pub offline: bool,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            cdn_base_url: DEFAULT_CDN_BASE.to_string(),
            resolve_timeout_secs: 10,
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
            offline: false,
        }
    }
}

/// Sandbox settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Runtime command
    pub runtime: String,
    /// Arguments placed before the sandbox flags
    pub runtime_args: Vec<String>,
    /// Wall-clock limit per execution
    pub timeout_ms: u64,
    /// Heap limit
    pub max_heap_mb: usize,
    /// Input size limit
    pub max_input_bytes: usize,
    /// Output size limit
    pub max_output_bytes: usize,
    /// Concurrent executions
    pub max_concurrent: usize,
    /// Egress policy
    pub network: NetworkPolicy,
    /// Parent directory for prepared modules
    pub work_dir: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let defaults = SandboxConfig::default();
        Self {
            runtime: defaults.runtime_command,
            runtime_args: defaults.runtime_args,
            timeout_ms: u64::try_from(defaults.timeout.as_millis()).unwrap_or(u64::MAX),
            max_heap_mb: defaults.max_heap_mb,
            max_input_bytes: defaults.max_input_bytes,
            max_output_bytes: defaults.max_output_bytes,
            max_concurrent: defaults.max_concurrent,
            network: defaults.network,
            work_dir: defaults.work_dir,
        }
    }
}

impl SandboxSettings {
    /// Executor configuration
    #[must_use]
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            runtime_command: self.runtime.clone(),
            runtime_args: self.runtime_args.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            max_heap_mb: self.max_heap_mb,
            max_input_bytes: self.max_input_bytes,
            max_output_bytes: self.max_output_bytes,
            max_concurrent: self.max_concurrent,
            network: self.network.clone(),
            work_dir: self.work_dir.clone(),
        }
    }
}

/// Generator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Endpoint URL; builds fail with `NotConfigured` when unset
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token
    pub token_env: String,
    /// Request timeout
    pub timeout_secs: u64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: "TOOLSMITH_GENERATOR_TOKEN".to_string(),
            timeout_secs: 90,
        }
    }
}

/// Knowledge base settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseSettings {
    /// TOML or JSON file merged over the built-in table
    pub path: Option<PathBuf>,
}

impl ToolsmithConfig {
    /// Parse TOML
    ///
    /// # Errors
    /// Returns `Toml` on syntax or type errors
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(document)?)
    }

    /// Read a TOML file
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, `Toml` if it does not parse
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&document)
    }

    /// Apply overrides from a variable lookup
    #[must_use]
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_GENERATOR_URL).filter(|v| !v.is_empty()) {
            self.generator.endpoint = Some(url);
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache.root = PathBuf::from(dir);
            self.cache.backend = CacheBackend::ObjectStore;
        }
        if let Some(runtime) = lookup(ENV_RUNTIME).filter(|v| !v.is_empty()) {
            self.sandbox.runtime = runtime;
        }
        self
    }

    /// Apply overrides from the process environment
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `Invalid` naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.pipeline.max_attempts == 0 {
            return invalid("pipeline.max_attempts must be at least 1");
        }
        if self.pipeline.request_timeout_secs == 0 {
            return invalid("pipeline.request_timeout_secs must be positive");
        }
        if self.cache.capacity == 0 {
            return invalid("cache.capacity must be positive");
        }
        if self.sandbox.timeout_ms == 0 {
            return invalid("sandbox.timeout_ms must be positive");
        }
        if self.sandbox.max_concurrent == 0 {
            return invalid("sandbox.max_concurrent must be positive");
        }
        if self.sandbox.max_output_bytes == 0 {
            return invalid("sandbox.max_output_bytes must be positive");
        }
        if self.sandbox.runtime.trim().is_empty() {
            return invalid("sandbox.runtime must not be empty");
        }
        if !is_http_url(&self.compiler.cdn_base_url) {
            return invalid("compiler.cdn_base_url must be an http(s) URL");
        }
        if let Some(endpoint) = &self.generator.endpoint {
            if !is_http_url(endpoint) {
                return invalid("generator.endpoint must be an http(s) URL");
            }
        }
        Ok(())
    }

    /// With retry attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.pipeline.max_attempts = attempts;
        self
    }

    /// With object-store cache rooted at `root`
    #[must_use]
    pub fn with_object_store(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache.backend = CacheBackend::ObjectStore;
        self.cache.root = root.into();
        self
    }

    /// With generator endpoint
    #[must_use]
    pub fn with_generator_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.generator.endpoint = Some(endpoint.into());
        self
    }

    /// With network policy
    #[must_use]
    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.sandbox.network = network;
        self
    }

    /// With offline package resolution
    #[must_use]
    pub fn with_offline_compiler(mut self) -> Self {
        self.compiler.offline = true;
        self
    }

    /// Pause between build attempts
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.pipeline.retry_backoff_ms)
    }

    /// Overall request deadline
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.request_timeout_secs)
    }

    /// Build the configured cache backend
    #[must_use]
    pub fn build_cache(&self) -> Arc<dyn BuildCache> {
        match self.cache.backend {
            CacheBackend::ObjectStore => Arc::new(ObjectStoreCache::new(&self.cache.root)),
            CacheBackend::Memory => match self.cache.ttl_secs {
                Some(ttl) => Arc::new(MemoryBuildCache::with_ttl(
                    self.cache.capacity,
                    Duration::from_secs(ttl),
                )),
                None => Arc::new(MemoryBuildCache::new(self.cache.capacity)),
            },
        }
    }

    /// Built-in knowledge base merged with the configured file
    ///
    /// # Errors
    /// Returns `Init` if the file cannot be loaded
    pub fn build_knowledge_base(&self) -> Result<Arc<KnowledgeBase>, ConfigError> {
        let knowledge = match &self.knowledge_base.path {
            Some(path) => KnowledgeBase::load(path).map_err(|e| ConfigError::Init {
                component: "knowledge base",
                detail: e.to_string(),
            })?,
            None => KnowledgeBase::builtin(),
        };
        Ok(Arc::new(knowledge))
    }

    /// Build the bundler with the configured resolver
    ///
    /// # Errors
    /// Returns `Init` if the CDN client cannot be built
    pub fn build_compiler(&self) -> Result<Arc<dyn Compiler>, ConfigError> {
        let settings = &self.compiler;
        let resolver: Arc<dyn PackageResolver> = if settings.offline {
            Arc::new(StaticResolver::new(&settings.cdn_base_url))
        } else {
            Arc::new(
                CdnResolver::new(
                    &settings.cdn_base_url,
                    Duration::from_secs(settings.resolve_timeout_secs),
                )
                .map_err(|e| ConfigError::Init {
                    component: "package resolver",
                    detail: e.to_string(),
                })?,
            )
        };
        Ok(Arc::new(
            EsmBundler::new(resolver).with_max_bundle_bytes(settings.max_bundle_bytes),
        ))
    }

    /// Build the process sandbox
    ///
    /// # Errors
    /// Returns `Init` if the sandbox work directory cannot be created
    pub fn build_executor(&self) -> Result<Arc<dyn IsolatedExecutor>, ConfigError> {
        let sandbox =
            ProcessSandbox::new(self.sandbox.to_sandbox_config()).map_err(|e| ConfigError::Init {
                component: "sandbox",
                detail: e.to_string(),
            })?;
        Ok(Arc::new(sandbox))
    }

    /// Build the generator client
    ///
    /// Without an endpoint, returns a generator that refuses every build.
    ///
    /// # Errors
    /// Returns `Init` if the HTTP client cannot be built
    pub fn build_generator(&self) -> Result<Arc<dyn CodeGenerator>, ConfigError> {
        let settings = &self.generator;
        let Some(endpoint) = &settings.endpoint else {
            return Ok(Arc::new(UnconfiguredGenerator));
        };
        let token = std::env::var(&settings.token_env).ok();
        let generator =
            HttpGenerator::new(endpoint, token, Duration::from_secs(settings.timeout_secs))
                .map_err(|e| ConfigError::Init {
                    component: "generator",
                    detail: e.to_string(),
                })?;
        Ok(Arc::new(generator))
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn empty_document_is_default() {
        let config = ToolsmithConfig::from_toml_str("").unwrap();
        assert_eq!(config, ToolsmithConfig::default());
        assert_eq!(config.pipeline.max_attempts, 1);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
        assert_eq!(config.sandbox.runtime, "deno");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_sections() {
        let config = ToolsmithConfig::from_toml_str(
            r#"
            [pipeline]
            max_attempts = 3
            retry_backoff_ms = 10

            [cache]
            backend = "object-store"
            root = "/var/lib/toolsmith"

            [compiler]
            offline = true

            [sandbox]
            timeout_ms = 2500
            max_concurrent = 2

            [sandbox.network]
            allowed_hosts = ["*.example.com"]
            denied_hosts = ["evil.example.com"]

            [generator]
            endpoint = "http://localhost:8787/generate"

            [knowledge_base]
            path = "packages.toml"
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.retry_backoff(), Duration::from_millis(10));
        assert_eq!(config.cache.backend, CacheBackend::ObjectStore);
        assert_eq!(config.cache.root, PathBuf::from("/var/lib/toolsmith"));
        assert!(config.compiler.offline);
        assert_eq!(config.sandbox.timeout_ms, 2500);
        assert_eq!(config.sandbox.network.allowed_hosts, vec!["*.example.com"]);
        assert!(!config.sandbox.network.allow_loopback);
        assert_eq!(
            config.generator.endpoint.as_deref(),
            Some("http://localhost:8787/generate")
        );
        assert_eq!(config.knowledge_base.path, Some(PathBuf::from("packages.toml")));

        let sandbox = config.sandbox.to_sandbox_config();
        assert_eq!(sandbox.timeout, Duration::from_millis(2500));
        assert_eq!(sandbox.max_concurrent, 2);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = ToolsmithConfig::from_toml_str("[cache]\nbackend = \"redis\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_GENERATOR_URL, "https://gen.internal/v1"),
            (ENV_CACHE_DIR, "/tmp/tools"),
            (ENV_RUNTIME, ""),
        ]
        .into_iter()
        .collect();

        let config = ToolsmithConfig::default()
            .with_env_overrides(|name| vars.get(name).map(|v| (*v).to_string()));
        assert_eq!(config.generator.endpoint.as_deref(), Some("https://gen.internal/v1"));
        assert_eq!(config.cache.backend, CacheBackend::ObjectStore);
        assert_eq!(config.cache.root, PathBuf::from("/tmp/tools"));
        // empty values are ignored
        assert_eq!(config.sandbox.runtime, "deno");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let err = ToolsmithConfig::default().with_max_attempts(0).validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid config: pipeline.max_attempts must be at least 1");

        let err = ToolsmithConfig::default()
            .with_generator_endpoint("ftp://nope")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("generator.endpoint"));
    }

    #[tokio::test]
    async fn builds_components() {
        let dir = tempfile::tempdir().unwrap();
        let config = ToolsmithConfig::default()
            .with_object_store(dir.path())
            .with_offline_compiler();

        let cache = config.build_cache();
        assert!(format!("{cache:?}").contains("ObjectStoreCache"));

        let compiler = config.build_compiler().unwrap();
        let module = compiler
            .compile("import { v4 } from \"uuid\";\nexport function handle() { return v4(); }\n")
            .await
            .unwrap();
        assert_eq!(module.packages, vec!["uuid".to_string()]);

        let generator = config.build_generator().unwrap();
        assert!(format!("{generator:?}").contains("UnconfiguredGenerator"));

        assert!(config.build_knowledge_base().unwrap().get("fs").is_some());
    }

    #[test]
    fn missing_knowledge_base_file_fails_init() {
        let mut config = ToolsmithConfig::default();
        config.knowledge_base.path = Some(PathBuf::from("/nonexistent/packages.toml"));
        assert!(matches!(
            config.build_knowledge_base(),
            Err(ConfigError::Init { component: "knowledge base", .. })
        ));
    }
}
