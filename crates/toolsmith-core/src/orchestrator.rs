//! Pipeline orchestrator
//!
//! Drives one request through the tool lifecycle:
//!
//! ```text
//! hash → cache lookup ─ hit ──────────────────────────────────────────→ execute → respond
//!                     └ miss/force → generate → gate → compile → validate → persist ┘
//! ```
//!
//! - Any build-stage failure discards the cache entry for the key
//! - A failed final execution discards the entry and evicts the isolate
//! - Cache read failures degrade to a miss; write failures become warnings
//! - Concurrent misses for one key share a single build

use crate::config::ToolsmithConfig;
use crate::error::{redact, ConfigError, GeneratorError, PipelineError};
use crate::generator::CodeGenerator;
use crate::inflight::InflightRegistry;
use crate::types::{ToolRequest, ToolResponse};
use crate::validator::{Validation, Validator};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use toolsmith_artifact::{CachedTool, ExecutionResult, GeneratedCode, PromptHash};
use toolsmith_build::{scan_imports, BuildCache, CacheError, CompatibilityGate, Compiler};
use toolsmith_sandbox::{ExecutionError, IsolatedExecutor};

/// Build retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts and no pause
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }
}

/// Result of a successful build, shared with every waiter
#[derive(Debug, Clone)]
struct BuildOutcome {
    tool: CachedTool,
    /// `None` when another build stored the tool first
    generated: Option<GeneratedCode>,
    warnings: Vec<String>,
}

/// The pipeline orchestrator
///
/// Cheap to clone; all collaborators are shared.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    cache: Arc<dyn BuildCache>,
    generator: Arc<dyn CodeGenerator>,
    compiler: Arc<dyn Compiler>,
    executor: Arc<dyn IsolatedExecutor>,
    gate: CompatibilityGate,
    validator: Arc<Validator>,
    retry: RetryPolicy,
    request_timeout: Duration,
    inflight: Arc<InflightRegistry<BuildOutcome>>,
}

impl Orchestrator {
    /// Create orchestrator with the built-in knowledge base and defaults
    #[must_use]
    pub fn new(
        cache: Arc<dyn BuildCache>,
        generator: Arc<dyn CodeGenerator>,
        compiler: Arc<dyn Compiler>,
        executor: Arc<dyn IsolatedExecutor>,
    ) -> Self {
        Self {
            cache,
            generator,
            compiler,
            executor,
            gate: CompatibilityGate::builtin(),
            validator: Arc::new(Validator::default()),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(120),
            inflight: Arc::new(InflightRegistry::new()),
        }
    }

    /// Build every collaborator from configuration
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid or a component
    /// fails to initialise
    pub fn from_config(config: &ToolsmithConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let gate = CompatibilityGate::new(config.build_knowledge_base()?);
        Ok(Self::new(
            config.build_cache(),
            config.build_generator()?,
            config.build_compiler()?,
            config.build_executor()?,
        )
        .with_gate(gate)
        .with_retry(RetryPolicy {
            max_attempts: config.pipeline.max_attempts,
            backoff: config.retry_backoff(),
        })
        .with_request_timeout(config.request_timeout()))
    }

    /// With compatibility gate
    #[must_use]
    pub fn with_gate(mut self, gate: CompatibilityGate) -> Self {
        self.gate = gate;
        self
    }

    /// With validator
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// With retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With overall request deadline
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Compatibility gate in use
    #[must_use]
    pub fn gate(&self) -> &CompatibilityGate {
        &self.gate
    }

    /// Number of builds currently running
    #[must_use]
    pub fn builds_in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Serve one request
    ///
    /// # Errors
    /// Returns the [`PipelineError`] of the first failing stage
    pub async fn run(&self, request: ToolRequest) -> Result<ToolResponse, PipelineError> {
        if request.prompt.trim().is_empty() {
            return Err(PipelineError::input("prompt must not be empty"));
        }

        let hash = PromptHash::of_prompt(&request.prompt);
        let span = tracing::info_span!("tool_request", hash = %hash.short());
        let deadline = self.request_timeout;

        match tokio::time::timeout(deadline, self.serve(&request, hash).instrument(span)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(hash = %hash.short(), "request deadline of {:?} exceeded", deadline);
                self.discard(&hash).await;
                Err(PipelineError::Timeout {
                    secs: deadline.as_secs(),
                })
            }
        }
    }

    async fn serve(&self, request: &ToolRequest, hash: PromptHash) -> Result<ToolResponse, PipelineError> {
        if request.force_regenerate {
            tracing::info!("Force regenerate requested, discarding cached build");
            self.discard(&hash).await;
        } else if let Some(tool) = self.lookup(&hash).await {
            tracing::info!("Cache hit");
            let result = self.execute(&tool, &request.input).await?;
            return Ok(respond(tool, result, true, None, Vec::new()));
        }

        tracing::info!("Cache miss, building");
        let force = request.force_regenerate;
        let (build, leader) = self.inflight.join_or_start(hash, || {
            let this = self.clone();
            let prompt = request.prompt.clone();
            let span = tracing::info_span!("build", hash = %hash.short());
            async move { this.build(hash, &prompt, force).await }.instrument(span)
        });
        if !leader {
            tracing::info!("Joined in-flight build");
        }

        let outcome = build.await?;
        let result = self.execute(&outcome.tool, &request.input).await?;
        Ok(respond(
            outcome.tool.clone(),
            result,
            outcome.generated.is_none(),
            outcome.generated.clone(),
            outcome.warnings.clone(),
        ))
    }

    /// Cache read that treats every failure as a miss
    async fn lookup(&self, hash: &PromptHash) -> Option<CachedTool> {
        match self.cache.get(hash).await {
            Ok(tool) => tool,
            Err(e) => {
                tracing::warn!(error = %redact(&e.to_string()), "Cache read failed, treating as miss");
                if matches!(e, CacheError::Corrupt { .. }) {
                    self.discard(hash).await;
                }
                None
            }
        }
    }

    /// Best-effort cache delete
    async fn discard(&self, hash: &PromptHash) {
        if let Err(e) = self.cache.delete(hash).await {
            tracing::warn!(error = %redact(&e.to_string()), "Cache delete failed");
        }
    }

    async fn build(&self, hash: PromptHash, prompt: &str, force: bool) -> Result<BuildOutcome, PipelineError> {
        // a build that settled between our lookup and registration already stored the tool
        if !force {
            if let Some(tool) = self.lookup(&hash).await {
                tracing::info!("Cache filled by a concurrent build");
                return Ok(BuildOutcome {
                    tool,
                    generated: None,
                    warnings: Vec::new(),
                });
            }
        }

        let base_context = self.gate.knowledge().context_for(prompt);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut failures: Vec<String> = Vec::new();
        let mut attempt = 1;

        loop {
            let context = if failures.is_empty() {
                base_context.clone()
            } else {
                format!("{base_context}\n\n{}", failures.join("\n"))
            };

            match self.attempt(&hash, prompt, &context).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let message = redact(&e.to_string());
                    tracing::warn!(attempt, kind = e.kind(), "Build attempt failed, retrying: {}", message);
                    failures.push(format!("Previous attempt {attempt} failed: {message}"));
                    attempt += 1;
                    if !self.retry.backoff.is_zero() {
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
                Err(e) => {
                    tracing::error!(attempt, kind = e.kind(), "Build failed: {}", redact(&e.to_string()));
                    self.discard(&hash).await;
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(
        &self,
        hash: &PromptHash,
        prompt: &str,
        context: &str,
    ) -> Result<BuildOutcome, PipelineError> {
        tracing::info!("Generating");
        let generated = self.generator.generate(prompt, context).await?;
        if generated.source.trim().is_empty() {
            return Err(GeneratorError::EmptySource.into());
        }

        let scan = scan_imports(&generated.source)?;
        let packages = scan.packages();
        tracing::debug!(?packages, "Checking package compatibility");
        let report = self.gate.check(&packages);
        if !report.is_compatible() {
            let packages = report.incompatible_names();
            tracing::warn!(?packages, "Incompatible packages, skipping compile");
            return Err(PipelineError::Compatibility {
                packages,
                alternatives: report
                    .incompatible
                    .iter()
                    .filter_map(|p| p.alternative.clone())
                    .collect(),
                warnings: report.warnings,
            });
        }
        let mut warnings = report.warnings;

        tracing::info!("Compiling");
        let module = self.compiler.compile(&generated.source).await?;

        tracing::info!("Validating");
        let validation = self
            .validator
            .validate(
                self.executor.as_ref(),
                &module.bundled_code,
                &generated.example_input,
                generated.output_kind,
                hash,
            )
            .await;
        if let Validation::Invalid { check, error } = validation {
            return Err(PipelineError::Validation {
                check,
                message: error,
            });
        }

        let tool = CachedTool {
            hash: *hash,
            bundled_code: module.bundled_code,
            created_at: Utc::now(),
            packages: module.packages,
            output_kind: generated.output_kind,
            output_description: generated.output_description.clone(),
            entry: module.entry,
        };

        match self.cache.set(&tool).await {
            Ok(()) => tracing::info!("Build cached"),
            Err(e) => {
                let message = redact(&e.to_string());
                tracing::warn!("Cache write failed, serving uncached build: {}", message);
                warnings.push(format!("build not cached: {message}"));
            }
        }

        Ok(BuildOutcome {
            tool,
            generated: Some(generated),
            warnings,
        })
    }

    /// Run a tool under its production key
    ///
    /// A sandbox failure discards the build so the next request regenerates.
    /// Oversized input is rejected before the tool runs and leaves the build alone.
    async fn execute(&self, tool: &CachedTool, input: &str) -> Result<ExecutionResult, PipelineError> {
        let key = tool.hash.execution_key();
        match self.executor.execute(&tool.bundled_code, input, &key).await {
            Ok(result) => {
                tracing::info!(duration_ms = result.duration_ms, "Executed");
                Ok(result)
            }
            Err(e @ ExecutionError::InputTooLarge { .. }) => Err(e.into()),
            Err(e) => {
                tracing::error!(kind = e.kind(), "Execution failed, discarding build: {}", redact(&e.to_string()));
                self.discard(&tool.hash).await;
                self.executor.evict(&key).await;
                Err(e.into())
            }
        }
    }

    /// Delete one cached tool and its isolate; succeeds if absent
    ///
    /// # Errors
    /// Returns the cache error if the store cannot be reached
    pub async fn delete_tool(&self, hash: &PromptHash) -> Result<String, CacheError> {
        self.cache.delete(hash).await?;
        self.executor.evict(&hash.execution_key()).await;
        tracing::info!(hash = %hash.short(), "Deleted cached tool");
        Ok(format!("deleted tool {}", hash.short()))
    }

    /// Remove every cached tool
    ///
    /// # Errors
    /// Returns the cache error if the store cannot be reached
    pub async fn clear_cache(&self) -> Result<String, CacheError> {
        self.cache.clear().await?;
        tracing::info!("Cleared tool cache");
        Ok("tool cache cleared".to_string())
    }
}

fn respond(
    tool: CachedTool,
    result: ExecutionResult,
    cached: bool,
    generated_code: Option<GeneratedCode>,
    warnings: Vec<String>,
) -> ToolResponse {
    ToolResponse {
        output: result.output,
        content_type: result.content_type,
        output_kind: tool.output_kind,
        output_description: tool.output_description,
        tool_hash: tool.hash.to_string(),
        packages: tool.packages,
        cached,
        generated_code,
        warnings,
    }
}
