//! Isolated executor
//!
//! Each execution key owns a prepared module directory (tool module plus
//! harness) that is reused while the bundled code is unchanged. Every run
//! spawns a fresh runtime process with a cleared environment, a heap limit,
//! a wall-clock timeout and capped output. The input travels on stdin behind
//! a per-run envelope nonce, so any byte sequence is a valid input.
//!
//! The process is the isolation boundary: nothing the tool does survives the
//! run except the files in its own prepared directory.

use crate::error::ExecutionError;
use crate::harness::{self, HARNESS_FILE, MODULE_FILE};
use crate::policy::NetworkPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use toolsmith_artifact::ExecutionResult;

/// Runs bundled tool code against an input
#[async_trait]
pub trait IsolatedExecutor: Send + Sync + Debug {
    /// Execute `bundled_code` with `input` under execution key `key`
    async fn execute(
        &self,
        bundled_code: &str,
        input: &str,
        key: &str,
    ) -> Result<ExecutionResult, ExecutionError>;

    /// Drop any prepared state held for `key`
    async fn evict(&self, key: &str);
}

/// Configuration for the process sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Runtime executable
    pub runtime_command: String,
    /// Arguments placed before the generated permission flags
    pub runtime_args: Vec<String>,
    /// Maximum wall-clock time per execution
    pub timeout: Duration,
    /// Heap limit in MiB
    pub max_heap_mb: usize,
    /// Maximum input size in bytes
    pub max_input_bytes: usize,
    /// Maximum stdout/stderr size in bytes
    pub max_output_bytes: usize,
    /// Maximum concurrent executions
    pub max_concurrent: usize,
    /// Outbound network policy
    pub network: NetworkPolicy,
    /// Parent directory for prepared modules (system temp dir when unset)
    pub work_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_command: "deno".to_string(),
            runtime_args: vec![
                "run".to_string(),
                "--quiet".to_string(),
                "--no-prompt".to_string(),
            ],
            timeout: Duration::from_secs(10),
            max_heap_mb: 128,
            max_input_bytes: 64 * 1024,
            max_output_bytes: 1024 * 1024,
            max_concurrent: 8,
            network: NetworkPolicy::default(),
            work_dir: None,
        }
    }
}

impl SandboxConfig {
    /// With runtime command and leading arguments
    #[must_use]
    pub fn with_runtime(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.runtime_command = command.into();
        self.runtime_args = args;
        self
    }

    /// With execution timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// With network policy
    #[must_use]
    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    /// With output cap
    #[must_use]
    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// With concurrency limit
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// A tool module written to disk for one execution key
#[derive(Debug)]
struct PreparedModule {
    dir: TempDir,
    digest: blake3::Hash,
}

impl PreparedModule {
    fn harness_path(&self) -> PathBuf {
        self.dir.path().join(HARNESS_FILE)
    }
}

/// Process-isolated executor
#[derive(Debug)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    root: TempDir,
    prepared: DashMap<String, Arc<PreparedModule>>,
}

impl ProcessSandbox {
    /// Create sandbox with its own working root
    ///
    /// # Errors
    /// Returns `Spawn` if the working root cannot be created
    pub fn new(config: SandboxConfig) -> Result<Self, ExecutionError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("toolsmith-sandbox-");
            b
        };
        let root = match &config.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| ExecutionError::spawn(format!("work dir {}: {e}", dir.display())))?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| ExecutionError::spawn(format!("work dir: {e}")))?;

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            config,
            semaphore,
            root,
            prepared: DashMap::new(),
        })
    }

    /// Sandbox configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Number of prepared modules held
    #[inline]
    #[must_use]
    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    fn cache_dir(&self) -> PathBuf {
        self.root.path().join("runtime-cache")
    }

    /// Reuse the prepared module for `key` if its code is unchanged
    async fn prepare(&self, bundled_code: &str, key: &str) -> Result<Arc<PreparedModule>, ExecutionError> {
        let digest = blake3::hash(bundled_code.as_bytes());
        if let Some(existing) = self.prepared.get(key) {
            if existing.digest == digest {
                return Ok(Arc::clone(existing.value()));
            }
        }

        let dir = tempfile::Builder::new()
            .prefix("tool-")
            .tempdir_in(self.root.path())
            .map_err(|e| ExecutionError::spawn(format!("prepare {key}: {e}")))?;
        let harness = harness::render_harness(key, &self.config.network)?;
        write_file(&dir.path().join(MODULE_FILE), bundled_code).await?;
        write_file(&dir.path().join(HARNESS_FILE), &harness).await?;

        let module = Arc::new(PreparedModule { dir, digest });
        self.prepared.insert(key.to_string(), Arc::clone(&module));
        tracing::debug!(key, digest = %digest.to_hex(), "prepared tool module");
        Ok(module)
    }

    fn command(&self, module: &PreparedModule) -> Command {
        let mut cmd = Command::new(&self.config.runtime_command);
        cmd.args(&self.config.runtime_args);
        cmd.args(self.config.network.runtime_flags());
        cmd.arg(format!("--v8-flags=--max-old-space-size={}", self.config.max_heap_mb));
        cmd.arg(module.harness_path());

        cmd.env_clear();
        cmd.env("DENO_DIR", self.cache_dir());
        cmd.env("NO_COLOR", "1");
        cmd.current_dir(module.dir.path());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, module: &PreparedModule, input: &str, key: &str) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();
        let cap = self.config.max_output_bytes;

        let nonce = harness::new_nonce();

        let mut child = self
            .command(module)
            .spawn()
            .map_err(|e| ExecutionError::spawn(format!("{}: {e}", self.config.runtime_command)))?;
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let payload = harness::stdin_payload(&nonce, input);
            tokio::spawn(async move {
                // the runtime may exit without reading its input
                let _ = stdin.write_all(&payload).await;
            })
        });
        let stdout = child.stdout.take();
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap, true));

        let captured = tokio::time::timeout(self.config.timeout, async {
            let (out, overflow) = read_capped(stdout, cap, false)
                .await
                .map_err(|e| ExecutionError::protocol(format!("stdout: {e}")))?;
            if overflow {
                return Err(ExecutionError::OutputTooLarge { limit: cap });
            }
            let status = child
                .wait()
                .await
                .map_err(|e| ExecutionError::spawn(format!("wait: {e}")))?;
            let err = match stderr_task.await {
                Ok(Ok((buf, _))) => buf,
                _ => Vec::new(),
            };
            Ok((status, out, err))
        })
        .await;
        if let Some(task) = stdin_task {
            task.abort();
        }

        let (status, stdout, stderr) = match captured {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                let ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(ExecutionError::Timeout { ms });
            }
        };

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        let envelope = match harness::parse_envelope(&stdout, &nonce) {
            Ok(envelope) => envelope,
            Err(_) if !status.success() => {
                return Err(ExecutionError::handler_failed(tail(&stderr, status.code())));
            }
            Err(e) => return Err(e),
        };

        for host in &envelope.egress {
            tracing::info!(key, host = %host, "tool egress");
            if !self.config.network.is_host_allowed(host) {
                tracing::warn!(key, host = %host, "egress outside network policy");
                return Err(ExecutionError::EgressDenied { host: host.clone() });
            }
        }

        if !envelope.ok {
            let detail = envelope.error.unwrap_or_else(|| "handler threw".to_string());
            return Err(ExecutionError::handler_failed(detail));
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(ExecutionResult {
            output: envelope.body,
            content_type: envelope.content_type,
            egress: envelope.egress,
            duration_ms,
        })
    }
}

#[async_trait]
impl IsolatedExecutor for ProcessSandbox {
    async fn execute(
        &self,
        bundled_code: &str,
        input: &str,
        key: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        if input.len() > self.config.max_input_bytes {
            return Err(ExecutionError::InputTooLarge {
                size: input.len(),
                limit: self.config.max_input_bytes,
            });
        }

        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::spawn("sandbox is shut down"))?;

        let module = self.prepare(bundled_code, key).await?;
        tracing::debug!(key, input_len = input.len(), "execute: starting");

        let result = self.run(&module, input, key).await;
        match &result {
            Ok(r) => tracing::debug!(key, duration_ms = r.duration_ms, "execute: complete"),
            Err(e) => tracing::warn!(key, error = %e, "execute: failed"),
        }
        result
    }

    async fn evict(&self, key: &str) {
        if self.prepared.remove(key).is_some() {
            tracing::debug!(key, "evicted prepared module");
        }
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), ExecutionError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| ExecutionError::spawn(format!("write {}: {e}", path.display())))
}

/// Read up to `cap` bytes; report whether the stream had more
///
/// With `drain`, bytes past the cap are read and discarded so the child
/// never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, cap: usize, drain: bool) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let Some(mut reader) = reader else {
        return Ok((buf, false));
    };
    let limit = u64::try_from(cap).unwrap_or(u64::MAX).saturating_add(1);
    (&mut reader).take(limit).read_to_end(&mut buf).await?;
    let overflow = buf.len() > cap;
    buf.truncate(cap);
    if overflow && drain {
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }
    Ok((buf, overflow))
}

/// Last lines of stderr for a failure message
fn tail(stderr: &str, code: Option<i32>) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(8);
    let text = lines[start..].join("\n");
    match (text.is_empty(), code) {
        (true, Some(code)) => format!("runtime exited with status {code}"),
        (true, None) => "runtime terminated by signal".to_string(),
        (false, _) => text,
    }
}
