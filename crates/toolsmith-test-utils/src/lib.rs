//! Testing utilities for the toolsmith workspace
//!
//! Scripted stand-ins for the pipeline's external collaborators, plus
//! fixture tools covering the common success and failure paths.

#![allow(missing_docs)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolsmith_artifact::{ExecutionResult, GeneratedCode, OutputKind};
use toolsmith_build::{
    BuildCache, CompileError, CompiledModule, Compiler, EsmBundler, MemoryBuildCache,
    StaticResolver,
};
use toolsmith_core::{CodeGenerator, GeneratorError, Orchestrator};
use toolsmith_sandbox::{ExecutionError, IsolatedExecutor};

/// Generator that replays a script of responses
///
/// Once the script runs out, the last response repeats.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GeneratedCode, GeneratorError>>>,
    last: Mutex<Option<Result<GeneratedCode, GeneratorError>>>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<GeneratedCode, GeneratorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Always return the same code
    pub fn always(code: GeneratedCode) -> Self {
        Self::new(vec![Ok(code)])
    }

    /// Sleep before every response
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Context passed to each call, in order
    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, _prompt: &str, context: &str) -> Result<GeneratedCode, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        (*last)
            .clone()
            .unwrap_or_else(|| Err(GeneratorError::NotConfigured("empty script".to_string())))
    }
}

/// Offline bundler that counts compilations
#[derive(Debug)]
pub struct CountingCompiler {
    inner: EsmBundler,
    compiles: AtomicUsize,
}

impl Default for CountingCompiler {
    fn default() -> Self {
        Self {
            inner: EsmBundler::new(Arc::new(StaticResolver::default())),
            compiles: AtomicUsize::new(0),
        }
    }
}

impl CountingCompiler {
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compiler for CountingCompiler {
    async fn compile(&self, source: &str) -> Result<CompiledModule, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(source).await
    }
}

type Responder = Arc<dyn Fn(&str) -> Result<ExecutionResult, ExecutionError> + Send + Sync>;

/// Executor that answers by matching a needle in the bundled code
#[derive(Default)]
pub struct FakeExecutor {
    rules: Vec<(String, Responder)>,
    executions: AtomicUsize,
    evictions: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
}

impl Debug for FakeExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeExecutor")
            .field("rules", &self.rules.len())
            .field("executions", &self.executions())
            .finish()
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer code containing `needle` with `respond(input)`
    #[must_use]
    pub fn on<F>(mut self, needle: &str, respond: F) -> Self
    where
        F: Fn(&str) -> Result<ExecutionResult, ExecutionError> + Send + Sync + 'static,
    {
        self.rules.push((needle.to_string(), Arc::new(respond)));
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Execution keys in call order
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn evictions(&self) -> Vec<String> {
        self.evictions.lock().unwrap().clone()
    }
}

#[async_trait]
impl IsolatedExecutor for FakeExecutor {
    async fn execute(
        &self,
        bundled_code: &str,
        input: &str,
        key: &str,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(key.to_string());
        self.rules
            .iter()
            .find(|(needle, _)| bundled_code.contains(needle.as_str()))
            .map_or_else(
                || Err(ExecutionError::handler_failed("no fixture matches this module")),
                |(_, respond)| respond(input),
            )
    }

    async fn evict(&self, key: &str) {
        self.evictions.lock().unwrap().push(key.to_string());
    }
}

/// UUID produced by the UUID tool fixture
pub const FIXTURE_UUID: &str = "9b2e7c1a-4f0d-4c8e-a1b3-5d6f7e8a9b0c";

/// Full JSON body served by the UUID tool fixture
pub const FIXTURE_UUID_JSON: &str = r#"{"uuid":"9b2e7c1a-4f0d-4c8e-a1b3-5d6f7e8a9b0c"}"#;

/// Scenario A: UUID generator using the uuid package
pub fn uuid_tool() -> GeneratedCode {
    GeneratedCode::new(
        r#"// fixture: uuid
import { v4 as uuidv4 } from "uuid";
export default {
  async fetch(request) {
    return new Response(JSON.stringify({ uuid: uuidv4() }), {
      headers: { "content-type": "application/json" },
    });
  },
}
"#,
        OutputKind::Json,
    )
    .with_description("JSON object holding a random v4 UUID")
}

/// Scenario B: markdown to HTML
pub fn markdown_tool() -> GeneratedCode {
    GeneratedCode::new(
        r#"// fixture: markdown
import { marked } from "marked";
export async function handle(input) {
  return new Response(await marked.parse(input), { headers: { "content-type": "text/html" } });
}
"#,
        OutputKind::Html,
    )
    .with_example_input("# Hello")
    .with_description("HTML rendering of the markdown input")
}

/// Scenario C: reads the filesystem
pub fn fs_tool() -> GeneratedCode {
    GeneratedCode::new(
        r#"// fixture: fs
import { readFileSync } from "fs";
export default (input) => readFileSync(input, "utf8");
"#,
        OutputKind::Text,
    )
    .with_example_input("/etc/hostname")
}

/// Tool whose output is always empty
pub fn empty_output_tool() -> GeneratedCode {
    GeneratedCode::new(
        "// fixture: empty\nexport default () => \"\";\n",
        OutputKind::Text,
    )
}

/// Tool declared as JSON that serves SVG
pub fn svg_as_json_tool() -> GeneratedCode {
    GeneratedCode::new(
        r#"// fixture: svg-as-json
export default () => new Response("<svg xmlns=\"http://www.w3.org/2000/svg\"/>", {
  headers: { "content-type": "application/json" },
});
"#,
        OutputKind::Json,
    )
}

/// Tool whose handler throws at runtime
pub fn throwing_tool() -> GeneratedCode {
    GeneratedCode::new(
        "// fixture: throws\nexport default () => { throw new Error(\"kaput\"); };\n",
        OutputKind::Text,
    )
}

/// Executor answering every fixture tool
pub fn fixture_executor() -> FakeExecutor {
    FakeExecutor::new()
        .on("fixture: uuid", |_| {
            Ok(ExecutionResult::new(FIXTURE_UUID_JSON, "application/json"))
        })
        .on("fixture: markdown", |input| {
            let heading = input.trim().trim_start_matches('#').trim();
            Ok(ExecutionResult::new(
                format!("<h1>{heading}</h1>\n"),
                "text/html; charset=utf-8",
            ))
        })
        .on("fixture: fs", |_| {
            Err(ExecutionError::handler_failed("TypeError: fs is not available"))
        })
        .on("fixture: empty", |_| Ok(ExecutionResult::new("", "text/plain")))
        .on("fixture: svg-as-json", |_| {
            Ok(ExecutionResult::new(
                r#"<svg xmlns="http://www.w3.org/2000/svg"/>"#,
                "application/json",
            ))
        })
        .on("fixture: throws", |_| {
            Err(ExecutionError::handler_failed("Error: kaput\n    at handle (tool.ts:2:30)"))
        })
}

/// Orchestrator wired to scripted collaborators
#[derive(Debug)]
pub struct PipelineHarness {
    pub orchestrator: Orchestrator,
    pub cache: Arc<dyn BuildCache>,
    pub generator: Arc<ScriptedGenerator>,
    pub compiler: Arc<CountingCompiler>,
    pub executor: Arc<FakeExecutor>,
}

impl PipelineHarness {
    /// Harness with a memory cache and the fixture executor
    pub fn new(generator: ScriptedGenerator) -> Self {
        Self::with_cache(generator, Arc::new(MemoryBuildCache::default()))
    }

    /// Harness with a caller-supplied cache
    pub fn with_cache(generator: ScriptedGenerator, cache: Arc<dyn BuildCache>) -> Self {
        Self::with_parts(generator, cache, fixture_executor())
    }

    pub fn with_parts(
        generator: ScriptedGenerator,
        cache: Arc<dyn BuildCache>,
        executor: FakeExecutor,
    ) -> Self {
        let generator = Arc::new(generator);
        let compiler = Arc::new(CountingCompiler::default());
        let executor = Arc::new(executor);
        let orchestrator = Orchestrator::new(
            Arc::clone(&cache),
            Arc::clone(&generator) as Arc<dyn CodeGenerator>,
            Arc::clone(&compiler) as Arc<dyn Compiler>,
            Arc::clone(&executor) as Arc<dyn IsolatedExecutor>,
        );
        Self {
            orchestrator,
            cache,
            generator,
            compiler,
            executor,
        }
    }

    /// Replace the orchestrator, keeping the collaborators
    #[must_use]
    pub fn map_orchestrator(mut self, f: impl FnOnce(Orchestrator) -> Orchestrator) -> Self {
        self.orchestrator = f(self.orchestrator);
        self
    }
}
