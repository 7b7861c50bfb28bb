use async_trait::async_trait;
use mockall::mock;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use toolsmith_artifact::{CachedTool, PromptHash};
use toolsmith_build::{BuildCache, CacheError};
use toolsmith_core::ToolRequest;
use toolsmith_test_utils::{uuid_tool, PipelineHarness, ScriptedGenerator, FIXTURE_UUID_JSON};

mock! {
    pub Cache {}

    #[async_trait]
    impl BuildCache for Cache {
        async fn get(&self, hash: &PromptHash) -> Result<Option<CachedTool>, CacheError>;
        async fn set(&self, tool: &CachedTool) -> Result<(), CacheError>;
        async fn delete(&self, hash: &PromptHash) -> Result<(), CacheError>;
        async fn clear(&self) -> Result<(), CacheError>;
    }
}

impl std::fmt::Debug for MockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockCache")
    }
}

const PROMPT: &str = "Make a UUID generator using the uuid package";

#[tokio::test]
async fn unreachable_cache_is_a_miss() {
    let mut cache = MockCache::new();
    // request lookup plus the build's re-check
    cache
        .expect_get()
        .times(2)
        .returning(|_| Err(CacheError::Unavailable("connection refused".to_string())));
    cache.expect_set().times(1).returning(|_| Ok(()));
    cache.expect_delete().never();

    let harness = PipelineHarness::with_cache(ScriptedGenerator::always(uuid_tool()), Arc::new(cache));
    let response = harness.orchestrator.run(ToolRequest::new(PROMPT)).await.unwrap();

    assert!(!response.cached);
    assert_eq!(response.output, FIXTURE_UUID_JSON);
    assert!(response.warnings.is_empty());
}

#[tokio::test]
async fn corrupt_entry_is_deleted_and_rebuilt() {
    let hash = PromptHash::of_prompt(PROMPT);
    let mut cache = MockCache::new();
    let mut reads = 0;
    cache.expect_get().times(2).returning(move |hash| {
        reads += 1;
        if reads > 1 {
            return Ok(None);
        }
        Err(CacheError::Corrupt {
            key: CachedTool::object_key(hash),
            detail: "expected value at line 1 column 1".to_string(),
        })
    });
    cache
        .expect_delete()
        .withf(move |h| *h == hash)
        .times(1)
        .returning(|_| Ok(()));
    cache.expect_set().times(1).returning(|_| Ok(()));

    let harness = PipelineHarness::with_cache(ScriptedGenerator::always(uuid_tool()), Arc::new(cache));
    let response = harness.orchestrator.run(ToolRequest::new(PROMPT)).await.unwrap();

    assert!(!response.cached);
    assert_eq!(harness.generator.calls(), 1);
}

#[tokio::test]
async fn failed_write_is_served_with_a_warning() {
    let mut cache = MockCache::new();
    cache.expect_get().returning(|_| Ok(None));
    cache.expect_set().times(1).returning(|_| {
        Err(CacheError::Unavailable(
            "bucket rejected request: token=abc123secret".to_string(),
        ))
    });

    let harness = PipelineHarness::with_cache(ScriptedGenerator::always(uuid_tool()), Arc::new(cache));
    let response = harness.orchestrator.run(ToolRequest::new(PROMPT)).await.unwrap();

    assert_eq!(response.output, FIXTURE_UUID_JSON);
    assert_eq!(response.warnings.len(), 1);
    assert!(response.warnings[0].starts_with("build not cached"));
    assert!(!response.warnings[0].contains("abc123secret"));
}

#[tokio::test]
async fn cache_hit_skips_generation() {
    let hash = PromptHash::of_prompt(PROMPT);
    let seeded = PipelineHarness::new(ScriptedGenerator::always(uuid_tool()));
    seeded.orchestrator.run(ToolRequest::new(PROMPT)).await.unwrap();
    let stored = seeded.cache.get(&hash).await.unwrap().unwrap();

    let mut cache = MockCache::new();
    cache
        .expect_get()
        .times(1)
        .returning(move |_| Ok(Some(stored.clone())));
    cache.expect_set().never();

    let harness = PipelineHarness::with_cache(ScriptedGenerator::always(uuid_tool()), Arc::new(cache));
    let response = harness.orchestrator.run(ToolRequest::new(PROMPT)).await.unwrap();

    assert!(response.cached);
    assert_eq!(harness.generator.calls(), 0);
    assert_eq!(harness.compiler.compiles(), 0);
    assert_eq!(harness.executor.keys(), vec![hash.execution_key()]);
}

#[tokio::test]
async fn admin_errors_surface() {
    let mut cache = MockCache::new();
    cache
        .expect_clear()
        .returning(|| Err(CacheError::Unavailable("read-only store".to_string())));

    let harness = PipelineHarness::with_cache(ScriptedGenerator::default(), Arc::new(cache));
    let err = harness.orchestrator.clear_cache().await.unwrap_err();

    assert_eq!(err.to_string(), "cache unavailable: read-only store");
}
