//! Content-addressed build cache
//!
//! One validated [`CachedTool`] per prompt hash. Entries are written only
//! after validation succeeds and are replaced or deleted, never patched.
//!
//! Two backends:
//! - [`MemoryBuildCache`]: moka-backed, process-local
//! - [`ObjectStoreCache`]: JSON objects under `<root>/tools/<hash>.json`

use crate::error::CacheError;
use async_trait::async_trait;
use moka::future::Cache;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use toolsmith_artifact::{CachedTool, PromptHash};

/// Durable store of validated tools keyed by prompt hash
#[async_trait]
pub trait BuildCache: Send + Sync + std::fmt::Debug {
    /// Fetch the tool stored for `hash`
    async fn get(&self, hash: &PromptHash) -> Result<Option<CachedTool>, CacheError>;

    /// Store `tool` under its own hash, replacing any previous entry
    async fn set(&self, tool: &CachedTool) -> Result<(), CacheError>;

    /// Remove the entry for `hash`; removing a missing entry succeeds
    async fn delete(&self, hash: &PromptHash) -> Result<(), CacheError>;

    /// Remove every entry
    async fn clear(&self) -> Result<(), CacheError>;
}

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// In-process build cache
#[derive(Debug, Clone)]
pub struct MemoryBuildCache {
    inner: Cache<PromptHash, Arc<CachedTool>>,
}

impl MemoryBuildCache {
    /// Create cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    /// Create cache with time-based expiration
    #[inline]
    #[must_use]
    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Get cache statistics after applying pending maintenance
    pub async fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks().await;
        CacheStats {
            entry_count: self.inner.entry_count(),
        }
    }
}

impl Default for MemoryBuildCache {
    /// Create cache with default capacity (10,000 entries)
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl BuildCache for MemoryBuildCache {
    async fn get(&self, hash: &PromptHash) -> Result<Option<CachedTool>, CacheError> {
        Ok(self.inner.get(hash).await.map(|tool| (*tool).clone()))
    }

    async fn set(&self, tool: &CachedTool) -> Result<(), CacheError> {
        self.inner.insert(tool.hash, Arc::new(tool.clone())).await;
        Ok(())
    }

    async fn delete(&self, hash: &PromptHash) -> Result<(), CacheError> {
        self.inner.invalidate(hash).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        Ok(())
    }
}

/// File-system object store
///
/// Layout: `<root>/tools/<hash>.json`, the pretty-printed camelCase
/// serialization of [`CachedTool`]. Writes go to a temporary sibling and are
/// renamed into place so readers never observe a partial object.
#[derive(Debug, Clone)]
pub struct ObjectStoreCache {
    root: PathBuf,
}

impl ObjectStoreCache {
    /// Create store rooted at `root` (created lazily on first write)
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    fn object_path(&self, hash: &PromptHash) -> PathBuf {
        self.root.join(CachedTool::object_key(hash))
    }
}

#[async_trait]
impl BuildCache for ObjectStoreCache {
    async fn get(&self, hash: &PromptHash) -> Result<Option<CachedTool>, CacheError> {
        let key = CachedTool::object_key(hash);
        let bytes = match tokio::fs::read(self.object_path(hash)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io_error(key, e)),
        };

        let tool = CachedTool::from_json(&bytes).map_err(|e| CacheError::Corrupt {
            key: key.clone(),
            detail: e.to_string(),
        })?;
        if tool.hash != *hash {
            return Err(CacheError::Corrupt {
                key,
                detail: format!("object holds tool for {}", tool.hash),
            });
        }
        Ok(Some(tool))
    }

    async fn set(&self, tool: &CachedTool) -> Result<(), CacheError> {
        let key = CachedTool::object_key(&tool.hash);
        let bytes = tool
            .to_json()
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let dir = self.tools_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io_error(key.clone(), e))?;

        let final_path = self.object_path(&tool.hash);
        let temp_path = dir.join(format!(".{}.{}.tmp", tool.hash, std::process::id()));
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| CacheError::io_error(key.clone(), e))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(CacheError::io_error(key, e));
        }

        tracing::debug!(key = %key, bytes = bytes.len(), "stored tool object");
        Ok(())
    }

    async fn delete(&self, hash: &PromptHash) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.object_path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io_error(CachedTool::object_key(hash), e)),
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let dir = self.tools_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::io_error("tools/", e)),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io_error("tools/", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| CacheError::io_error(path.display().to_string(), e))?;
            removed += 1;
        }

        tracing::info!(removed, "cleared tool objects");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use toolsmith_artifact::{OutputKind, ToolEntry};

    fn tool(prompt: &str) -> CachedTool {
        CachedTool {
            hash: PromptHash::of_prompt(prompt),
            bundled_code: format!("export async function handle(input) {{ return '{prompt}'; }}"),
            created_at: Utc::now(),
            packages: vec!["uuid".to_string()],
            output_kind: OutputKind::Text,
            output_description: String::new(),
            entry: ToolEntry::NamedHandle,
        }
    }

    #[tokio::test]
    async fn memory_set_get_delete() {
        let cache = MemoryBuildCache::new(100);
        let t = tool("uuid generator");

        assert!(cache.get(&t.hash).await.unwrap().is_none());
        cache.set(&t).await.unwrap();
        assert_eq!(cache.get(&t.hash).await.unwrap(), Some(t.clone()));

        cache.delete(&t.hash).await.unwrap();
        assert!(cache.get(&t.hash).await.unwrap().is_none());
        cache.delete(&t.hash).await.unwrap();
    }

    #[tokio::test]
    async fn memory_set_replaces() {
        let cache = MemoryBuildCache::default();
        let first = tool("x");
        let mut second = first.clone();
        second.bundled_code = "export async function handle() { return 'v2'; }".to_string();

        cache.set(&first).await.unwrap();
        cache.set(&second).await.unwrap();
        assert_eq!(cache.get(&first.hash).await.unwrap().unwrap().bundled_code, second.bundled_code);
        assert_eq!(cache.stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn memory_clear_removes_everything() {
        let cache = MemoryBuildCache::new(100);
        for i in 0..5 {
            cache.set(&tool(&format!("tool {i}"))).await.unwrap();
        }
        assert_eq!(cache.stats().await.entry_count, 5);

        cache.clear().await.unwrap();
        assert_eq!(cache.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn object_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectStoreCache::new(dir.path());
        let t = tool("markdown to html");

        cache.set(&t).await.unwrap();
        let path = dir.path().join(CachedTool::object_key(&t.hash));
        assert!(path.exists());

        let reopened = ObjectStoreCache::new(dir.path());
        assert_eq!(reopened.get(&t.hash).await.unwrap(), Some(t));
    }

    #[tokio::test]
    async fn object_store_missing_root_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectStoreCache::new(dir.path().join("never-created"));
        let hash = PromptHash::of_prompt("anything");

        assert!(cache.get(&hash).await.unwrap().is_none());
        cache.delete(&hash).await.unwrap();
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    async fn object_store_reports_corrupt_objects() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectStoreCache::new(dir.path());
        let hash = PromptHash::of_prompt("broken");

        std::fs::create_dir_all(dir.path().join("tools")).unwrap();
        std::fs::write(dir.path().join(CachedTool::object_key(&hash)), b"{not json").unwrap();

        let err = cache.get(&hash).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn object_store_rejects_misfiled_objects() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectStoreCache::new(dir.path());
        let stored = tool("a");
        let other = PromptHash::of_prompt("b");

        std::fs::create_dir_all(dir.path().join("tools")).unwrap();
        std::fs::write(
            dir.path().join(CachedTool::object_key(&other)),
            stored.to_json().unwrap(),
        )
        .unwrap();

        assert!(matches!(cache.get(&other).await, Err(CacheError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn object_store_clear_keeps_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectStoreCache::new(dir.path());
        cache.set(&tool("one")).await.unwrap();
        cache.set(&tool("two")).await.unwrap();
        std::fs::write(dir.path().join("tools").join("README"), b"keep").unwrap();

        cache.clear().await.unwrap();

        let remaining: Vec<_> = std::fs::read_dir(dir.path().join("tools"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(remaining, vec![std::ffi::OsString::from("README")]);
    }
}
