//! In-flight build registry
//!
//! At most one build runs per [`PromptHash`]. The first request for a key
//! starts the build on its own task; later requests for the same key await
//! the same shared future. The entry is removed as soon as the build settles,
//! whatever the outcome, so a failed build is never replayed to later callers.

use crate::error::PipelineError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use toolsmith_artifact::PromptHash;

/// Shared handle to a build result
pub type SharedBuild<T> = Shared<BoxFuture<'static, Result<Arc<T>, PipelineError>>>;

type Builds<T> = DashMap<PromptHash, (u64, SharedBuild<T>)>;

/// Registry of builds currently running
pub struct InflightRegistry<T> {
    builds: Arc<Builds<T>>,
    next_id: AtomicU64,
}

impl<T> Default for InflightRegistry<T> {
    fn default() -> Self {
        Self {
            builds: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Debug for InflightRegistry<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightRegistry")
            .field("in_flight", &self.builds.len())
            .finish()
    }
}

/// Removes a registry entry when the build task ends, even by panic
struct Deregister<T> {
    builds: Arc<Builds<T>>,
    hash: PromptHash,
    id: u64,
}

impl<T> Drop for Deregister<T> {
    fn drop(&mut self) {
        self.builds
            .remove_if(&self.hash, |_, (entry_id, _)| *entry_id == self.id);
    }
}

impl<T: Send + Sync + 'static> InflightRegistry<T> {
    /// Create empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of builds currently running
    #[must_use]
    pub fn len(&self) -> usize {
        self.builds.len()
    }

    /// Whether no build is running
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    /// Whether a build for `hash` is running
    #[must_use]
    pub fn contains(&self, hash: &PromptHash) -> bool {
        self.builds.contains_key(hash)
    }

    /// Join the running build for `hash`, or start one with `make`
    ///
    /// Returns the shared build and whether this call started it. `make` is
    /// only invoked when no build is running. Must be called inside a Tokio
    /// runtime.
    pub fn join_or_start<F, Fut>(&self, hash: PromptHash, make: F) -> (SharedBuild<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let (tx, id, shared) = match self.builds.entry(hash) {
            Entry::Occupied(entry) => return (entry.get().1.clone(), false),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel::<Result<Arc<T>, PipelineError>>();
                let shared = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(PipelineError::Internal("build task ended without a result".to_string()))
                    })
                }
                .boxed()
                .shared();
                entry.insert((id, shared.clone()));
                (tx, id, shared)
            }
        };

        let build = make();
        let guard = Deregister {
            builds: Arc::clone(&self.builds),
            hash,
            id,
        };
        tokio::spawn(async move {
            let result = build.await.map(Arc::new);
            drop(guard);
            let _ = tx.send(result);
        });

        (shared, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_build() {
        let registry = Arc::new(InflightRegistry::<u32>::new());
        let starts = Arc::new(AtomicUsize::new(0));
        let hash = PromptHash::of_prompt("uuid");

        let mut joins = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let starts = Arc::clone(&starts);
            joins.push(tokio::spawn(async move {
                let (build, _) = registry.join_or_start(hash, || {
                    starts.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    }
                });
                build.await
            }));
        }

        for join in joins {
            assert_eq!(*join.await.unwrap().unwrap(), 7);
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn entry_removed_after_failure() {
        let registry = InflightRegistry::<u32>::new();
        let hash = PromptHash::of_prompt("broken");

        let (build, leader) =
            registry.join_or_start(hash, || async { Err(PipelineError::input("nope")) });
        assert!(leader);
        assert_eq!(build.await.unwrap_err(), PipelineError::input("nope"));
        assert!(!registry.contains(&hash));

        let (build, leader) = registry.join_or_start(hash, || async { Ok(1) });
        assert!(leader);
        assert_eq!(*build.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn late_joiner_is_not_leader() {
        let registry = InflightRegistry::<u32>::new();
        let hash = PromptHash::of_prompt("slow");
        let (first, leader) = registry.join_or_start(hash, || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(2)
        });
        assert!(leader);
        let (second, leader) = registry.join_or_start(hash, || async { Ok(99) });
        assert!(!leader);
        assert_eq!(registry.len(), 1);
        assert_eq!(*first.await.unwrap(), 2);
        assert_eq!(*second.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn panicking_build_reports_internal_error() {
        let registry = InflightRegistry::<u32>::new();
        let hash = PromptHash::of_prompt("panics");
        let (build, _) = registry.join_or_start(hash, move || async move {
            if hash.short().len() > 1 {
                panic!("build exploded");
            }
            Ok(0)
        });
        assert!(matches!(build.await, Err(PipelineError::Internal(_))));
        assert!(registry.is_empty());
    }
}
