//! Versioned response store.
//!
//! Every generation owns at most two buckets, `{prefix}-static-{version}` and
//! `{prefix}-dynamic-{version}`. Exactly one generation is current. Readers
//! take the generation pointer once (under a read lock held for the whole
//! lookup), and activation holds the write lock while it deletes old buckets
//! and moves the pointer, so no reader sees a half-switched store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::backend::CacheBackend;
use crate::cache::http::{RequestKey, Response};
use crate::error::{Result, WorkerError};

/// Partition of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Assets enumerated at install time.
    Static,
    /// Responses cached opportunistically at runtime.
    Dynamic,
}

impl Bucket {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

/// Version tag naming one snapshot of the cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(String);

impl Generation {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
struct GenerationState {
    current: Option<Generation>,
    retired: HashSet<Generation>,
}

/// Versioned key/value store of cached responses.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    state: RwLock<GenerationState>,
}

impl CacheStore {
    /// Create a store with no current generation.
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            state: RwLock::new(GenerationState::default()),
        }
    }

    /// Storage name of one bucket.
    #[must_use]
    pub fn bucket_name(&self, generation: &Generation, bucket: Bucket) -> String {
        format!("{}-{}-{}", self.prefix, bucket.as_str(), generation)
    }

    /// Currently active generation, if any activation has succeeded.
    pub async fn current(&self) -> Option<Generation> {
        self.state.read().await.current.clone()
    }

    /// Store `response` under `key` in one bucket of `generation`, overwriting.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Storage`] if the backend write fails or the
    /// generation has already been retired.
    pub async fn put(
        &self,
        generation: &Generation,
        bucket: Bucket,
        key: &RequestKey,
        response: &Response,
    ) -> Result<()> {
        let state = self.state.read().await;
        if state.retired.contains(generation) {
            return Err(WorkerError::Storage(format!(
                "generation {generation} is retired; not caching {key}"
            )));
        }
        let name = self.bucket_name(generation, bucket);
        self.backend.put(&name, key, response).await?;
        debug!(bucket = %name, %key, "cached response");
        Ok(())
    }

    /// Remove `key` from one bucket of `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Storage`] if the backend delete fails.
    pub async fn delete(
        &self,
        generation: &Generation,
        bucket: Bucket,
        key: &RequestKey,
    ) -> Result<bool> {
        let _state = self.state.read().await;
        self.backend
            .delete(&self.bucket_name(generation, bucket), key)
            .await
    }

    /// Read `key` from one bucket of `generation`, active or not.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Storage`] if the backend read fails.
    pub async fn get_in(
        &self,
        generation: &Generation,
        bucket: Bucket,
        key: &RequestKey,
    ) -> Result<Option<Response>> {
        let _state = self.state.read().await;
        self.backend
            .get(&self.bucket_name(generation, bucket), key)
            .await
    }

    /// Look up `key` in the current generation: static bucket first, then dynamic.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Storage`] if the backend read fails.
    pub async fn get(&self, key: &RequestKey) -> Result<Option<Response>> {
        let state = self.state.read().await;
        let Some(generation) = state.current.as_ref() else {
            return Ok(None);
        };

        for bucket in [Bucket::Static, Bucket::Dynamic] {
            let name = self.bucket_name(generation, bucket);
            if let Some(hit) = self.backend.get(&name, key).await? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    /// Keys stored in one bucket of `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Storage`] if the backend listing fails.
    pub async fn keys(&self, generation: &Generation, bucket: Bucket) -> Result<Vec<RequestKey>> {
        let _state = self.state.read().await;
        self.backend.keys(&self.bucket_name(generation, bucket)).await
    }

    /// Delete every bucket not belonging to `new_generation`, then make it current.
    ///
    /// The previously current generation's buckets are deleted last. Any
    /// backend failure aborts the activation and leaves the pointer where it
    /// was.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Activation`] if any bucket cannot be listed or deleted.
    pub async fn activate_generation(&self, new_generation: &Generation) -> Result<()> {
        let mut state = self.state.write().await;

        let keep: HashSet<String> = [Bucket::Static, Bucket::Dynamic]
            .into_iter()
            .map(|b| self.bucket_name(new_generation, b))
            .collect();
        let previous: HashSet<String> = state
            .current
            .iter()
            .flat_map(|g| [Bucket::Static, Bucket::Dynamic].map(|b| self.bucket_name(g, b)))
            .collect();

        let names = self.backend.bucket_names().await.map_err(|e| {
            WorkerError::Activation(format!("cannot list buckets for {new_generation}: {e}"))
        })?;

        let mut doomed: Vec<String> = names.into_iter().filter(|n| !keep.contains(n)).collect();
        doomed.sort_by_key(|n| previous.contains(n));

        for name in &doomed {
            info!(bucket = %name, "removing superseded cache bucket");
            self.backend.delete_bucket(name).await.map_err(|e| {
                warn!(bucket = %name, error = %e, "activation aborted");
                WorkerError::Activation(format!(
                    "cannot delete {name} while activating {new_generation}: {e}"
                ))
            })?;
        }

        if let Some(old) = state.current.take() {
            if &old != new_generation {
                state.retired.insert(old);
            }
        }
        state.retired.remove(new_generation);
        state.current = Some(new_generation.clone());
        info!(generation = %new_generation, removed = doomed.len(), "cache generation activated");
        Ok(())
    }

    /// Delete both buckets of `generation`, independent of activation.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Storage`] if a bucket cannot be deleted.
    pub async fn purge_all(&self, generation: &Generation) -> Result<()> {
        let _state = self.state.write().await;
        for bucket in [Bucket::Static, Bucket::Dynamic] {
            let name = self.bucket_name(generation, bucket);
            if self.backend.delete_bucket(&name).await? {
                info!(bucket = %name, "cache bucket purged");
            }
        }
        Ok(())
    }
}
