//! Install and activation of cache generations.
//!
//! Install pre-fetches the static asset list into a new generation and parks
//! it as *waiting*. Activation (or an explicit skip-waiting) promotes it via
//! [`CacheStore::activate_generation`].

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use url::Url;

use crate::cache::http::{Network, Request, RequestKey, Response};
use crate::cache::store::{Bucket, CacheStore, Generation};
use crate::error::{Result, WorkerError};

/// Drives a generation from install to current.
pub struct CacheLifecycle {
    store: Arc<CacheStore>,
    network: Arc<dyn Network>,
    origin: Url,
    generation: Generation,
    static_assets: Vec<String>,
    waiting: Mutex<Option<Generation>>,
}

impl CacheLifecycle {
    pub fn new(
        store: Arc<CacheStore>,
        network: Arc<dyn Network>,
        origin: Url,
        generation: Generation,
        static_assets: Vec<String>,
    ) -> Self {
        Self {
            store,
            network,
            origin,
            generation,
            static_assets,
            waiting: Mutex::new(None),
        }
    }

    /// Generation this worker build installs.
    #[must_use]
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Generation installed but not yet active.
    #[must_use]
    pub fn waiting(&self) -> Option<Generation> {
        self.lock().clone()
    }

    /// Fetch every static asset and store them in the static bucket.
    ///
    /// All assets are fetched before anything is written; a single failed or
    /// non-2xx fetch aborts the install with nothing stored.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::Network`] if an asset cannot be fetched.
    /// - [`WorkerError::Storage`] if writing fails (partial writes are purged).
    pub async fn install(&self) -> Result<Generation> {
        info!(generation = %self.generation, assets = self.static_assets.len(), "installing");

        let entries = fetch_all(&self.origin, self.network.as_ref(), &self.static_assets).await?;
        if let Err(e) = put_all(&self.store, &self.generation, Bucket::Static, &entries).await {
            if let Err(purge_err) = self.store.purge_all(&self.generation).await {
                warn!(generation = %self.generation, error = %purge_err, "failed to purge partial install");
            }
            return Err(e);
        }

        *self.lock() = Some(self.generation.clone());
        info!(generation = %self.generation, "install complete; generation waiting");
        Ok(self.generation.clone())
    }

    /// Make the waiting generation (or this build's generation) current.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Activation`]; the previous generation stays current.
    pub async fn activate(&self) -> Result<Generation> {
        let target = self.waiting().unwrap_or_else(|| self.generation.clone());
        self.store.activate_generation(&target).await?;

        let mut waiting = self.lock();
        if waiting.as_ref() == Some(&target) {
            *waiting = None;
        }
        Ok(target)
    }

    /// Activate a waiting generation now. No-op when nothing is waiting.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Activation`] if the switch fails.
    pub async fn skip_waiting(&self) -> Result<()> {
        if self.waiting().is_none() {
            debug!("skip waiting ignored; no generation waiting");
            return Ok(());
        }
        let generation = self.activate().await?;
        info!(%generation, "skipped waiting");
        Ok(())
    }

    /// Fetch `urls` and store them in the current generation's dynamic bucket.
    ///
    /// Every fetch must succeed before anything is written. If a write fails,
    /// the keys written so far get their previous entries back (or are removed
    /// when they had none); keys after the failure are never touched.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::InvalidCommand`] for URLs that do not resolve.
    /// - [`WorkerError::Network`] if any fetch fails.
    /// - [`WorkerError::Storage`] if no generation is active or a write fails.
    pub async fn cache_assets(&self, urls: &[String]) -> Result<usize> {
        let generation = self
            .store
            .current()
            .await
            .ok_or_else(|| WorkerError::Storage("no active cache generation".to_owned()))?;

        let entries = fetch_all(&self.origin, self.network.as_ref(), urls).await?;
        let mut previous = Vec::with_capacity(entries.len());
        for (key, _) in &entries {
            previous.push(self.store.get_in(&generation, Bucket::Dynamic, key).await?);
        }

        for (written, (key, response)) in entries.iter().enumerate() {
            if let Err(e) = self
                .store
                .put(&generation, Bucket::Dynamic, key, response)
                .await
            {
                self.restore(&generation, &entries[..written], &previous[..written])
                    .await;
                return Err(e);
            }
        }
        Ok(entries.len())
    }

    async fn restore(
        &self,
        generation: &Generation,
        written: &[(RequestKey, Response)],
        previous: &[Option<Response>],
    ) {
        for ((key, _), old) in written.iter().zip(previous) {
            let result = match old {
                Some(old) => self.store.put(generation, Bucket::Dynamic, key, old).await,
                None => self
                    .store
                    .delete(generation, Bucket::Dynamic, key)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                warn!(%key, error = %e, "failed to roll back cached asset");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Generation>> {
        self.waiting
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn fetch_all(
    origin: &Url,
    network: &dyn Network,
    paths: &[String],
) -> Result<Vec<(RequestKey, Response)>> {
    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let url = origin
            .join(path)
            .map_err(|e| WorkerError::InvalidCommand(format!("bad asset url {path}: {e}")))?;
        let request = Request::get(url);
        let response = network.fetch(&request).await?;
        if !response.is_success() {
            return Err(WorkerError::Network(format!(
                "{} returned {}",
                request.url, response.status
            )));
        }
        entries.push((request.key(), response));
    }
    Ok(entries)
}

async fn put_all(
    store: &CacheStore,
    generation: &Generation,
    bucket: Bucket,
    entries: &[(RequestKey, Response)],
) -> Result<()> {
    for (key, response) in entries {
        store.put(generation, bucket, key, response).await?;
    }
    Ok(())
}
