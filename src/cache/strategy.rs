//! Per-request cache policy.
//!
//! - Data requests (JSON `Accept` or API path): network first, cache as fallback.
//! - Asset requests: cache first with a background refresh on every hit,
//!   network on a miss, offline placeholders when both fail.
//! - Non-GET or cross-origin requests are not intercepted.

use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use url::Url;

use crate::cache::http::{Network, Request, RequestKey, Response};
use crate::cache::store::{Bucket, CacheStore};
use crate::error::{Result, WorkerError};

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// JSON/API traffic: network first.
    Data,
    /// Everything else, navigations included: cache first.
    Asset,
}

/// Result of handling a fetch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not intercepted; the host sends it straight to the network.
    Bypass,
    /// Answer the request with this response.
    Respond(Response),
}

/// Cache strategy engine.
pub struct CacheStrategy {
    store: Arc<CacheStore>,
    network: Arc<dyn Network>,
    origin: Url,
    api_prefix: String,
    offline_page: RequestKey,
    refreshes: TaskTracker,
}

impl CacheStrategy {
    pub fn new(
        store: Arc<CacheStore>,
        network: Arc<dyn Network>,
        origin: Url,
        api_prefix: impl Into<String>,
        offline_page: &str,
    ) -> Result<Self> {
        let offline_url = origin
            .join(offline_page)
            .map_err(|e| WorkerError::Config(format!("bad offline page {offline_page}: {e}")))?;
        Ok(Self {
            store,
            network,
            origin,
            api_prefix: api_prefix.into(),
            offline_page: RequestKey::new("GET", &offline_url),
            refreshes: TaskTracker::new(),
        })
    }

    /// Decide whether and how a request is intercepted. `None` means bypass.
    #[must_use]
    pub fn classify(&self, request: &Request) -> Option<RequestClass> {
        if !request.is_get() || request.url.origin() != self.origin.origin() {
            return None;
        }

        let wants_json = request
            .accept
            .as_deref()
            .is_some_and(|accept| accept.contains("application/json"));
        if wants_json || request.url.path().contains(&self.api_prefix) {
            Some(RequestClass::Data)
        } else {
            Some(RequestClass::Asset)
        }
    }

    /// Handle one fetch event.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Offline`] for a data request when the network
    /// fails and nothing is cached. Asset requests never fail.
    pub async fn handle(&self, request: &Request) -> Result<FetchOutcome> {
        match self.classify(request) {
            None => Ok(FetchOutcome::Bypass),
            Some(RequestClass::Data) => self.network_first(request).await.map(FetchOutcome::Respond),
            Some(RequestClass::Asset) => Ok(FetchOutcome::Respond(self.cache_first(request).await)),
        }
    }

    async fn network_first(&self, request: &Request) -> Result<Response> {
        match fetch_and_cache(&self.store, self.network.as_ref(), request).await {
            Ok(live) => Ok(live),
            Err(net_err) => {
                debug!(url = %request.url, error = %net_err, "data request falling back to cache");
                match self.store.get(&request.key()).await {
                    Ok(Some(cached)) => Ok(cached),
                    Ok(None) => Err(WorkerError::Offline(format!(
                        "{} unreachable and not cached: {net_err}",
                        request.url
                    ))),
                    Err(store_err) => Err(WorkerError::Offline(format!(
                        "{} unreachable ({net_err}) and cache unreadable ({store_err})",
                        request.url
                    ))),
                }
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Response {
        let cached = self.store.get(&request.key()).await.unwrap_or_else(|e| {
            warn!(url = %request.url, error = %e, "cache read failed; treating as miss");
            None
        });

        if let Some(hit) = cached {
            self.spawn_refresh(request.clone());
            return hit;
        }

        match fetch_and_cache(&self.store, self.network.as_ref(), request).await {
            Ok(live) => live,
            Err(e) => {
                debug!(url = %request.url, error = %e, "asset unavailable offline");
                if request.is_navigation() {
                    self.offline_placeholder().await
                } else {
                    Response::offline()
                }
            }
        }
    }

    async fn offline_placeholder(&self) -> Response {
        match self.store.get(&self.offline_page).await {
            Ok(Some(page)) => page,
            Ok(None) => Response::offline_page(),
            Err(e) => {
                warn!(error = %e, "offline page lookup failed");
                Response::offline_page()
            }
        }
    }

    fn spawn_refresh(&self, request: Request) {
        let store = Arc::clone(&self.store);
        let network = Arc::clone(&self.network);
        self.refreshes.spawn(async move {
            if let Err(e) = fetch_and_cache(&store, network.as_ref(), &request).await {
                debug!(url = %request.url, error = %e, "background refresh failed");
            }
        });
    }

    /// Wait for every in-flight background refresh to finish.
    pub async fn settle(&self) {
        self.refreshes.close();
        self.refreshes.wait().await;
        self.refreshes.reopen();
    }
}

/// Fetch from the network and, for 2xx responses, store a copy in the
/// current generation's dynamic bucket. Cache write failures are logged and
/// swallowed.
async fn fetch_and_cache(
    store: &CacheStore,
    network: &dyn Network,
    request: &Request,
) -> Result<Response> {
    let live = network.fetch(request).await?;
    if !live.is_success() {
        return Ok(live);
    }

    match store.current().await {
        Some(generation) => {
            if let Err(e) = store
                .put(&generation, Bucket::Dynamic, &request.key(), &live)
                .await
            {
                warn!(url = %request.url, error = %e, "failed to cache response");
            }
        }
        None => debug!(url = %request.url, "no active generation; response not cached"),
    }
    Ok(live)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::cache::backend::MemoryBackend;

    struct NoNetwork;

    #[async_trait::async_trait]
    impl Network for NoNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response> {
            Err(WorkerError::Network(format!("offline: {}", request.url)))
        }
    }

    fn strategy() -> CacheStrategy {
        let store = Arc::new(CacheStore::new(Arc::new(MemoryBackend::new()), "app"));
        CacheStrategy::new(
            store,
            Arc::new(NoNetwork),
            Url::parse("http://app.test").unwrap(),
            "/api/",
            "/",
        )
        .unwrap()
    }

    fn req(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn classification() {
        let s = strategy();
        assert_eq!(s.classify(&req("http://app.test/api/meds")), Some(RequestClass::Data));
        assert_eq!(
            s.classify(&req("http://app.test/data").with_accept("application/json, */*")),
            Some(RequestClass::Data)
        );
        assert_eq!(s.classify(&req("http://app.test/icon-72.png")), Some(RequestClass::Asset));
        assert_eq!(s.classify(&req("http://app.test/").as_navigation()), Some(RequestClass::Asset));
        assert_eq!(s.classify(&req("http://cdn.test/lib.js")), None);

        let mut post = req("http://app.test/api/meds");
        post.method = "POST".to_owned();
        assert_eq!(s.classify(&post), None);
    }

    #[tokio::test]
    async fn bypassed_requests_are_not_touched() {
        let s = strategy();
        let outcome = s.handle(&req("https://other.test/x.png")).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Bypass);
    }

    #[tokio::test]
    async fn navigation_without_cache_gets_builtin_offline_page() {
        let s = strategy();
        let outcome = s.handle(&req("http://app.test/home").as_navigation()).await.unwrap();
        let FetchOutcome::Respond(resp) = outcome else {
            panic!("expected a response");
        };
        assert_eq!(resp.status, 503);
        assert!(resp.header("content-type").unwrap().starts_with("text/html"));
    }

    #[tokio::test]
    async fn data_request_offline_and_uncached_fails() {
        let s = strategy();
        let err = s.handle(&req("http://app.test/api/meds")).await;
        assert!(matches!(err, Err(WorkerError::Offline(_))));
    }
}
