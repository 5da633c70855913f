//! Offline cache engine.
//!
//! [`store::CacheStore`] owns versioned buckets of cached responses and the
//! generation switch; [`strategy::CacheStrategy`] decides per request whether
//! the cache or the network answers first; [`lifecycle::CacheLifecycle`]
//! installs and activates generations.

pub mod backend;
pub mod http;
pub mod lifecycle;
pub mod store;
pub mod strategy;

pub use backend::{CacheBackend, DiskBackend, MemoryBackend};
pub use http::{HttpNetwork, Network, Request, RequestKey, Response};
pub use lifecycle::CacheLifecycle;
pub use store::{Bucket, CacheStore, Generation};
pub use strategy::{CacheStrategy, FetchOutcome, RequestClass};
