use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::entry::{Entry, EntryStore, Freshness};
use crate::error::{BoxError, Error};
use crate::flight::Flights;

/// Configuration for the Cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long after a write an entry is served without fetching.
    pub fresh_for: Duration,
    /// How long after a write an entry may still be served while refreshing.
    pub ttl: Duration,
}

impl CacheConfig {
    pub fn new(fresh_for: Duration, ttl: Duration) -> Self {
        Self { fresh_for, ttl }
    }

    /// Clamps `fresh_for` to `ttl`, so that entries go straight from fresh to
    /// expired instead of having an empty stale window.
    fn effective(self) -> Self {
        if self.fresh_for <= self.ttl {
            return self;
        }
        tracing::warn!(
            fresh_for = ?self.fresh_for,
            ttl = ?self.ttl,
            "fresh_for exceeds ttl, clamping it to ttl"
        );
        Self {
            fresh_for: self.ttl,
            ttl: self.ttl,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_for: Duration::from_secs(1),
            ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner<V> {
    config: CacheConfig,
    entries: EntryStore<V>,
    flights: Flights<V>,
}

/// A keyed cache that runs at most one fetch per key at a time and can serve
/// stale values while a refresh runs in the background.
///
/// Cloning is cheap; clones share the same entries and in-flight fetches.
#[derive(Debug)]
pub struct Cache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache whose entries are fresh for `fresh_for` and usable
    /// as a stale fallback until `ttl` after they were written.
    pub fn new(fresh_for: Duration, ttl: Duration) -> Self {
        Self::with_config(CacheConfig::new(fresh_for, ttl))
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let config = config.effective();
        Self {
            inner: Arc::new(Inner {
                config,
                entries: EntryStore::new(config.fresh_for, config.ttl),
                flights: Flights::new(),
            }),
        }
    }

    /// Gets the effective cache configuration
    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    /// Gets a value, accepting a stale one.
    ///
    /// A stale value is returned immediately and a refresh is started in the
    /// background; failures of that refresh are logged, not returned. Missing
    /// or expired values are fetched before returning.
    pub async fn get<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.read(key, false, fetch).await
    }

    /// Gets a value, fetching unless the stored one is fresh.
    pub async fn get_fresh<F, Fut, E>(&self, key: &str, fetch: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.read(key, true, fetch).await
    }

    /// Fetches and stores a value regardless of what is cached.
    ///
    /// Concurrent calls for the same key share one fetch; the flag is `true`
    /// for callers that received another caller's result. The entry is stored
    /// before any caller sees a successful result, and left untouched on error.
    pub async fn set<F, Fut, E>(&self, key: &str, fetch: F) -> Result<(V, bool), Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let (outcome, shared) = self
            .inner
            .flights
            .run(key, || write_back(inner, key.to_owned(), fetch()))
            .await;
        outcome.map(|value| (value, shared))
    }

    /// Returns a copy of the stored entry, without fetching.
    pub fn lookup(&self, key: &str) -> Option<Entry<V>> {
        self.inner.entries.lookup(key)
    }

    /// Classifies the stored entry for `key` as of now.
    pub fn freshness(&self, key: &str) -> Freshness {
        crate::entry::classify(self.lookup(key).as_ref(), Instant::now())
    }

    /// Gets the number of stored entries
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Gets the number of keys with a fetch in flight
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    async fn read<F, Fut, E>(&self, key: &str, strict: bool, fetch: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if let Some(entry) = self.lookup(key) {
            match entry.freshness(Instant::now()) {
                Freshness::Fresh => {
                    tracing::trace!(key, "fresh hit");
                    return Ok(entry.value);
                }
                Freshness::Stale if !strict => {
                    tracing::trace!(key, "serving stale value");
                    self.refresh(key, fetch);
                    return Ok(entry.value);
                }
                Freshness::Stale | Freshness::Expired => {}
            }
        }

        self.set(key, fetch).await.map(|(value, _)| value)
    }

    /// Starts a refresh for `key` without waiting for it.
    ///
    /// The flight is registered before this returns, so concurrent stale reads
    /// collapse into it.
    fn refresh<F, Fut, E>(&self, key: &str, fetch: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let flight = self
            .inner
            .flights
            .start(key, || write_back(inner, key.to_owned(), fetch()));
        if flight.is_shared() {
            return;
        }

        let key = key.to_owned();
        tokio::spawn(async move {
            if let Err(error) = flight.outcome().await {
                tracing::warn!(key = %key, %error, "background refresh failed");
            }
        });
    }
}

/// Wraps a fetch so that a successful value is stored before it is published.
async fn write_back<V, Fut, E>(inner: Arc<Inner<V>>, key: String, fetch: Fut) -> Result<V, BoxError>
where
    V: Clone,
    Fut: Future<Output = Result<V, E>>,
    E: Into<BoxError>,
{
    let value = fetch.await.map_err(Into::<BoxError>::into)?;
    inner.entries.store(&key, value.clone(), Instant::now());
    tracing::debug!(key = %key, "stored fetched value");
    Ok(value)
}
