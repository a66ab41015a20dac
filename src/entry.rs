use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// How usable a cached value is at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than `fresh_for`; served without fetching.
    Fresh,
    /// Past `fresh_for` but younger than `ttl`; may be served while refreshing.
    Stale,
    /// At or past `ttl`, or missing altogether.
    Expired,
}

/// A cached value together with its freshness and expiry cutoffs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    /// The cached value.
    pub value: V,
    /// Instant before which the entry is fresh.
    pub fresh_until: Instant,
    /// Instant from which the entry is expired.
    pub expire_at: Instant,
}

/// Horizon used for cutoffs that would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn cutoff(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

impl<V> Entry<V> {
    /// Creates an entry written at `now`.
    ///
    /// `fresh_until` never lies past `expire_at`, so a `fresh_for` longer than
    /// `ttl` makes the entry fresh right up to its expiry.
    pub fn new(value: V, now: Instant, fresh_for: Duration, ttl: Duration) -> Self {
        let expire_at = cutoff(now, ttl);
        Self {
            value,
            fresh_until: cutoff(now, fresh_for).min(expire_at),
            expire_at,
        }
    }

    /// Gets the freshness of this entry at `now`.
    pub fn freshness(&self, now: Instant) -> Freshness {
        classify(Some(self), now)
    }
}

/// Classifies an optional entry at `now`. A missing entry is expired.
pub fn classify<V>(entry: Option<&Entry<V>>, now: Instant) -> Freshness {
    match entry {
        Some(entry) if now < entry.fresh_until => Freshness::Fresh,
        Some(entry) if now < entry.expire_at => Freshness::Stale,
        _ => Freshness::Expired,
    }
}

/// Key to entry map shared by all callers of a cache.
///
/// Entries are only ever replaced whole; the lock is held for the map access
/// alone.
#[derive(Debug)]
pub struct EntryStore<V> {
    map: RwLock<HashMap<String, Entry<V>>>,
    fresh_for: Duration,
    ttl: Duration,
}

impl<V: Clone> EntryStore<V> {
    /// Creates an empty store writing entries with the given lifetimes.
    pub fn new(fresh_for: Duration, ttl: Duration) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            fresh_for,
            ttl,
        }
    }

    /// Returns a copy of the entry stored under `key`, if any.
    pub fn lookup(&self, key: &str) -> Option<Entry<V>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned()
    }

    /// Replaces the entry under `key` with `value` written at `now`.
    ///
    /// Last writer wins, regardless of when its fetch started.
    pub fn store(&self, key: &str, value: V, now: Instant) {
        let entry = Entry::new(value, now, self.fresh_for, self.ttl);
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_owned(), entry);
    }

    /// Gets the number of stored entries
    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
