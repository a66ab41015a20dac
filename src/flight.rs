//! Collapses concurrent fetches for the same key into one execution.
//!
//! The first caller for a key registers a group and becomes its leader; the
//! fetch itself runs on a spawned task owned by the group, so dropping any
//! caller (the leader included) never cancels it for the others. Callers that
//! arrive while the group is registered join it as followers. Every member
//! receives the outcome through a `watch` channel, which is level-triggered:
//! a member that subscribes after publication still sees the value.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::error::{BoxError, Error};

type Outcome<V> = Result<V, Error>;
type Slot<V> = watch::Sender<Option<Outcome<V>>>;
type Registry<V> = Arc<Mutex<HashMap<String, Arc<Slot<V>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of fetches currently in flight, keyed by cache key.
#[derive(Debug)]
pub struct Flights<V> {
    groups: Registry<V>,
}

impl<V> Default for Flights<V> {
    fn default() -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V> Flights<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fetch` for `key` unless a fetch for it is already in flight, and
    /// waits for the outcome.
    ///
    /// The returned flag is `true` when the outcome came from a fetch started
    /// by another caller.
    pub async fn run<F, Fut, E>(&self, key: &str, fetch: F) -> (Outcome<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let flight = self.start(key, fetch);
        let shared = flight.is_shared();
        (flight.outcome().await, shared)
    }

    /// Registers-or-joins the group for `key` without waiting for it.
    ///
    /// When no group is registered, `fetch` is called and its future spawned
    /// before this returns. Otherwise `fetch` is dropped unused. Must be
    /// called from within a Tokio runtime.
    pub fn start<F, Fut, E>(&self, key: &str, fetch: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let mut groups = lock(&self.groups);
        if let Some(slot) = groups.get(key) {
            let rx = slot.subscribe();
            drop(groups);
            tracing::debug!(key, "joining in-flight fetch");
            return Flight { rx, shared: true };
        }

        let (tx, rx) = watch::channel(None);
        let slot = Arc::new(tx);
        groups.insert(key.to_owned(), Arc::clone(&slot));
        drop(groups);

        tracing::debug!(key, "starting fetch");
        let retire = Retire {
            groups: Arc::clone(&self.groups),
            key: key.to_owned(),
            slot,
            published: false,
        };
        let fut = fetch();
        tokio::spawn(async move {
            let outcome = fut.await.map_err(Error::fetch);
            retire.publish(outcome);
        });

        Flight { rx, shared: false }
    }

    /// Number of keys with a fetch in flight.
    pub fn len(&self) -> usize {
        lock(&self.groups).len()
    }

    /// Returns `true` if no fetch is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A caller's membership in an in-flight group.
#[derive(Debug)]
pub struct Flight<V> {
    rx: watch::Receiver<Option<Outcome<V>>>,
    shared: bool,
}

impl<V: Clone> Flight<V> {
    /// `true` if this caller joined a fetch started by someone else.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Waits for the group's outcome.
    ///
    /// Dropping the returned future stops only this caller from waiting.
    pub async fn outcome(mut self) -> Outcome<V> {
        let published = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        published.unwrap_or(Err(Error::Abandoned))
    }
}

/// Publishes a group's outcome and removes it from the registry.
///
/// If dropped without publishing, the group is still removed; its sender is
/// dropped with it, which wakes all members with [`Error::Abandoned`].
struct Retire<V> {
    groups: Registry<V>,
    key: String,
    slot: Arc<Slot<V>>,
    published: bool,
}

impl<V> Retire<V> {
    fn publish(mut self, outcome: Outcome<V>) {
        self.published = true;
        // Send and remove under the same lock so that a joiner either sees the
        // value or starts a new group.
        let mut groups = lock(&self.groups);
        self.slot.send_replace(Some(outcome));
        self.unregister(&mut groups);
    }

    fn unregister(&self, groups: &mut HashMap<String, Arc<Slot<V>>>) {
        if groups
            .get(&self.key)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot))
        {
            groups.remove(&self.key);
        }
    }
}

impl<V> Drop for Retire<V> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        tracing::error!(key = %self.key, "fetch abandoned without a result");
        let mut groups = lock(&self.groups);
        self.unregister(&mut groups);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Fetch = std::pin::Pin<Box<dyn Future<Output = Result<String, BoxError>> + Send>>;

    fn counting(counter: &Arc<AtomicUsize>, value: &'static str) -> Box<dyn FnOnce() -> Fetch> {
        let counter = Arc::clone(counter);
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value.to_string())
            }) as Fetch
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_and_followers_share_one_fetch() {
        let flights = Flights::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let leader = flights.start("k", counting(&counter, "first"));
        let follower = flights.start("k", counting(&counter, "second"));
        assert!(!leader.is_shared());
        assert!(follower.is_shared());
        assert_eq!(flights.len(), 1);

        assert_eq!(leader.outcome().await.unwrap(), "first");
        assert_eq!(follower.outcome().await.unwrap(), "first");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_group_is_not_reused() {
        let flights = Flights::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (first, shared) = flights.run("k", counting(&counter, "one")).await;
        assert_eq!(first.unwrap(), "one");
        assert!(!shared);

        let (second, shared) = flights.run("k", counting(&counter, "two")).await;
        assert_eq!(second.unwrap(), "two");
        assert!(!shared);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_do_not_wait_on_each_other() {
        let flights = Flights::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let a = flights.start("a", counting(&counter, "a"));
        let b = flights.start("b", counting(&counter, "b"));
        assert!(!a.is_shared());
        assert!(!b.is_shared());
        assert_eq!(flights.len(), 2);

        assert_eq!(a.outcome().await.unwrap(), "a");
        assert_eq!(b.outcome().await.unwrap(), "b");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_reaches_every_member() {
        let flights = Flights::<String>::new();

        let leader = flights.start("k", || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err::<String, _>(std::io::Error::other("upstream down"))
        });
        let follower = flights.start("k", || async { Ok::<_, BoxError>("unused".to_string()) });

        let leader_err = leader.outcome().await.unwrap_err();
        let follower_err = follower.outcome().await.unwrap_err();
        assert_eq!(leader_err.to_string(), "upstream down");
        assert_eq!(follower_err.to_string(), "upstream down");
        assert!(follower_err.downcast_ref::<std::io::Error>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_does_not_cancel_fetch() {
        let flights = Flights::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let leader = flights.start("k", counting(&counter, "value"));
        let follower = flights.start("k", counting(&counter, "other"));
        drop(leader);

        assert_eq!(follower.outcome().await.unwrap(), "value");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_abandoned_and_retired() {
        let flights = Flights::<String>::new();

        let (outcome, _) = flights
            .run("k", || async {
                tokio::task::yield_now().await;
                if true {
                    panic!("fetch blew up");
                }
                Ok::<_, BoxError>("never".to_string())
            })
            .await;
        assert!(matches!(outcome, Err(Error::Abandoned)));
        assert!(flights.is_empty());

        let (outcome, shared) = flights
            .run("k", || async { Ok::<_, BoxError>("recovered".to_string()) })
            .await;
        assert_eq!(outcome.unwrap(), "recovered");
        assert!(!shared);
    }
}
