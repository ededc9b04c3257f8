//! Single-flight coalescing
//!
//! At most one execution per key is in progress at any time. Callers that
//! arrive while a flight is running await the same shared future and receive
//! a clone of its output. The check-then-insert happens under the map's
//! entry lock, so the primitive is safe on a multi-threaded runtime.
//!
//! A settled flight can be kept around for a short `linger` window. Callers
//! arriving within that window reuse the settled result instead of starting
//! a new execution; afterwards the key is cleared and the next call starts a
//! fresh flight.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Flight<T> {
    id: u64,
    future: Shared<BoxFuture<'static, T>>,
}

/// Per-key single-flight group
pub struct SingleFlight<K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    flights: Arc<DashMap<K, Flight<T>>>,
    next_id: AtomicU64,
    linger: Duration,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create a group that clears a key as soon as its flight settles
    pub fn new() -> Self {
        Self::with_linger(Duration::ZERO)
    }

    /// Create a group that keeps settled results for `linger`
    pub fn with_linger(linger: Duration) -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            linger,
        }
    }

    /// Run `make()` for `key`, or join the flight already running for it.
    ///
    /// `make` is only invoked by the caller that starts the flight. It runs
    /// while the group's entry for `key` is locked, so it must only build the
    /// future and never touch this group (`is_in_flight` included).
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!("Joining in-flight operation");
                entry.get().future.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flights = Arc::clone(&self.flights);
                let linger = self.linger;
                let inner = make();

                let future = async move {
                    let output = inner.await;
                    Self::schedule_clear(flights, key, id, linger);
                    output
                }
                .boxed()
                .shared();

                entry.insert(Flight {
                    id,
                    future: future.clone(),
                });
                future
            }
        };

        shared.await
    }

    /// True while a flight (running or lingering) is registered for `key`
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of registered flights
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// True when no flight is registered
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    fn schedule_clear(flights: Arc<DashMap<K, Flight<T>>>, key: K, id: u64, linger: Duration) {
        if linger.is_zero() {
            flights.remove_if(&key, |_, flight| flight.id == id);
            return;
        }

        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            flights.remove_if(&key, |_, flight| flight.id == id);
        });
    }
}
