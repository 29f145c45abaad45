//! Memoizing asynchronous lookups.
//!
//! [`AsyncMemo`] collapses concurrent lookups of the same key into one
//! call of the producer. Successful values are cached until they are
//! explicitly invalidated; failures are handed to every waiting caller and
//! then forgotten, so the next lookup runs the producer again. A lookup
//! still running when its key is invalidated answers the callers already
//! waiting on it, but its value is never cached.

use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::ViewError;

type Waiter<V> = oneshot::Sender<Result<V, ViewError>>;
type Producer<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, ViewError>> + Send + Sync>;

enum Slot<V> {
    /// Producer `run` running; callers queued in arrival order.
    Pending { run: u64, waiters: Vec<Waiter<V>> },
    Resolved(V),
}

impl<V> Slot<V> {
    fn is_run(&self, id: u64) -> bool {
        matches!(self, Slot::Pending { run, .. } if *run == id)
    }
}

/// A memo table over an asynchronous producer.
///
/// The producer runs on its own task, so a caller that stops waiting does
/// not cancel the computation for everyone else.
pub struct AsyncMemo<K, V> {
    name: &'static str,
    slots: Arc<DashMap<K, Slot<V>>>,
    /// Waiters of runs whose key was invalidated mid-flight, by run.
    detached: Arc<DashMap<u64, Vec<Waiter<V>>>>,
    producer: Producer<K, V>,
    calls: Arc<AtomicUsize>,
    runs: Arc<AtomicU64>,
}

impl<K, V> Clone for AsyncMemo<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            slots: Arc::clone(&self.slots),
            detached: Arc::clone(&self.detached),
            producer: Arc::clone(&self.producer),
            calls: Arc::clone(&self.calls),
            runs: Arc::clone(&self.runs),
        }
    }
}

impl<K, V> AsyncMemo<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a memo table. `name` only appears in logs.
    pub fn new<F, Fut>(name: &'static str, producer: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ViewError>> + Send + 'static,
    {
        Self {
            name,
            slots: Arc::new(DashMap::new()),
            detached: Arc::new(DashMap::new()),
            producer: Arc::new(move |key| producer(key).boxed()),
            calls: Arc::new(AtomicUsize::new(0)),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Look up `key`, running the producer only if no value is cached and
    /// no other caller is already waiting on one.
    pub async fn get(&self, key: K) -> Result<V, ViewError> {
        let (rx, start) = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut slot) => match slot.get_mut() {
                Slot::Resolved(value) => {
                    trace!(memo = self.name, "memo: hit");
                    return Ok(value.clone());
                }
                Slot::Pending { waiters, .. } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    trace!(memo = self.name, waiters = waiters.len(), "memo: joined pending lookup");
                    (rx, None)
                }
            },
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let run = self.runs.fetch_add(1, Ordering::Relaxed);
                slot.insert(Slot::Pending {
                    run,
                    waiters: vec![tx],
                });
                (rx, Some(run))
            }
        };

        if let Some(run) = start {
            self.spawn_producer(key, run);
        }

        rx.await
            .unwrap_or_else(|_| Err(ViewError::disconnected(format!("{} lookup abandoned", self.name))))
    }

    fn spawn_producer(&self, key: K, run: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        debug!(memo = self.name, run, "memo: running producer");

        let future = (self.producer)(key.clone());
        let slots = Arc::clone(&self.slots);
        let detached = Arc::clone(&self.detached);
        let name = self.name;

        tokio::spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(ViewError::malformed(format!("{} producer panicked", name))),
            };

            let waiters = match slots.entry(key) {
                Entry::Occupied(mut slot) if slot.get().is_run(run) => {
                    let previous = match &result {
                        Ok(value) => slot.insert(Slot::Resolved(value.clone())),
                        Err(e) => {
                            debug!(memo = name, error = %e, "memo: producer failed, not caching");
                            slot.remove()
                        }
                    };
                    match previous {
                        Slot::Pending { waiters, .. } => waiters,
                        Slot::Resolved(_) => Vec::new(),
                    }
                }
                _ => {
                    debug!(memo = name, run, "memo: key invalidated during lookup, not caching");
                    detached.remove(&run).map(|(_, waiters)| waiters).unwrap_or_default()
                }
            };

            for waiter in waiters {
                // A caller that went away no longer needs the value.
                let _ = waiter.send(result.clone());
            }
        });
    }

    /// The cached value for `key`, without running the producer.
    pub fn peek(&self, key: &K) -> Option<V> {
        match self.slots.get(key)?.value() {
            Slot::Resolved(value) => Some(value.clone()),
            Slot::Pending { .. } => None,
        }
    }

    /// Snapshot of every cached entry.
    pub fn resolved(&self) -> Vec<(K, V)> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Resolved(value) => Some((slot.key().clone(), value.clone())),
                Slot::Pending { .. } => None,
            })
            .collect()
    }

    /// Drop the cached value for `key`. A lookup in flight still answers
    /// its callers, and the next lookup runs the producer again.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        let Entry::Occupied(mut slot) = self.slots.entry(key.clone()) else {
            return None;
        };
        // Hand the waiters over before the slot goes, so the run that
        // finishes next always finds them.
        if let Slot::Pending { run, waiters } = slot.get_mut() {
            self.detached.insert(*run, std::mem::take(waiters));
        }
        match slot.remove() {
            Slot::Resolved(value) => Some(value),
            Slot::Pending { .. } => None,
        }
    }

    /// Drop every cached value and every lookup in flight.
    pub fn clear(&self) {
        let keys: Vec<K> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        for key in keys {
            self.invalidate(&key);
        }
        debug!(memo = self.name, "memo: cleared");
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Resolved(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times the producer has been started.
    pub fn producer_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}
