//! Per-key request coalescing
//!
//! A [`DedupGroup`] runs at most one operation per key at a time. Callers that
//! arrive while an operation for their key is running wait for it and receive a
//! clone of its result instead of running their own.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use tokio::sync::watch;
use tracing::debug;

/// Completion slot of an in-flight call; `None` until the executor finishes.
type Outcome<T, E> = Option<Result<T, E>>;

struct InFlightCall<T, E> {
    id: u64,
    rx: watch::Receiver<Outcome<T, E>>,
    /// Callers that joined instead of executing. Diagnostics only.
    waiters: Arc<AtomicUsize>,
}

/// Tracks in-flight operations by key and merges concurrent callers.
///
/// The tracking map is only locked to insert or erase an entry, never while an
/// operation runs, so keys never block each other.
pub struct DedupGroup<K, T, E> {
    calls: Mutex<HashMap<K, InFlightCall<T, E>>>,
    next_id: AtomicU64,
}

enum Role<'a, K: Hash + Eq, T, E> {
    Leader(FlightGuard<'a, K, T, E>),
    Follower(watch::Receiver<Outcome<T, E>>),
}

impl<K, T, E> Default for DedupGroup<K, T, E> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K: Hash + Eq, T, E> DedupGroup<K, T, E> {
    fn lock_calls(&self) -> MutexGuard<'_, HashMap<K, InFlightCall<T, E>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Erase the entry for `key` if it still belongs to call `id`.
    fn remove_call(&self, key: &K, id: u64) {
        let mut calls = self.lock_calls();
        if calls.get(key).is_some_and(|call| call.id == id) {
            calls.remove(key);
        }
    }

    /// Stop tracking the current call for `key`.
    ///
    /// The next caller for `key` starts a fresh execution instead of joining the
    /// running one. Callers already waiting still receive the running call's
    /// result. Returns whether a call was being tracked.
    pub fn forget(&self, key: &K) -> bool {
        self.lock_calls().remove(key).is_some()
    }

    /// Number of keys with an operation currently executing.
    pub fn in_flight(&self) -> usize {
        self.lock_calls().len()
    }
}

impl<K, T, E> DedupGroup<K, T, E>
where
    K: Hash + Eq + Clone,
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` for `key`, or wait for the call already running for it.
    ///
    /// Returns the result together with `true` when it was produced by another
    /// caller's execution. Errors are shared the same way as values and are
    /// never remembered: once a call finishes, the next caller executes again.
    ///
    /// If the executing caller is dropped or panics before finishing, its
    /// waiters retry and one of them takes over execution with its own
    /// `operation`. Dropping a waiting caller affects nobody else.
    pub async fn run<F, Fut>(&self, key: K, operation: F) -> (Result<T, E>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            match self.join_or_lead(&key) {
                Role::Leader(guard) => {
                    let result = operation().await;
                    guard.complete(result.clone());
                    return (result, false);
                }
                Role::Follower(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => (*outcome).clone(),
                        Err(_) => None,
                    };
                    if let Some(result) = outcome {
                        return (result, true);
                    }
                    debug!("In-flight call was abandoned before completing; retrying");
                }
            }
        }
    }

    fn join_or_lead(&self, key: &K) -> Role<'_, K, T, E> {
        let mut calls = self.lock_calls();
        if let Some(call) = calls.get(key) {
            call.waiters.fetch_add(1, Ordering::Relaxed);
            return Role::Follower(call.rx.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let waiters = Arc::new(AtomicUsize::new(0));
        calls.insert(
            key.clone(),
            InFlightCall {
                id,
                rx,
                waiters: Arc::clone(&waiters),
            },
        );

        Role::Leader(FlightGuard {
            group: self,
            key: key.clone(),
            id,
            waiters,
            tx: Some(tx),
        })
    }
}

/// Held by the executing caller; clears the map entry even on panic/cancel.
///
/// When dropped without [`FlightGuard::complete`], the entry is erased and the
/// sender is dropped with no result, which tells waiters to retry.
struct FlightGuard<'a, K: Hash + Eq, T, E> {
    group: &'a DedupGroup<K, T, E>,
    key: K,
    id: u64,
    waiters: Arc<AtomicUsize>,
    tx: Option<watch::Sender<Outcome<T, E>>>,
}

impl<K: Hash + Eq, T, E> FlightGuard<'_, K, T, E> {
    /// Erase the entry, then wake every waiter with `result`.
    fn complete(mut self, result: Result<T, E>) {
        self.group.remove_call(&self.key, self.id);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }

        let waiters = self.waiters.load(Ordering::Relaxed);
        if waiters > 0 {
            debug!("In-flight call shared its result with {} waiters", waiters);
        }
    }
}

impl<K: Hash + Eq, T, E> Drop for FlightGuard<'_, K, T, E> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.group.remove_call(&self.key, self.id);
            drop(tx);
        }
    }
}
