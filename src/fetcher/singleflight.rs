//! Per-key request coalescing.
//!
//! Of N concurrent callers that miss cache for the same key, exactly one
//! runs the underlying fetch; the rest wait on a watch channel and observe
//! the same result. The leader's slot is released by a drop guard, so a
//! cancelled leader frees the key and one of the waiters takes over instead
//! of starving.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::errors::FetchError;

type Shared<T> = Result<T, Arc<FetchError>>;

pub struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<Shared<T>>>>>>,
}

impl<T: Clone> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.inflight.lock().len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry when the leader finishes or is cancelled.
struct FlightGuard<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<Shared<T>>>>>>,
    key: String,
}

impl<T: Clone> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Run `make` for `key`, coalescing with any in-flight call.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Shared<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        enum Role<T: Clone> {
            Leader(watch::Sender<Option<Shared<T>>>),
            Follower(watch::Receiver<Option<Shared<T>>>),
        }

        let mut make = Some(make);

        loop {
            // The map lock is confined to this block; no await runs under it.
            let role = {
                let mut map = self.inflight.lock();
                match map.get(key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        map.insert(key.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    // The guard frees the slot even if this future is
                    // dropped mid-flight.
                    let _guard = FlightGuard {
                        inflight: self.inflight.clone(),
                        key: key.to_string(),
                    };
                    let make = make
                        .take()
                        .expect("leader path entered twice for one caller");
                    let result: Shared<T> = make().await.map_err(Arc::new);
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => loop {
                    let published = rx.borrow().clone();
                    if let Some(result) = published {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // Leader dropped without publishing; contend again.
                        break;
                    }
                },
            }
        }
    }
}
