//! One shared computation per key.
//!
//! The first caller for a key spawns the work onto the runtime and parks a
//! shared handle to its result in the map; later callers for the same key
//! await that handle. The spawned task removes the slot when it finishes, so
//! a call after completion starts fresh. Because the work runs in its own
//! task, callers that give up waiting do not cancel it for the others.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinError;

type Slot<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

pub struct InFlight<K, T, E> {
    slots: Arc<DashMap<K, Slot<T, E>>>,
}

impl<K, T, E> Clone for InFlight<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, T, E> Default for InFlight<K, T, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }
}

impl<K, T, E> InFlight<K, T, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start()` for `key` unless a run is already in flight, in which
    /// case wait for that one.
    ///
    /// `start` is invoked while the key's map shard is locked; it must only
    /// build the future, not touch this map.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let slot = match self.slots.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let work = start();
                let slots = Arc::clone(&self.slots);
                let task = tokio::spawn(async move {
                    let result = work.await;
                    slots.remove(&key);
                    result
                });
                let slot = async move { task.await.unwrap_or_else(|e| Err(E::from(e))) }
                    .boxed()
                    .shared();
                entry.insert(slot.clone());
                slot
            }
        };
        slot.await
    }

    /// Keys with a run currently in flight.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
