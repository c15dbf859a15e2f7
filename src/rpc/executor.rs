//! In-flight request bookkeeping
//!
//! One [`Executor`] per dispatched request that carries an id. It lives
//! from dispatch until the handler finishes, the client cancels it, or the
//! session is torn down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::protocol::RequestId;

#[derive(Debug)]
pub(crate) struct Executor {
    pub id: RequestId,
    token: CancellationToken,
    /// Distinguishes two registrations of the same id
    generation: u64,
}

impl Executor {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[derive(Debug, Default)]
pub(crate) struct ExecutorMap {
    executors: Mutex<HashMap<RequestId, Executor>>,
    next_generation: AtomicU64,
}

impl ExecutorMap {
    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Executor>> {
        self.executors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a request; returns the generation needed to remove it again.
    ///
    /// Reusing an id that is still in flight replaces the earlier entry,
    /// which can then no longer be cancelled by the client.
    pub fn register(&self, id: RequestId, token: CancellationToken) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let executor = Executor {
            id: id.clone(),
            token,
            generation,
        };
        if self.lock().insert(id.clone(), executor).is_some() {
            tracing::warn!("request id {} reused while still in flight", id);
        }
        generation
    }

    /// Remove the entry for `id` if it is still the one registered as `generation`
    pub fn remove(&self, id: &RequestId, generation: u64) -> bool {
        let mut executors = self.lock();
        match executors.get(id) {
            Some(executor) if executor.generation == generation => {
                executors.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Cancel and forget the request with this id. Unknown ids are a no-op.
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.lock().remove(id) {
            Some(executor) => {
                executor.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked request; returns how many there were
    pub fn cancel_all(&self) -> usize {
        let mut executors = self.lock();
        let count = executors.len();
        for (_, executor) in executors.drain() {
            tracing::trace!("cancelling request {}", executor.id);
            executor.cancel();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }
}
