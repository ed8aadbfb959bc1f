// Pipe Locker - mutual exclusion keyed by pipe id
//
// Serializes lifecycle mutations (status changes, close checks, inserts racing
// a close) on a single pipe. Locks are created lazily and dropped from the map
// once nobody holds or waits on them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::domain::PipeId;

/// Lock registry shared by every pusher and popper in the process
#[derive(Debug, Default)]
pub struct PipeLocker {
    locks: Mutex<HashMap<PipeId, Arc<AsyncMutex<()>>>>,
}

impl PipeLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive rights over `pipe_id`, waiting if another task holds it
    pub async fn lock(&self, pipe_id: &str) -> PipeLockGuard<'_> {
        let handle = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(pipe_id.to_string()).or_default())
        };
        // Declared before the wait so that, if this future is dropped while
        // waiting, it runs after the wait has released its handle.
        let mut waiting = Waiting {
            locker: self,
            pipe_id,
            armed: true,
        };
        let guard = handle.lock_owned().await;
        waiting.armed = false;
        trace!(pipe_id = %pipe_id, "pipe lock acquired");
        PipeLockGuard {
            locker: self,
            pipe_id: pipe_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Run `f` while holding the lock for `pipe_id`
    ///
    /// # Example
    /// ```text
    /// let status = locker
    ///     .with_pipe_lock(&pipe.pipe_id, || repo.get_pipe_descriptor(&queue, &pipe.pipe_id))
    ///     .await?;
    /// ```
    pub async fn with_pipe_lock<F, Fut, T>(&self, pipe_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(pipe_id).await;
        f().await
    }

    /// Drop the map entry for `pipe_id` if the map holds its only handle.
    /// Waiters clone the handle under the map lock, so a count of 1 means
    /// nobody holds or waits on it.
    fn release(&self, pipe_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(pipe_id)
            .is_some_and(|handle| Arc::strong_count(handle) == 1)
        {
            locks.remove(pipe_id);
        }
    }

    /// Number of pipes with a live lock entry
    pub fn active_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held lock on one pipe; released on drop
#[derive(Debug)]
pub struct PipeLockGuard<'a> {
    locker: &'a PipeLocker,
    pipe_id: PipeId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PipeLockGuard<'_> {
    pub fn pipe_id(&self) -> &str {
        &self.pipe_id
    }
}

impl Drop for PipeLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locker.release(&self.pipe_id);
        trace!(pipe_id = %self.pipe_id, "pipe lock released");
    }
}

/// Cleans up after a `lock` call cancelled before acquiring
struct Waiting<'a> {
    locker: &'a PipeLocker,
    pipe_id: &'a str,
    armed: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.locker.release(self.pipe_id);
            trace!(pipe_id = %self.pipe_id, "pipe lock wait cancelled");
        }
    }
}
