//! Process-wide rebuild guard.
//!
//! One controller pass runs at a time. The pass holds a `RebuildToken` and
//! hands it down the call chain; the token releases the guard when dropped,
//! on every exit path. A second entry from the thread already holding the
//! guard is the controller re-triggering itself and is refused; entries from
//! other threads wait for the running pass and then run their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::storage::StorageError;

/// Outcome of asking for the guard.
#[derive(Debug)]
pub enum Entry<'a> {
    /// The caller now owns the pass.
    Acquired(RebuildToken<'a>),
    /// The calling thread is already inside a pass.
    Reentrant,
}

/// Shared guard serializing controller passes.
#[derive(Debug, Default)]
pub struct RebuildGuard {
    holder: Mutex<Option<ThreadId>>,
    released: Condvar,
    completed: AtomicU64,
}

impl RebuildGuard {
    /// Creates a free guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the guard if it is free, without waiting.
    ///
    /// # Errors
    ///
    /// `Backend` if the guard's lock is poisoned.
    pub fn try_acquire(&self) -> Result<Option<RebuildToken<'_>>, StorageError> {
        let mut holder = self.holder.lock().map_err(|_| poisoned())?;
        if holder.is_some() {
            return Ok(None);
        }
        *holder = Some(thread::current().id());
        Ok(Some(RebuildToken { guard: self }))
    }

    /// Takes the guard, waiting for a pass running on another thread.
    ///
    /// # Errors
    ///
    /// `Backend` if the guard's lock is poisoned.
    pub fn enter(&self) -> Result<Entry<'_>, StorageError> {
        if let Some(token) = self.try_acquire()? {
            return Ok(Entry::Acquired(token));
        }

        let me = thread::current().id();
        let mut holder = self.holder.lock().map_err(|_| poisoned())?;
        loop {
            match *holder {
                None => {
                    *holder = Some(me);
                    return Ok(Entry::Acquired(RebuildToken { guard: self }));
                }
                Some(owner) if owner == me => return Ok(Entry::Reentrant),
                Some(_) => {
                    holder = self.released.wait(holder).map_err(|_| poisoned())?;
                }
            }
        }
    }

    /// Returns true while a pass is running.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.holder
            .lock()
            .map_or(true, |holder| holder.is_some())
    }

    /// Number of passes that have released the guard so far.
    #[must_use]
    pub fn completed_passes(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    fn release(&self) {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        *holder = None;
        drop(holder);
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.released.notify_all();
    }
}

/// Proof that the holder owns the current pass.
#[derive(Debug)]
pub struct RebuildToken<'a> {
    guard: &'a RebuildGuard,
}

impl Drop for RebuildToken<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend("poisoned lock: rebuild guard".to_string())
}
