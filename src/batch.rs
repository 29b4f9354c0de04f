//! Change batcher.
//!
//! Item changes made inside an open unit of work are recorded instead of
//! processed one by one. Flushing runs a single controller pass over
//! everything recorded and commits the unit; a failed flush rolls the whole
//! unit back, data changes included.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::consistency::{ConsistencyController, ItemBatch, RebuildReport, Trigger};
use crate::error::{ConfigurationError, SieveResult};
use crate::feed::FeedId;
use crate::post::PostId;
use crate::storage::{SieveStore, StorageError};

/// Accumulates item changes for the open unit of work.
pub struct ChangeBatcher {
    store: Arc<dyn SieveStore>,
    pending: Mutex<Option<ItemBatch>>,
}

impl ChangeBatcher {
    /// Creates a batcher with no unit open.
    #[must_use]
    pub fn new(store: Arc<dyn SieveStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(None),
        }
    }

    fn pending(&self) -> Result<MutexGuard<'_, Option<ItemBatch>>, StorageError> {
        self.pending
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: change batcher".to_string()))
    }

    /// Opens a unit of work on the store.
    ///
    /// # Errors
    ///
    /// `UnitOfWork` if a unit is already open, or the store's error.
    pub fn open(&self) -> SieveResult<()> {
        let mut pending = self.pending()?;
        if pending.is_some() {
            return Err(ConfigurationError::UnitOfWork {
                reason: "a unit of work is already open".to_string(),
            }
            .into());
        }
        self.store.begin()?;
        *pending = Some(ItemBatch::new());
        Ok(())
    }

    /// Returns true while a unit is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.pending().map_or(false, |p| p.is_some())
    }

    /// Records a change on `feed`; `post` is `None` for a deletion.
    ///
    /// Returns false if no unit is open, in which case nothing is recorded.
    ///
    /// # Errors
    ///
    /// `Backend` if the batcher's lock is poisoned.
    pub fn record(&self, feed: FeedId, post: Option<PostId>) -> SieveResult<bool> {
        let mut pending = self.pending()?;
        let Some(batch) = pending.as_mut() else {
            return Ok(false);
        };
        let posts = batch.entry(feed).or_default();
        if let Some(post) = post {
            posts.insert(post);
        }
        Ok(true)
    }

    /// Runs one controller pass over the recorded changes, then commits.
    ///
    /// # Errors
    ///
    /// `UnitOfWork` if no unit is open. If the pass or the commit fails the
    /// unit is rolled back and the error returned.
    pub fn flush(&self, controller: &ConsistencyController) -> SieveResult<RebuildReport> {
        let batch = self.pending()?.take().ok_or_else(|| ConfigurationError::UnitOfWork {
            reason: "flush without an open unit of work".to_string(),
        })?;

        let feeds = batch.len();
        let posts: usize = batch.values().map(std::collections::BTreeSet::len).sum();
        debug!(feeds, posts, "flushing change batch");

        let outcome = if batch.is_empty() {
            Ok(RebuildReport::default())
        } else {
            controller.run(Trigger::Items(batch))
        };

        match outcome.and_then(|report| {
            self.store.commit()?;
            Ok(report)
        }) {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(error = %err, "change batch flush failed, rolling back");
                if let Err(rollback) = self.store.rollback() {
                    warn!(error = %rollback, "rollback after failed flush also failed");
                }
                Err(err)
            }
        }
    }

    /// Drops recorded changes and rolls the unit back.
    ///
    /// # Errors
    ///
    /// `UnitOfWork` if no unit is open, or the store's rollback error.
    pub fn discard(&self) -> SieveResult<()> {
        let batch = self.pending()?.take().ok_or_else(|| ConfigurationError::UnitOfWork {
            reason: "discard without an open unit of work".to_string(),
        })?;
        debug!(feeds = batch.len(), "discarding change batch");
        self.store.rollback()?;
        Ok(())
    }
}
