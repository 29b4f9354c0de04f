//! Duplicate and near-duplicate detection for crossref predicates.
//!
//! `SimilarityMatcher` is the capability the built-in crossref predicates
//! call. It only looks at posts that are currently displayable, in feeds that
//! share a scope with the post's own feed, and never at the post itself.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::feed::FeedId;
use crate::post::Post;
use crate::storage::{SieveStore, StorageError};

/// Default minimal similarity at which two titles count as the same.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Default comparison timespan: 7 days.
pub const DEFAULT_SIMILARITY_WINDOW_SECS: u64 = 7 * 24 * 3600;

/// Defaults used by built-in predicates when an instance passes no override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityDefaults {
    /// Similarity in `(0, 1)`; titles match when their normalized edit
    /// distance is below `1 - threshold`.
    pub threshold: f64,
    /// Comparison timespan in seconds, `0` = unbounded.
    pub window_seconds: u64,
}

impl Default for SimilarityDefaults {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            window_seconds: DEFAULT_SIMILARITY_WINDOW_SECS,
        }
    }
}

/// Detects posts that duplicate another displayable post in scope.
pub trait SimilarityMatcher: Send + Sync {
    /// True if a distinct displayable post with the same GUID was touched
    /// within `window_seconds` of now (`0` = any time).
    fn same_identifier(&self, post: &Post, window_seconds: u64) -> Result<bool, StorageError>;

    /// True if a distinct displayable post has a title whose normalized edit
    /// distance to `post.title` is below `1 - threshold`, within the window.
    fn similar_title(&self, post: &Post, threshold: f64, window_seconds: u64) -> Result<bool, StorageError>;
}

/// Edit distance from `candidate` to `title`, as a fraction of the
/// candidate's length. `None` for an empty candidate.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn normalized_edit_distance(candidate: &str, title: &str) -> Option<f64> {
    let len = candidate.chars().count();
    if len == 0 {
        return None;
    }
    Some(strsim::levenshtein(candidate, title) as f64 / len as f64)
}

/// Oldest touch time inside the window, `None` when unbounded.
///
/// A window reaching before the representable past is unbounded.
fn window_start(window_seconds: u64) -> Option<DateTime<Utc>> {
    if window_seconds == 0 {
        return None;
    }
    let secs = i64::try_from(window_seconds).ok()?;
    Utc::now().checked_sub_signed(Duration::try_seconds(secs)?)
}

/// Brute-force matcher scanning the store.
pub struct StoreSimilarityMatcher {
    store: Arc<dyn SieveStore>,
}

impl StoreSimilarityMatcher {
    /// Create a matcher over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn SieveStore>) -> Self {
        Self { store }
    }

    /// Displayable posts other than `post` in feeds sharing a scope with it,
    /// touched within the window.
    fn candidates(&self, post: &Post, window_seconds: u64) -> Result<Vec<Post>, StorageError> {
        let mut feeds: BTreeSet<FeedId> = BTreeSet::new();
        feeds.insert(post.feed);
        for scope in self.store.scopes_of(post.feed)? {
            feeds.extend(self.store.feeds_in(scope)?);
        }

        let since = window_start(window_seconds);

        let mut out = Vec::new();
        for feed in feeds {
            for other in self.store.posts_of_feed(feed)? {
                if other.id == post.id || !other.aggregate.is_displayable() {
                    continue;
                }
                if since.is_some_and(|since| other.last_touched_at <= since) {
                    continue;
                }
                out.push(other);
            }
        }
        Ok(out)
    }
}

impl SimilarityMatcher for StoreSimilarityMatcher {
    fn same_identifier(&self, post: &Post, window_seconds: u64) -> Result<bool, StorageError> {
        Ok(self
            .candidates(post, window_seconds)?
            .iter()
            .any(|other| other.guid == post.guid))
    }

    fn similar_title(&self, post: &Post, threshold: f64, window_seconds: u64) -> Result<bool, StorageError> {
        let limit = 1.0 - threshold;
        Ok(self.candidates(post, window_seconds)?.iter().any(|other| {
            normalized_edit_distance(&other.title, &post.title).is_some_and(|d| d < limit)
        }))
    }
}
