//! Posts, their aggregate filtering outcome, and cached per-filter results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::feed::FeedId;
use crate::filter::FilterInstanceId;

/// Unique identifier for a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(Uuid);

impl PostId {
    /// Creates a new random post ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PostId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tri-state filtering outcome of a post.
///
/// Display logic treats `Unknown` as excluded (fail-closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateResult {
    #[default]
    Unknown,
    Pass,
    Fail,
}

impl AggregateResult {
    /// Returns true if the post may be displayed.
    #[must_use]
    pub const fn is_displayable(self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Settled outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    /// Converts a boolean outcome into a verdict.
    #[must_use]
    pub const fn from_bool(passed: bool) -> Self {
        if passed {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

impl From<Verdict> for AggregateResult {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Pass => Self::Pass,
            Verdict::Fail => Self::Fail,
        }
    }
}

/// An item ingested from a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub feed: FeedId,
    /// Source-provided identifier (GUID), used for duplicate detection.
    pub guid: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified_at: Option<DateTime<Utc>>,
    /// Local write time.
    pub last_touched_at: DateTime<Utc>,
    #[serde(default)]
    pub aggregate: AggregateResult,
}

impl Post {
    /// Creates a post ingested now.
    #[must_use]
    pub fn new(feed: FeedId, guid: impl Into<String>, title: impl Into<String>) -> Self {
        Self::created_at(feed, guid, title, Utc::now())
    }

    /// Creates a post ingested at the given time.
    #[must_use]
    pub fn created_at(
        feed: FeedId,
        guid: impl Into<String>,
        title: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PostId::new(),
            feed,
            guid: guid.into(),
            title: title.into(),
            content: String::new(),
            created_at: at,
            source_modified_at: None,
            last_touched_at: at,
            aggregate: AggregateResult::Unknown,
        }
    }

    /// Sets the post body.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Sets the source modification time.
    #[must_use]
    pub fn with_source_modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.source_modified_at = Some(at);
        self
    }
}

/// Cached outcome of one filter instance on one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResult {
    pub filter: FilterInstanceId,
    pub post: PostId,
    pub result: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl FilterResult {
    /// Records an outcome evaluated now.
    #[must_use]
    pub fn now(filter: FilterInstanceId, post: PostId, result: bool) -> Self {
        Self {
            filter,
            post,
            result,
            evaluated_at: Utc::now(),
        }
    }
}
