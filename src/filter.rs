//! Filter definitions and parametrized filter instances.
//!
//! A `FilterDefinition` names a handler and carries the crossref settings that
//! drive invalidation. A `FilterInstance` binds a definition to an optional
//! parameter; instances are what feeds bind and what results are cached for.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::post::Post;

/// Unique identifier for a filter definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterDefinitionId(Uuid);

impl FilterDefinitionId {
    /// Creates a new random definition ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FilterDefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FilterDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a filter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterInstanceId(Uuid);

impl FilterInstanceId {
    /// Creates a new random instance ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FilterInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FilterInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How much history a crossref filter re-references on invalidation.
///
/// Ordered so that `Unbounded` compares greater than any bounded span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrossrefSpan {
    /// A bounded horizon, in seconds.
    Bounded {
        /// Horizon length in seconds.
        seconds: i64,
    },
    /// No horizon: every post is revisited.
    Unbounded,
}

impl CrossrefSpan {
    /// A bounded span of whole days.
    #[must_use]
    pub const fn days(days: i64) -> Self {
        Self::Bounded {
            seconds: days.saturating_mul(24 * 3600),
        }
    }

    /// The span as a duration, `None` when unbounded or too wide to represent.
    #[must_use]
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Bounded { seconds } => Duration::try_seconds((*seconds).max(0)),
            Self::Unbounded => None,
        }
    }
}

impl Default for CrossrefSpan {
    fn default() -> Self {
        Self::days(7)
    }
}

/// Where a crossref rebuild window is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildMode {
    /// Window reaches back from the earliest post that triggered the pass.
    NewOnly,
    /// Window is anchored at the current time.
    All,
}

impl Default for RebuildMode {
    fn default() -> Self {
        Self::All
    }
}

/// Which post timestamp orders and windows a crossref rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineBasis {
    /// Time the post was first ingested.
    Created,
    /// Modification time reported by the source (falls back to creation).
    Modified,
}

impl Default for TimelineBasis {
    fn default() -> Self {
        Self::Created
    }
}

impl TimelineBasis {
    /// Reads the timestamp this basis refers to from a post.
    #[must_use]
    pub fn timestamp_of(self, post: &Post) -> DateTime<Utc> {
        match self {
            Self::Created => post.created_at,
            Self::Modified => post.source_modified_at.unwrap_or(post.created_at),
        }
    }
}

/// A named filter kind, resolved to a predicate through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDefinition {
    pub id: FilterDefinitionId,
    pub name: String,
    /// Registry key of the predicate; empty means "use `name`".
    #[serde(default)]
    pub handler_ref: String,
    /// Whether results depend on other posts.
    #[serde(default)]
    pub crossref: bool,
    #[serde(default)]
    pub crossref_span: CrossrefSpan,
    #[serde(default)]
    pub rebuild_mode: RebuildMode,
    #[serde(default)]
    pub timeline_basis: TimelineBasis,
}

impl FilterDefinition {
    /// Creates a non-crossref definition whose handler is looked up by name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: FilterDefinitionId::new(),
            name: name.into(),
            handler_ref: String::new(),
            crossref: false,
            crossref_span: CrossrefSpan::default(),
            rebuild_mode: RebuildMode::default(),
            timeline_basis: TimelineBasis::default(),
        }
    }

    /// Creates a crossref definition with the given span.
    #[must_use]
    pub fn crossref(name: impl Into<String>, span: CrossrefSpan) -> Self {
        Self {
            crossref: true,
            crossref_span: span,
            ..Self::new(name)
        }
    }

    /// Sets an explicit handler reference.
    #[must_use]
    pub fn with_handler(mut self, handler_ref: impl Into<String>) -> Self {
        self.handler_ref = handler_ref.into();
        self
    }

    /// Sets the rebuild mode.
    #[must_use]
    pub fn with_rebuild_mode(mut self, mode: RebuildMode) -> Self {
        self.rebuild_mode = mode;
        self
    }

    /// Sets the timeline basis.
    #[must_use]
    pub fn with_timeline_basis(mut self, basis: TimelineBasis) -> Self {
        self.timeline_basis = basis;
        self
    }

    /// The registry key used to resolve this definition's predicate.
    #[must_use]
    pub fn handler_key(&self) -> &str {
        let handler = self.handler_ref.trim();
        if handler.is_empty() {
            self.name.trim()
        } else {
            handler
        }
    }

    /// Returns true if a change from `self` to `other` can alter cached results
    /// or invalidation behaviour.
    #[must_use]
    pub fn settings_differ(&self, other: &Self) -> bool {
        self.handler_key() != other.handler_key()
            || self.crossref != other.crossref
            || self.crossref_span != other.crossref_span
            || self.rebuild_mode != other.rebuild_mode
            || self.timeline_basis != other.timeline_basis
    }
}

/// A definition bound to an optional parameter.
///
/// `parameter: None` means the predicate is called without a parameter, which
/// is distinct from being called with an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInstance {
    pub id: FilterInstanceId,
    pub definition: FilterDefinitionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl FilterInstance {
    /// Creates an instance that passes no parameter.
    #[must_use]
    pub fn new(definition: FilterDefinitionId) -> Self {
        Self {
            id: FilterInstanceId::new(),
            definition,
            parameter: None,
        }
    }

    /// Creates an instance with a parameter.
    #[must_use]
    pub fn with_parameter(definition: FilterDefinitionId, parameter: impl Into<String>) -> Self {
        Self {
            id: FilterInstanceId::new(),
            definition,
            parameter: Some(parameter.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_span_orders_above_bounded() {
        assert!(CrossrefSpan::Unbounded > CrossrefSpan::days(10_000));
        assert!(CrossrefSpan::days(3) > CrossrefSpan::days(2));
        assert_eq!(
            [CrossrefSpan::days(2), CrossrefSpan::Unbounded, CrossrefSpan::days(5)]
                .into_iter()
                .max(),
            Some(CrossrefSpan::Unbounded)
        );
        assert_eq!(CrossrefSpan::days(2).as_duration(), Some(Duration::days(2)));
        assert_eq!(CrossrefSpan::Unbounded.as_duration(), None);
        assert_eq!(CrossrefSpan::Bounded { seconds: i64::MAX }.as_duration(), None);
    }

    #[test]
    fn handler_key_falls_back_to_name() {
        let def = FilterDefinition::new("same_guid");
        assert_eq!(def.handler_key(), "same_guid");

        let def = FilterDefinition::new("spam").with_handler("myapp.filters.spam");
        assert_eq!(def.handler_key(), "myapp.filters.spam");
    }

    #[test]
    fn settings_differ_ignores_name_only_edits() {
        let def = FilterDefinition::crossref("dedup", CrossrefSpan::days(2)).with_handler("same_guid");
        let mut renamed = def.clone();
        renamed.name = "dedup-guid".to_string();
        assert!(!def.settings_differ(&renamed));

        let widened = FilterDefinition {
            crossref_span: CrossrefSpan::days(5),
            ..def.clone()
        };
        assert!(def.settings_differ(&widened));
    }

    #[test]
    fn definition_deserializes_with_defaults() {
        let json = format!(
            r#"{{"id":"{}","name":"regex_in_title"}}"#,
            Uuid::new_v4()
        );
        let def: FilterDefinition = serde_json::from_str(&json).unwrap();
        assert!(!def.crossref);
        assert_eq!(def.rebuild_mode, RebuildMode::All);
        assert_eq!(def.timeline_basis, TimelineBasis::Created);
    }
}
