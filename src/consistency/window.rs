//! Rebuild windows for crossref invalidation.

use chrono::{DateTime, Utc};

use crate::filter::{CrossrefSpan, FilterDefinition, FilterInstanceId, RebuildMode, TimelineBasis};
use crate::post::Post;

/// The crossref filters one feed binds.
#[derive(Debug, Clone, Default)]
pub struct CrossrefProfile {
    /// Bound crossref instances with their definitions, by instance id.
    pub bound: Vec<(FilterInstanceId, FilterDefinition)>,
}

impl CrossrefProfile {
    /// Returns true if the feed binds no crossref filter.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// Timeline basis the feed's posts are ordered by.
    ///
    /// Scope validation keeps the basis uniform, so the first one is used.
    #[must_use]
    pub fn basis(&self) -> TimelineBasis {
        self.bound
            .first()
            .map_or(TimelineBasis::Created, |(_, def)| def.timeline_basis)
    }

    /// Instances whose rows a post with these timestamps must drop.
    #[must_use]
    pub fn instances_covering(&self, window: &RebuildWindow, post: &Post) -> Vec<FilterInstanceId> {
        self.bound
            .iter()
            .filter(|(_, def)| window.covers(def, post))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Horizon of one controller pass.
///
/// `span` is the widest crossref span bound anywhere in the related set;
/// `triggers` are the posts whose change started the pass.
#[derive(Debug, Clone)]
pub struct RebuildWindow {
    span: Option<CrossrefSpan>,
    now: DateTime<Utc>,
    triggers: Vec<Post>,
}

impl RebuildWindow {
    /// Builds the window from every span in the related set.
    #[must_use]
    pub fn new(
        spans: impl IntoIterator<Item = CrossrefSpan>,
        now: DateTime<Utc>,
        triggers: Vec<Post>,
    ) -> Self {
        Self {
            span: spans.into_iter().max(),
            now,
            triggers,
        }
    }

    /// Pass-wide span, `None` when nothing crossref is bound.
    #[must_use]
    pub const fn span(&self) -> Option<CrossrefSpan> {
        self.span
    }

    /// Earliest trigger timestamp under the given basis.
    #[must_use]
    pub fn earliest_trigger(&self, basis: TimelineBasis) -> Option<DateTime<Utc>> {
        self.triggers.iter().map(|p| basis.timestamp_of(p)).min()
    }

    /// Returns true if `post` must be revisited for filters of `definition`.
    #[must_use]
    pub fn covers(&self, definition: &FilterDefinition, post: &Post) -> bool {
        let Some(span) = self.span else {
            return false;
        };
        // A horizon reaching before the representable past covers everything.
        let Some(start) = span
            .as_duration()
            .and_then(|horizon| self.now.checked_sub_signed(horizon))
        else {
            return true;
        };

        let ts = definition.timeline_basis.timestamp_of(post);
        if ts > start {
            return true;
        }
        match definition.rebuild_mode {
            RebuildMode::All => false,
            RebuildMode::NewOnly => self
                .earliest_trigger(definition.timeline_basis)
                .is_some_and(|anchor| ts >= anchor),
        }
    }
}
