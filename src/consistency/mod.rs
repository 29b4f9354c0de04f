//! Consistency controller.
//!
//! Reacts to structural and item changes by dropping exactly the cached
//! results they can invalidate and re-evaluating the affected posts:
//!
//! - binding changes re-evaluate every post of the feed;
//! - definition changes do the same for every feed using the definition;
//! - item changes re-evaluate the changed posts;
//! - any change touching a feed with a crossref filter bound also revisits
//!   the windowed posts of every crossref feed sharing a scope with it.
//!
//! Revisited posts are evaluated oldest first so duplicate detection always
//! sees the established post before judging a later one.

mod guard;
mod validation;
mod window;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{Evaluator, Invalidation};
use crate::error::SieveResult;
use crate::feed::{FeedId, ScopeId};
use crate::filter::{FilterDefinition, FilterInstanceId, TimelineBasis};
use crate::post::{Post, PostId};
use crate::storage::{SieveStore, StorageError};

pub use guard::{Entry, RebuildGuard, RebuildToken};
pub use validation::{validate_scopes, Prospect};
pub use window::{CrossrefProfile, RebuildWindow};

/// Changed posts per feed. An empty set records a feed whose posts were only deleted.
pub type ItemBatch = BTreeMap<FeedId, BTreeSet<PostId>>;

/// What started a controller pass.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// A feed's binding or combination logic changed (already applied).
    Binding {
        feed: FeedId,
        /// Whether the binding held a crossref filter before the change.
        crossref_before: bool,
    },
    /// A filter definition was edited (already applied).
    Definition {
        /// The definition as it was before the edit.
        previous: FilterDefinition,
    },
    /// Posts were saved or deleted.
    Items(ItemBatch),
    /// Feeds changed scope membership (already applied).
    Scope {
        feeds: Vec<FeedId>,
        /// Scopes the feeds left.
        old_scopes: Vec<ScopeId>,
    },
}

impl Trigger {
    fn kind(&self) -> &'static str {
        match self {
            Self::Binding { .. } => "binding",
            Self::Definition { .. } => "definition",
            Self::Items(_) => "items",
            Self::Scope { .. } => "scope",
        }
    }
}

/// A post whose evaluation failed during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostFailure {
    pub post: PostId,
    pub error: String,
}

/// Summary of one controller pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// The pass was refused because it was entered from inside another pass.
    pub suppressed: bool,
    /// Crossref feeds in the related set.
    pub related_feeds: usize,
    /// Posts re-opened by the crossref window.
    pub revisited: usize,
    /// Cached rows dropped.
    pub dropped: usize,
    /// Posts evaluated to a verdict.
    pub evaluated: usize,
    /// Predicates invoked.
    pub invoked: usize,
    /// Posts left `Unknown` by an isolated failure.
    pub failures: Vec<PostFailure>,
}

impl RebuildReport {
    /// Report of a refused re-entrant pass.
    #[must_use]
    pub fn suppressed() -> Self {
        Self {
            suppressed: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Plan {
    /// Feeds whose every post is re-evaluated.
    full_feeds: BTreeSet<FeedId>,
    /// Posts whose whole cache was dropped.
    direct: BTreeSet<PostId>,
    /// Feeds whose change propagates to crossref neighbours.
    anchors: BTreeSet<FeedId>,
    /// Scopes to include besides the anchors' current ones.
    extra_scopes: Vec<ScopeId>,
    /// Posts that started the pass, for NewOnly anchoring.
    triggers: Vec<Post>,
}

/// Drives invalidation and rebuild passes.
pub struct ConsistencyController {
    store: Arc<dyn SieveStore>,
    evaluator: Arc<Evaluator>,
    guard: RebuildGuard,
}

impl ConsistencyController {
    /// Creates a controller writing through `evaluator`.
    #[must_use]
    pub fn new(store: Arc<dyn SieveStore>, evaluator: Arc<Evaluator>) -> Self {
        Self {
            store,
            evaluator,
            guard: RebuildGuard::new(),
        }
    }

    /// Number of passes completed so far.
    #[must_use]
    pub fn completed_passes(&self) -> u64 {
        self.guard.completed_passes()
    }

    /// Returns true while a pass is running.
    #[must_use]
    pub fn is_rebuilding(&self) -> bool {
        self.guard.is_held()
    }

    /// Runs one pass for `trigger`, blocking until it completes.
    ///
    /// A call made from inside a running pass on the same thread returns a
    /// suppressed report without doing anything.
    ///
    /// # Errors
    ///
    /// Storage failures abort the pass. Predicate and resolution failures are
    /// isolated per post and reported in [`RebuildReport::failures`].
    pub fn run(&self, trigger: Trigger) -> SieveResult<RebuildReport> {
        let token = match self.guard.enter()? {
            Entry::Acquired(token) => token,
            Entry::Reentrant => {
                warn!(trigger = trigger.kind(), "re-entrant consistency pass suppressed");
                return Ok(RebuildReport::suppressed());
            }
        };

        let kind = trigger.kind();
        let report = self.process(&token, trigger)?;
        info!(
            trigger = kind,
            related_feeds = report.related_feeds,
            revisited = report.revisited,
            dropped = report.dropped,
            evaluated = report.evaluated,
            invoked = report.invoked,
            failures = report.failures.len(),
            "consistency pass completed"
        );
        Ok(report)
    }

    /// The crossref filters a feed currently binds.
    ///
    /// # Errors
    ///
    /// A storage error if the feed or one of its filters is missing.
    pub fn profile(&self, feed: FeedId) -> SieveResult<CrossrefProfile> {
        let feed = self
            .store
            .get_feed(feed)?
            .ok_or(StorageError::FeedNotFound(feed))?;
        let mut bound = Vec::new();
        for id in feed.binding.filters {
            let definition = self.definition_of(id)?;
            if definition.crossref {
                bound.push((id, definition));
            }
        }
        Ok(CrossrefProfile { bound })
    }

    /// Returns true if any of the instances belongs to a crossref definition.
    ///
    /// # Errors
    ///
    /// A storage error if an instance or its definition is missing.
    pub fn binds_crossref(&self, filters: impl IntoIterator<Item = FilterInstanceId>) -> SieveResult<bool> {
        for id in filters {
            if self.definition_of(id)?.crossref {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn definition_of(&self, instance: FilterInstanceId) -> SieveResult<FilterDefinition> {
        let instance = self
            .store
            .get_instance(instance)?
            .ok_or(StorageError::InstanceNotFound(instance))?;
        Ok(self
            .store
            .get_definition(instance.definition)?
            .ok_or(StorageError::DefinitionNotFound(instance.definition))?)
    }

    fn process(&self, token: &RebuildToken<'_>, trigger: Trigger) -> SieveResult<RebuildReport> {
        let mut report = RebuildReport::default();
        let mut plan = Plan::default();

        match trigger {
            Trigger::Binding { feed, crossref_before } => {
                plan.full_feeds.insert(feed);
                if crossref_before || !self.profile(feed)?.is_empty() {
                    plan.anchors.insert(feed);
                }
            }
            Trigger::Definition { previous } => {
                self.plan_definition(&previous, &mut plan, &mut report)?;
            }
            Trigger::Items(batch) => {
                for (feed, posts) in batch {
                    for id in posts {
                        let Some(post) = self.store.get_post(id)? else {
                            continue;
                        };
                        report.dropped += self.evaluator.invalidate(id, &Invalidation::All)?;
                        plan.direct.insert(id);
                        plan.triggers.push(post);
                    }
                    if !self.profile(feed)?.is_empty() {
                        plan.anchors.insert(feed);
                    }
                }
            }
            Trigger::Scope { feeds, old_scopes } => {
                for feed in feeds {
                    if !self.profile(feed)?.is_empty() {
                        plan.anchors.insert(feed);
                    }
                }
                plan.extra_scopes = old_scopes;
            }
        }

        self.rebuild(token, plan, report)
    }

    fn plan_definition(
        &self,
        previous: &FilterDefinition,
        plan: &mut Plan,
        report: &mut RebuildReport,
    ) -> SieveResult<()> {
        let current = self
            .store
            .get_definition(previous.id)?
            .ok_or(StorageError::DefinitionNotFound(previous.id))?;
        let instances: Vec<FilterInstanceId> = self
            .store
            .instances_of(current.id)?
            .into_iter()
            .map(|i| i.id)
            .collect();

        let mut feeds = BTreeSet::new();
        for id in &instances {
            feeds.extend(self.store.feeds_binding(*id)?);
        }

        // Rows computed by another predicate say nothing about the new one.
        if previous.handler_key() != current.handler_key() && !instances.is_empty() {
            let which = Invalidation::Filters(instances);
            for feed in &feeds {
                for post in self.store.posts_of_feed(*feed)? {
                    report.dropped += self.evaluator.invalidate(post.id, &which)?;
                }
            }
        }

        if previous.crossref || current.crossref {
            plan.anchors.extend(feeds.iter().copied());
        }
        plan.full_feeds.extend(feeds);
        Ok(())
    }

    /// Feeds sharing a scope with an anchor (anchors included) that bind a crossref filter.
    fn related_set(
        &self,
        anchors: &BTreeSet<FeedId>,
        extra_scopes: &[ScopeId],
    ) -> SieveResult<BTreeMap<FeedId, CrossrefProfile>> {
        let mut scopes: BTreeSet<ScopeId> = extra_scopes.iter().copied().collect();
        for feed in anchors {
            scopes.extend(self.store.scopes_of(*feed)?);
        }

        let mut feeds = anchors.clone();
        for scope in scopes {
            feeds.extend(self.store.feeds_in(scope)?);
        }

        let mut related = BTreeMap::new();
        for feed in feeds {
            let profile = self.profile(feed)?;
            if !profile.is_empty() {
                related.insert(feed, profile);
            }
        }
        Ok(related)
    }

    fn rebuild(
        &self,
        _token: &RebuildToken<'_>,
        plan: Plan,
        mut report: RebuildReport,
    ) -> SieveResult<RebuildReport> {
        let mut bases: HashMap<FeedId, TimelineBasis> = HashMap::new();
        let mut pending: BTreeSet<PostId> = plan.direct.clone();

        if !plan.anchors.is_empty() {
            let related = self.related_set(&plan.anchors, &plan.extra_scopes)?;
            let window = RebuildWindow::new(
                related
                    .values()
                    .flat_map(|p| p.bound.iter().map(|(_, def)| def.crossref_span)),
                Utc::now(),
                plan.triggers,
            );
            debug!(
                related_feeds = related.len(),
                span = ?window.span(),
                "crossref propagation"
            );

            for (feed, profile) in &related {
                bases.insert(*feed, profile.basis());
                for post in self.store.posts_of_feed(*feed)? {
                    let covering = profile.instances_covering(&window, &post);
                    if covering.is_empty() {
                        continue;
                    }
                    if !plan.direct.contains(&post.id) {
                        report.dropped += self
                            .evaluator
                            .invalidate(post.id, &Invalidation::Filters(covering))?;
                    }
                    report.revisited += 1;
                    pending.insert(post.id);
                }
            }
            report.related_feeds = related.len();
        }

        for feed in &plan.full_feeds {
            pending.extend(self.store.posts_of_feed(*feed)?.into_iter().map(|p| p.id));
        }

        let mut ordered = Vec::with_capacity(pending.len());
        for id in pending {
            if let Some(post) = self.store.get_post(id)? {
                let basis = bases.get(&post.feed).copied().unwrap_or_default();
                ordered.push((basis.timestamp_of(&post), post.id));
            }
        }
        ordered.sort_unstable();

        for (_, id) in ordered {
            match self.evaluator.evaluate(id) {
                Ok(evaluation) => {
                    report.evaluated += 1;
                    report.invoked += evaluation.invoked;
                }
                Err(err) if err.is_post_local() => report.failures.push(PostFailure {
                    post: id,
                    error: err.to_string(),
                }),
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }
}
