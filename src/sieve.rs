//! `FeedSieve`: the engine facade.
//!
//! Wires the registry, store, matcher, evaluator, controller and batcher
//! together and exposes:
//!
//! - lifecycle hooks the storage layer calls after committed mutations;
//! - validated mutation helpers that check a change, apply it and run the
//!   matching consistency pass;
//! - `evaluate`/`recompute` for diagnostics and `is_displayable` for display;
//! - units of work batching item changes, and a typed event queue.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::batch::ChangeBatcher;
use crate::config::SieveConfig;
use crate::consistency::{
    validate_scopes, ConsistencyController, ItemBatch, Prospect, RebuildReport, Trigger,
};
use crate::engine::{Evaluator, Invalidation};
use crate::error::SieveResult;
use crate::events::{ChangeEvent, ChangePublisher, ChangeQueue};
use crate::feed::{CombinationLogic, Feed, FeedId, ScopeId, Subscription};
use crate::filter::{FilterDefinition, FilterDefinitionId, FilterInstance, FilterInstanceId};
use crate::post::{AggregateResult, Post, PostId, Verdict};
use crate::registry::FilterRegistry;
use crate::similarity::{SimilarityMatcher, StoreSimilarityMatcher};
use crate::storage::{SieveStore, StorageError};

/// Filtering and cross-reference consistency engine.
pub struct FeedSieve {
    store: Arc<dyn SieveStore>,
    registry: Arc<FilterRegistry>,
    evaluator: Arc<Evaluator>,
    controller: ConsistencyController,
    batcher: ChangeBatcher,
    queue: ChangeQueue,
    config: SieveConfig,
}

impl FeedSieve {
    /// Builds a sieve using the brute-force store matcher.
    ///
    /// # Errors
    ///
    /// See [`FeedSieve::with_matcher`].
    pub fn new(store: Arc<dyn SieveStore>, registry: FilterRegistry, config: SieveConfig) -> SieveResult<Self> {
        let matcher: Arc<dyn SimilarityMatcher> = Arc::new(StoreSimilarityMatcher::new(Arc::clone(&store)));
        Self::with_matcher(store, registry, matcher, config)
    }

    /// Builds a sieve, registering the configured catalog.
    ///
    /// Built-in predicates take their defaults from `config.similarity`.
    /// Every definition already in the store and every catalog entry is
    /// resolved against the registry here.
    ///
    /// # Errors
    ///
    /// `InvalidField` for an invalid config, `ResolutionError` for an
    /// unregistered handler, or a storage error.
    pub fn with_matcher(
        store: Arc<dyn SieveStore>,
        registry: FilterRegistry,
        matcher: Arc<dyn SimilarityMatcher>,
        config: SieveConfig,
    ) -> SieveResult<Self> {
        config.validate()?;
        let mut registry = registry;
        registry.set_similarity_defaults(config.similarity);
        let registry = Arc::new(registry);

        for definition in store.list_definitions()? {
            registry.resolve_definition(&definition)?;
        }
        let known: BTreeSet<String> = store
            .list_definitions()?
            .into_iter()
            .map(|d| d.name.trim().to_string())
            .collect();
        for entry in &config.catalog {
            let definition = entry.to_definition();
            registry.resolve_definition(&definition)?;
            if known.contains(definition.name.trim()) {
                debug!(name = %definition.name, "catalog definition already stored");
                continue;
            }
            store.insert_definition(definition)?;
        }

        let evaluator = Arc::new(Evaluator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            matcher,
            config.lock_stripes,
        ));
        let controller = ConsistencyController::new(Arc::clone(&store), Arc::clone(&evaluator));
        let batcher = ChangeBatcher::new(Arc::clone(&store));
        let queue = ChangeQueue::new(config.event_queue_capacity);

        info!(
            handlers = registry.names().len(),
            catalog = config.catalog.len(),
            "feed sieve ready"
        );
        Ok(Self {
            store,
            registry,
            evaluator,
            controller,
            batcher,
            queue,
            config,
        })
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SieveStore> {
        &self.store
    }

    /// The handler registry.
    #[must_use]
    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &SieveConfig {
        &self.config
    }

    /// Consistency passes completed so far.
    #[must_use]
    pub fn completed_passes(&self) -> u64 {
        self.controller.completed_passes()
    }

    // ------------------------------------------------------------------
    // Display and diagnostics
    // ------------------------------------------------------------------

    /// Evaluates a post, reusing valid cached results.
    ///
    /// # Errors
    ///
    /// The predicate, resolution or storage failure that stopped evaluation.
    pub fn evaluate(&self, post: PostId) -> SieveResult<Verdict> {
        Ok(self.evaluator.evaluate(post)?.verdict)
    }

    /// Drops a post's cached results, then evaluates it.
    ///
    /// # Errors
    ///
    /// Same as [`FeedSieve::evaluate`].
    pub fn recompute(&self, post: PostId) -> SieveResult<Verdict> {
        Ok(self.evaluator.recompute(post)?.verdict)
    }

    /// Returns true if the post's aggregate is `Pass`.
    ///
    /// # Errors
    ///
    /// `PostNotFound` or a storage error.
    pub fn is_displayable(&self, post: PostId) -> SieveResult<bool> {
        let post = self.store.get_post(post)?.ok_or(StorageError::PostNotFound(post))?;
        Ok(post.aggregate.is_displayable())
    }

    // ------------------------------------------------------------------
    // Lifecycle hooks
    // ------------------------------------------------------------------

    /// A post was created or changed.
    ///
    /// Returns `None` when the change was recorded in the open unit of work.
    ///
    /// # Errors
    ///
    /// A storage error aborting the pass.
    pub fn on_post_saved(&self, post: &Post) -> SieveResult<Option<RebuildReport>> {
        self.item_changed(post.feed, Some(post.id))
    }

    /// A post was deleted.
    ///
    /// # Errors
    ///
    /// Same as [`FeedSieve::on_post_saved`].
    pub fn on_post_deleted(&self, post: &Post) -> SieveResult<Option<RebuildReport>> {
        self.item_changed(post.feed, None)
    }

    fn item_changed(&self, feed: FeedId, post: Option<PostId>) -> SieveResult<Option<RebuildReport>> {
        if self.batcher.record(feed, post)? {
            return Ok(None);
        }
        let mut batch = ItemBatch::new();
        let posts = batch.entry(feed).or_default();
        if let Some(post) = post {
            posts.insert(post);
        }
        self.controller.run(Trigger::Items(batch)).map(Some)
    }

    /// Filters were bound to or unbound from a feed, or its logic flipped.
    ///
    /// Any actual change re-evaluates every post of the feed, so `added`,
    /// `removed` and `logic_changed` only decide whether anything changed and
    /// what the binding looked like before. A call reporting no change runs
    /// no pass.
    ///
    /// # Errors
    ///
    /// A storage error, including a missing feed or instance.
    pub fn on_binding_changed(
        &self,
        feed: FeedId,
        added: &[FilterInstanceId],
        removed: &[FilterInstanceId],
        logic_changed: bool,
    ) -> SieveResult<RebuildReport> {
        if added.is_empty() && removed.is_empty() && !logic_changed {
            debug!(feed = %feed, "binding hook reported no change");
            return Ok(RebuildReport::default());
        }
        let current = self.store.get_feed(feed)?.ok_or(StorageError::FeedNotFound(feed))?;
        let before = current.binding.changed(removed, added, None);
        let crossref_before = self.controller.binds_crossref(before.filters)?;
        debug!(
            feed = %feed,
            added = added.len(),
            removed = removed.len(),
            logic_changed,
            "binding changed"
        );
        self.controller.run(Trigger::Binding { feed, crossref_before })
    }

    /// A definition was edited; `previous` is the definition before the edit.
    ///
    /// # Errors
    ///
    /// A storage error.
    pub fn on_definition_changed(&self, previous: &FilterDefinition) -> SieveResult<RebuildReport> {
        self.controller.run(Trigger::Definition {
            previous: previous.clone(),
        })
    }

    /// A scope membership was created (`previous: None`), removed
    /// (`current: None`) or moved.
    ///
    /// # Errors
    ///
    /// A storage error.
    pub fn on_subscription_changed(
        &self,
        current: Option<Subscription>,
        previous: Option<Subscription>,
    ) -> SieveResult<RebuildReport> {
        let mut feeds: Vec<FeedId> = current.iter().chain(previous.iter()).map(|s| s.feed).collect();
        feeds.dedup();
        let old_scopes = previous
            .filter(|p| Some(*p) != current)
            .map(|p| p.scope)
            .into_iter()
            .collect();
        self.controller.run(Trigger::Scope { feeds, old_scopes })
    }

    // ------------------------------------------------------------------
    // Validated mutations
    // ------------------------------------------------------------------

    /// Stores a new definition after resolving its handler.
    ///
    /// # Errors
    ///
    /// `ResolutionError`, or `DuplicateKey` if the name is taken.
    pub fn define_filter(&self, definition: FilterDefinition) -> SieveResult<FilterDefinitionId> {
        self.registry.resolve_definition(&definition)?;
        let id = definition.id;
        info!(name = %definition.name, crossref = definition.crossref, "filter defined");
        self.store.insert_definition(definition)?;
        Ok(id)
    }

    /// Replaces a definition and re-evaluates every feed using it.
    ///
    /// Name-only edits run no pass.
    ///
    /// # Errors
    ///
    /// `ResolutionError`, `CrossrefMismatch` if a scope would end up with
    /// disagreeing crossref settings, or a storage error.
    pub fn update_definition(&self, definition: FilterDefinition) -> SieveResult<RebuildReport> {
        let previous = self
            .store
            .get_definition(definition.id)?
            .ok_or(StorageError::DefinitionNotFound(definition.id))?;
        self.registry.resolve_definition(&definition)?;

        let mut scopes = BTreeSet::new();
        for instance in self.store.instances_of(definition.id)? {
            for feed in self.store.feeds_binding(instance.id)? {
                scopes.extend(self.store.scopes_of(feed)?);
            }
        }
        let prospect = Prospect {
            definition: Some(&definition),
            ..Prospect::default()
        };
        validate_scopes(self.store.as_ref(), scopes, &prospect)?;

        let settings_differ = previous.settings_differ(&definition);
        self.store.update_definition(definition)?;
        if !settings_differ {
            return Ok(RebuildReport::default());
        }
        self.on_definition_changed(&previous)
    }

    /// Creates an instance of a definition.
    ///
    /// # Errors
    ///
    /// `DefinitionNotFound`, `ResolutionError`, or a storage error.
    pub fn create_instance(
        &self,
        definition: FilterDefinitionId,
        parameter: Option<String>,
    ) -> SieveResult<FilterInstance> {
        let def = self
            .store
            .get_definition(definition)?
            .ok_or(StorageError::DefinitionNotFound(definition))?;
        self.registry.resolve_definition(&def)?;
        let instance = FilterInstance {
            id: FilterInstanceId::new(),
            definition,
            parameter,
        };
        self.store.insert_instance(instance.clone())?;
        Ok(instance)
    }

    /// Stores a new feed after resolving every filter it binds.
    ///
    /// # Errors
    ///
    /// `ResolutionError` or a storage error.
    pub fn add_feed(&self, feed: Feed) -> SieveResult<FeedId> {
        self.resolve_instances(feed.binding.filters.iter().copied())?;
        let id = feed.id;
        self.store.insert_feed(feed)?;
        Ok(id)
    }

    /// Binds and unbinds filters on a feed, optionally replacing its logic,
    /// then re-evaluates it.
    ///
    /// # Errors
    ///
    /// `ResolutionError` for an added filter, `CrossrefMismatch` if a scope
    /// of the feed would end up with disagreeing crossref settings, or a
    /// storage error. Nothing is applied on error.
    pub fn change_binding(
        &self,
        feed: FeedId,
        added: &[FilterInstanceId],
        removed: &[FilterInstanceId],
        logic: Option<CombinationLogic>,
    ) -> SieveResult<RebuildReport> {
        let current = self.store.get_feed(feed)?.ok_or(StorageError::FeedNotFound(feed))?;
        let next = current.binding.changed(added, removed, logic);
        self.resolve_instances(added.iter().copied())?;

        let prospect = Prospect {
            binding: Some((feed, &next)),
            ..Prospect::default()
        };
        validate_scopes(self.store.as_ref(), self.store.scopes_of(feed)?, &prospect)?;

        let crossref_before = self.controller.binds_crossref(current.binding.filters.iter().copied())?;
        let logic_changed = next.logic != current.binding.logic;
        self.store.update_binding(feed, next)?;
        info!(feed = %feed, added = added.len(), removed = removed.len(), logic_changed, "binding updated");
        self.controller.run(Trigger::Binding { feed, crossref_before })
    }

    /// Adds a feed to a scope.
    ///
    /// # Errors
    ///
    /// `CrossrefMismatch` if the scope would end up with disagreeing
    /// crossref settings, or a storage error.
    pub fn subscribe(&self, subscription: Subscription) -> SieveResult<RebuildReport> {
        let prospect = Prospect {
            joining: Some((subscription.scope, subscription.feed)),
            ..Prospect::default()
        };
        validate_scopes(self.store.as_ref(), [subscription.scope], &prospect)?;
        self.store.subscribe(subscription)?;
        self.on_subscription_changed(Some(subscription), None)
    }

    /// Removes a feed from a scope.
    ///
    /// # Errors
    ///
    /// A storage error.
    pub fn unsubscribe(&self, subscription: Subscription) -> SieveResult<RebuildReport> {
        self.store.unsubscribe(subscription)?;
        self.on_subscription_changed(None, Some(subscription))
    }

    /// Moves a feed from one scope to another in a single pass.
    ///
    /// The move is all or nothing: if joining `to` fails, the feed stays in
    /// `from`.
    ///
    /// # Errors
    ///
    /// `FeedNotFound`, or as [`FeedSieve::subscribe`].
    pub fn move_subscription(&self, feed: FeedId, from: ScopeId, to: ScopeId) -> SieveResult<RebuildReport> {
        if self.store.get_feed(feed)?.is_none() {
            return Err(StorageError::FeedNotFound(feed).into());
        }
        let prospect = Prospect {
            joining: Some((to, feed)),
            ..Prospect::default()
        };
        validate_scopes(self.store.as_ref(), [to], &prospect)?;
        let previous = Subscription::new(from, feed);
        let current = Subscription::new(to, feed);
        self.store.unsubscribe(previous)?;
        if let Err(err) = self.store.subscribe(current) {
            warn!(feed = %feed, error = %err, "scope move failed, restoring previous scope");
            self.store.subscribe(previous)?;
            return Err(err.into());
        }
        self.on_subscription_changed(Some(current), Some(previous))
    }

    /// Inserts or replaces a post, stamping its local write time.
    ///
    /// The post is not displayable until its pass settles it; an aggregate
    /// carried by `post` is ignored.
    ///
    /// # Errors
    ///
    /// Same as [`FeedSieve::on_post_saved`].
    pub fn save_post(&self, mut post: Post) -> SieveResult<Option<RebuildReport>> {
        post.last_touched_at = Utc::now();
        post.aggregate = AggregateResult::Unknown;
        if self.store.get_post(post.id)?.is_some() {
            self.store.update_post(post.clone())?;
            self.evaluator.invalidate(post.id, &Invalidation::All)?;
        } else {
            self.store.insert_post(post.clone())?;
        }
        self.on_post_saved(&post)
    }

    /// Deletes a post and its cached results.
    ///
    /// # Errors
    ///
    /// `PostNotFound`, or as [`FeedSieve::on_post_deleted`].
    pub fn delete_post(&self, post: PostId) -> SieveResult<Option<RebuildReport>> {
        let removed = self.store.delete_post(post)?;
        self.on_post_deleted(&removed)
    }

    fn resolve_instances(&self, instances: impl IntoIterator<Item = FilterInstanceId>) -> SieveResult<()> {
        for id in instances {
            let instance = self
                .store
                .get_instance(id)?
                .ok_or(StorageError::InstanceNotFound(id))?;
            let definition = self
                .store
                .get_definition(instance.definition)?
                .ok_or(StorageError::DefinitionNotFound(instance.definition))?;
            self.registry.resolve_definition(&definition)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Units of work and queued events
    // ------------------------------------------------------------------

    /// Opens a unit of work. Item changes are batched until it is committed.
    ///
    /// # Errors
    ///
    /// `UnitOfWork` if one is already open, or the store's error.
    pub fn begin(&self) -> SieveResult<UnitOfWork<'_>> {
        self.batcher.open()?;
        Ok(UnitOfWork {
            sieve: self,
            finished: false,
        })
    }

    /// A publisher for hosts that enqueue change events.
    #[must_use]
    pub fn publisher(&self) -> ChangePublisher {
        self.queue.publisher()
    }

    /// Applies one event as the matching hook would.
    ///
    /// # Errors
    ///
    /// The hook's error.
    pub fn apply(&self, event: ChangeEvent) -> SieveResult<Option<RebuildReport>> {
        match event {
            ChangeEvent::PostSaved { feed, post } => self.item_changed(feed, Some(post)),
            ChangeEvent::PostDeleted { feed, .. } => self.item_changed(feed, None),
            ChangeEvent::BindingChanged {
                feed,
                added,
                removed,
                logic_changed,
            } => self
                .on_binding_changed(feed, &added, &removed, logic_changed)
                .map(Some),
            ChangeEvent::DefinitionChanged { previous } => self.on_definition_changed(&previous).map(Some),
            ChangeEvent::SubscriptionChanged { current, previous } => {
                self.on_subscription_changed(current, previous).map(Some)
            }
        }
    }

    /// Applies queued events in order until the queue is empty.
    ///
    /// Stops at the first failing event; later events stay queued.
    ///
    /// # Errors
    ///
    /// The first event's error.
    pub fn drain(&self) -> SieveResult<Vec<RebuildReport>> {
        let mut reports = Vec::new();
        while let Some(event) = self.queue.try_next() {
            if let Some(report) = self.apply(event)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}

/// An open unit of work. Dropping it without committing discards it.
pub struct UnitOfWork<'a> {
    sieve: &'a FeedSieve,
    finished: bool,
}

impl UnitOfWork<'_> {
    /// Runs one pass over the batched item changes and commits the unit.
    ///
    /// # Errors
    ///
    /// The pass or commit error; the unit is rolled back as a whole.
    pub fn commit(mut self) -> SieveResult<RebuildReport> {
        self.finished = true;
        self.sieve.batcher.flush(&self.sieve.controller)
    }

    /// Discards the batched changes and rolls the unit back.
    ///
    /// # Errors
    ///
    /// The store's rollback error.
    pub fn discard(mut self) -> SieveResult<()> {
        self.finished = true;
        self.sieve.batcher.discard()
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.sieve.batcher.discard() {
            warn!(error = %err, "discarding dropped unit of work failed");
        }
    }
}
