//! Evaluation engine.
//!
//! Computes a post's aggregate outcome from the filters bound to its feed,
//! reusing cached `FilterResult` rows and invoking predicates lazily. Every
//! write to a post's cache rows or aggregate goes through this type while
//! holding that post's stripe lock.

mod locks;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{SieveError, SieveResult};
use crate::filter::{FilterDefinition, FilterInstance, FilterInstanceId};
use crate::post::{AggregateResult, FilterResult, Post, PostId, Verdict};
use crate::registry::{FilterContext, FilterHandler, FilterRegistry};
use crate::similarity::SimilarityMatcher;
use crate::storage::{SieveStore, StorageError};

use locks::PostLocks;

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Settled outcome.
    pub verdict: Verdict,
    /// Predicates actually invoked.
    pub invoked: usize,
    /// Stale rows removed before deciding.
    pub pruned: usize,
}

/// Which cached rows of a post to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every row of the post.
    All,
    /// Only rows of these filter instances.
    Filters(Vec<FilterInstanceId>),
}

/// A bound filter ready to run.
struct Prepared {
    instance: FilterInstance,
    definition: FilterDefinition,
    handler: Arc<dyn FilterHandler>,
}

/// Evaluates posts against their feed's bound filters.
pub struct Evaluator {
    store: Arc<dyn SieveStore>,
    registry: Arc<FilterRegistry>,
    matcher: Arc<dyn SimilarityMatcher>,
    locks: PostLocks,
}

impl Evaluator {
    /// Creates an evaluator with `lock_stripes` per-post write locks.
    #[must_use]
    pub fn new(
        store: Arc<dyn SieveStore>,
        registry: Arc<FilterRegistry>,
        matcher: Arc<dyn SimilarityMatcher>,
        lock_stripes: usize,
    ) -> Self {
        Self {
            store,
            registry,
            matcher,
            locks: PostLocks::new(lock_stripes),
        }
    }

    /// Evaluates a post, reusing whatever cached rows are still valid.
    ///
    /// On a predicate or resolution failure the post's aggregate is left or
    /// set `Unknown` and the error is returned.
    ///
    /// # Errors
    ///
    /// `PostNotFound` if the post does not exist, the predicate/resolution
    /// failure, or any storage failure.
    pub fn evaluate(&self, post_id: PostId) -> SieveResult<Evaluation> {
        let _guard = self.locks.lock(post_id)?;
        self.evaluate_locked(post_id)
    }

    /// Drops every cached row of the post, then evaluates it from scratch.
    ///
    /// # Errors
    ///
    /// Same as [`Evaluator::evaluate`].
    pub fn recompute(&self, post_id: PostId) -> SieveResult<Evaluation> {
        let _guard = self.locks.lock(post_id)?;
        self.invalidate_locked(post_id, &Invalidation::All)?;
        self.evaluate_locked(post_id)
    }

    /// Drops cached rows of a post and re-opens its aggregate to `Unknown`.
    ///
    /// Returns the number of rows removed. A missing post is not an error.
    ///
    /// # Errors
    ///
    /// Any storage failure.
    pub fn invalidate(&self, post_id: PostId, which: &Invalidation) -> SieveResult<usize> {
        let _guard = self.locks.lock(post_id)?;
        self.invalidate_locked(post_id, which)
    }

    fn invalidate_locked(&self, post_id: PostId, which: &Invalidation) -> SieveResult<usize> {
        let Some(post) = self.store.get_post(post_id)? else {
            return Ok(0);
        };
        let targets: Vec<FilterInstanceId> = match which {
            Invalidation::All => self
                .store
                .results_for_post(post_id)?
                .into_iter()
                .map(|r| r.filter)
                .collect(),
            Invalidation::Filters(filters) => filters.clone(),
        };
        let removed = if targets.is_empty() {
            0
        } else {
            self.store.delete_results(post_id, &targets)?
        };
        if post.aggregate != AggregateResult::Unknown {
            self.store.set_aggregate(post_id, AggregateResult::Unknown)?;
        }
        Ok(removed)
    }

    fn evaluate_locked(&self, post_id: PostId) -> SieveResult<Evaluation> {
        let post = self
            .store
            .get_post(post_id)?
            .ok_or(StorageError::PostNotFound(post_id))?;

        match self.decide(&post) {
            Ok(evaluation) => {
                let aggregate = AggregateResult::from(evaluation.verdict);
                if post.aggregate != aggregate {
                    self.store.set_aggregate(post.id, aggregate)?;
                }
                debug!(
                    post = %post.id,
                    verdict = ?evaluation.verdict,
                    invoked = evaluation.invoked,
                    pruned = evaluation.pruned,
                    "post evaluated"
                );
                Ok(evaluation)
            }
            Err(err) if err.is_post_local() => {
                warn!(post = %post.id, error = %err, "post evaluation failed, left unknown");
                if post.aggregate != AggregateResult::Unknown {
                    self.store.set_aggregate(post.id, AggregateResult::Unknown)?;
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn decide(&self, post: &Post) -> SieveResult<Evaluation> {
        let feed = self
            .store
            .get_feed(post.feed)?
            .ok_or(StorageError::FeedNotFound(post.feed))?;
        let logic = feed.binding.logic;
        let short_circuit = logic.short_circuit_value();
        let bound = &feed.binding.filters;

        let cached = self.store.results_for_post(post.id)?;
        let stale: Vec<FilterInstanceId> = cached
            .iter()
            .map(|r| r.filter)
            .filter(|f| !bound.contains(f))
            .collect();
        let pruned = if stale.is_empty() {
            0
        } else {
            let removed = self.store.delete_results(post.id, &stale)?;
            debug!(post = %post.id, removed, "pruned results of unbound filters");
            removed
        };

        let valid: Vec<&FilterResult> = cached.iter().filter(|r| bound.contains(&r.filter)).collect();
        if valid.iter().any(|r| r.result == short_circuit) {
            return Ok(Evaluation {
                verdict: Verdict::from_bool(short_circuit),
                invoked: 0,
                pruned,
            });
        }

        let known: HashSet<FilterInstanceId> = valid.iter().map(|r| r.filter).collect();
        let missing: Vec<FilterInstanceId> =
            bound.iter().copied().filter(|f| !known.contains(f)).collect();
        if missing.is_empty() {
            return Ok(Evaluation {
                verdict: Verdict::from_bool(logic.exhausted_value()),
                invoked: 0,
                pruned,
            });
        }

        let mut prepared = self.prepare(&missing)?;
        // Binding order, with crossref filters moved last: they scan other posts.
        prepared.sort_by_key(|p| p.definition.crossref);

        let mut invoked = 0;
        for item in prepared {
            let ctx = FilterContext {
                filter_name: &item.definition.name,
                matcher: self.matcher.as_ref(),
            };
            let result = item
                .handler
                .check(post, item.instance.parameter.as_deref(), &ctx)?;
            invoked += 1;
            self.store
                .put_result(FilterResult::now(item.instance.id, post.id, result))?;
            if result == short_circuit {
                return Ok(Evaluation {
                    verdict: Verdict::from_bool(short_circuit),
                    invoked,
                    pruned,
                });
            }
        }

        Ok(Evaluation {
            verdict: Verdict::from_bool(logic.exhausted_value()),
            invoked,
            pruned,
        })
    }

    fn prepare(&self, instances: &[FilterInstanceId]) -> SieveResult<Vec<Prepared>> {
        let mut out = Vec::with_capacity(instances.len());
        for id in instances {
            let instance = self
                .store
                .get_instance(*id)?
                .ok_or(StorageError::InstanceNotFound(*id))?;
            let definition = self
                .store
                .get_definition(instance.definition)?
                .ok_or(StorageError::DefinitionNotFound(instance.definition))?;
            let handler = self
                .registry
                .resolve_definition(&definition)
                .map_err(SieveError::from)?;
            out.push(Prepared {
                instance,
                definition,
                handler,
            });
        }
        Ok(out)
    }
}
