//! # feedsieve - filtering and cross-reference consistency for feed aggregators
//!
//! feedsieve decides, for every post a feed aggregator ingests, whether it
//! passes the boolean combination of filters bound to its feed. Decisions are
//! cached per filter and kept correct as posts, bindings, definitions and
//! scope memberships change, without re-running every predicate on every
//! change.
//!
//! ## Core Concepts
//!
//! - **FilterDefinition**: a named predicate kind; crossref definitions
//!   compare a post against other posts in the same scope
//! - **FilterInstance**: a definition plus an optional parameter, bound to feeds
//! - **FilterResult**: the cached outcome of one instance on one post
//! - **AggregateResult**: the post's `Unknown`/`Pass`/`Fail` outcome; only
//!   `Pass` is displayable
//! - **Scope**: the feeds sharing one site subscription
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use feedsieve::{
//!     CrossrefSpan, Feed, FeedSieve, FilterDefinition, FilterRegistry, InMemoryStore, Post,
//!     SieveConfig, SimilarityDefaults,
//! };
//!
//! let sieve = FeedSieve::new(
//!     Arc::new(InMemoryStore::new()),
//!     FilterRegistry::with_builtins(SimilarityDefaults::default()),
//!     SieveConfig::default(),
//! )?;
//!
//! let dedup = sieve.define_filter(FilterDefinition::crossref("same_guid", CrossrefSpan::days(7)))?;
//! let instance = sieve.create_instance(dedup, None)?;
//! let feed = sieve.add_feed(Feed::new("planet"))?;
//! sieve.change_binding(feed, &[instance.id], &[], None)?;
//!
//! let unit = sieve.begin()?;
//! sieve.save_post(Post::new(feed, "abc123", "Hello"))?;
//! unit.commit()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Domain types
pub mod error;
pub mod feed;
pub mod filter;
pub mod post;

// Storage, predicates and evaluation
pub mod engine;
pub mod registry;
pub mod similarity;
pub mod storage;

// Invalidation and intake
pub mod batch;
pub mod config;
pub mod consistency;
pub mod events;
pub mod sieve;

// Re-export primary types at crate root for convenience
pub use error::{
    ConfigurationError, PredicateError, ResolutionError, SieveError, SieveResult,
};
pub use feed::{CombinationLogic, Feed, FeedFilterBinding, FeedId, ScopeId, Subscription};
pub use filter::{
    CrossrefSpan, FilterDefinition, FilterDefinitionId, FilterInstance, FilterInstanceId,
    RebuildMode, TimelineBasis,
};
pub use post::{AggregateResult, FilterResult, Post, PostId, Verdict};

pub use batch::ChangeBatcher;
pub use config::{CatalogEntry, SieveConfig};
pub use consistency::{ConsistencyController, PostFailure, RebuildReport, Trigger};
pub use engine::{Evaluation, Evaluator, Invalidation};
pub use events::{ChangeEvent, ChangePublisher, ChangeQueue};
pub use registry::{FilterContext, FilterHandler, FilterRegistry};
pub use sieve::{FeedSieve, UnitOfWork};
pub use similarity::{SimilarityDefaults, SimilarityMatcher, StoreSimilarityMatcher};
pub use storage::{
    FeedStore, FilterStore, InMemoryStore, PostStore, ResultStore, SieveStore, StorageError,
    UnitOfWorkStore,
};
