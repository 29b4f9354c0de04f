//! Abstract storage traits for feedsieve.
//!
//! The engine owns no persistence of its own. It reads and writes through
//! these traits, so the hosting application can put any transactional store
//! behind them; `InMemoryStore` is the reference backend.

use thiserror::Error;

use crate::feed::{Feed, FeedFilterBinding, FeedId, ScopeId, Subscription};
use crate::filter::{FilterDefinition, FilterDefinitionId, FilterInstance, FilterInstanceId};
use crate::post::{AggregateResult, FilterResult, Post, PostId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Filter definition not found.
    #[error("Filter definition not found: {0}")]
    DefinitionNotFound(FilterDefinitionId),

    /// Filter instance not found.
    #[error("Filter instance not found: {0}")]
    InstanceNotFound(FilterInstanceId),

    /// Feed not found.
    #[error("Feed not found: {0}")]
    FeedNotFound(FeedId),

    /// Post not found.
    #[error("Post not found: {0}")]
    PostNotFound(PostId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Unit-of-work misuse (nested begin, commit without begin).
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Storage for filter definitions and instances.
pub trait FilterStore: Send + Sync {
    /// Insert a new definition. Returns error if ID already exists.
    fn insert_definition(&self, definition: FilterDefinition) -> Result<(), StorageError>;

    /// Replace an existing definition. Returns error if not found.
    fn update_definition(&self, definition: FilterDefinition) -> Result<(), StorageError>;

    /// Get a definition by ID.
    fn get_definition(&self, id: FilterDefinitionId) -> Result<Option<FilterDefinition>, StorageError>;

    /// List all definitions.
    fn list_definitions(&self) -> Result<Vec<FilterDefinition>, StorageError>;

    /// Insert a new instance. The referenced definition must exist.
    fn insert_instance(&self, instance: FilterInstance) -> Result<(), StorageError>;

    /// Get an instance by ID.
    fn get_instance(&self, id: FilterInstanceId) -> Result<Option<FilterInstance>, StorageError>;

    /// Find all instances of a definition.
    fn instances_of(&self, definition: FilterDefinitionId) -> Result<Vec<FilterInstance>, StorageError>;
}

/// Storage for feeds, their bindings and scope memberships.
pub trait FeedStore: Send + Sync {
    /// Insert a new feed. Returns error if ID already exists.
    fn insert_feed(&self, feed: Feed) -> Result<(), StorageError>;

    /// Get a feed by ID.
    fn get_feed(&self, id: FeedId) -> Result<Option<Feed>, StorageError>;

    /// Replace a feed's filter binding.
    fn update_binding(&self, id: FeedId, binding: FeedFilterBinding) -> Result<(), StorageError>;

    /// Find feeds that bind the given instance.
    fn feeds_binding(&self, instance: FilterInstanceId) -> Result<Vec<FeedId>, StorageError>;

    /// Add a feed to a scope. Idempotent.
    fn subscribe(&self, subscription: Subscription) -> Result<(), StorageError>;

    /// Remove a feed from a scope. Idempotent.
    fn unsubscribe(&self, subscription: Subscription) -> Result<(), StorageError>;

    /// Scopes a feed belongs to (ascending).
    fn scopes_of(&self, feed: FeedId) -> Result<Vec<ScopeId>, StorageError>;

    /// Feeds belonging to a scope (ascending).
    fn feeds_in(&self, scope: ScopeId) -> Result<Vec<FeedId>, StorageError>;
}

/// Storage for posts and their aggregate outcome.
pub trait PostStore: Send + Sync {
    /// Insert a new post. The feed must exist.
    fn insert_post(&self, post: Post) -> Result<(), StorageError>;

    /// Replace an existing post's content and timestamps.
    ///
    /// The stored aggregate is kept; only `set_aggregate` changes it.
    fn update_post(&self, post: Post) -> Result<(), StorageError>;

    /// Delete a post and every FilterResult row attached to it.
    fn delete_post(&self, id: PostId) -> Result<Post, StorageError>;

    /// Get a post by ID.
    fn get_post(&self, id: PostId) -> Result<Option<Post>, StorageError>;

    /// All posts of a feed, in no particular order.
    fn posts_of_feed(&self, feed: FeedId) -> Result<Vec<Post>, StorageError>;

    /// Overwrite the aggregate outcome of a post.
    fn set_aggregate(&self, id: PostId, aggregate: AggregateResult) -> Result<(), StorageError>;
}

/// Storage for cached per-filter outcomes.
///
/// Rows are unique per `(filter, post)`.
pub trait ResultStore: Send + Sync {
    /// All cached rows of a post.
    fn results_for_post(&self, post: PostId) -> Result<Vec<FilterResult>, StorageError>;

    /// Insert or replace the row for `(result.filter, result.post)`.
    fn put_result(&self, result: FilterResult) -> Result<(), StorageError>;

    /// Delete the rows of `post` for the given filters. Returns the number removed.
    fn delete_results(&self, post: PostId, filters: &[FilterInstanceId]) -> Result<usize, StorageError>;
}

/// Explicit unit-of-work boundaries.
///
/// Writes made between `begin` and `rollback` are undone as a whole.
pub trait UnitOfWorkStore: Send + Sync {
    /// Open a unit of work. Nested units are rejected.
    fn begin(&self) -> Result<(), StorageError>;

    /// Make the writes of the open unit permanent.
    fn commit(&self) -> Result<(), StorageError>;

    /// Undo every write made since `begin`.
    fn rollback(&self) -> Result<(), StorageError>;
}

/// Everything the engine needs from a store.
pub trait SieveStore: FilterStore + FeedStore + PostStore + ResultStore + UnitOfWorkStore {}

impl<T> SieveStore for T where T: FilterStore + FeedStore + PostStore + ResultStore + UnitOfWorkStore {}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_filter_store_object_safe(_: &dyn FilterStore) {}
    fn _assert_feed_store_object_safe(_: &dyn FeedStore) {}
    fn _assert_post_store_object_safe(_: &dyn PostStore) {}
    fn _assert_result_store_object_safe(_: &dyn ResultStore) {}
    fn _assert_sieve_store_object_safe(_: &dyn SieveStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::PostNotFound(PostId::new());
        assert!(err.to_string().contains("Post not found"));

        let err = StorageError::Backend("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}
