//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of every
//! storage trait behind a single lock, so a unit of work can snapshot and
//! restore the whole state. It is intended for embedded usage, tests, and as
//! a reference implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use crate::feed::{Feed, FeedFilterBinding, FeedId, ScopeId, Subscription};
use crate::filter::{FilterDefinition, FilterDefinitionId, FilterInstance, FilterInstanceId};
use crate::post::{AggregateResult, FilterResult, Post, PostId};
use crate::storage::traits::{
    FeedStore, FilterStore, PostStore, ResultStore, StorageError, UnitOfWorkStore,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default, Clone)]
struct State {
    definitions: HashMap<FilterDefinitionId, FilterDefinition>,
    instances: HashMap<FilterInstanceId, FilterInstance>,
    feeds: HashMap<FeedId, Feed>,
    subscriptions: BTreeSet<Subscription>,
    posts: HashMap<PostId, Post>,
    posts_by_feed: HashMap<FeedId, BTreeSet<PostId>>,
    results: HashMap<PostId, BTreeMap<FilterInstanceId, FilterResult>>,
}

/// Thread-safe in-memory store implementing every storage trait.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    snapshot: Mutex<Option<State>>,
    write_budget: Mutex<Option<usize>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: allow `writes` more cache writes (results and
    /// aggregates), then fail every further one with a backend error.
    ///
    /// `None` removes the limit.
    pub fn fail_cache_writes_after(&self, writes: Option<usize>) -> Result<(), StorageError> {
        let mut budget = self
            .write_budget
            .lock()
            .map_err(|_| lock_err("store.write_budget"))?;
        *budget = writes;
        Ok(())
    }

    fn charge_cache_write(&self, context: &'static str) -> Result<(), StorageError> {
        let mut budget = self
            .write_budget
            .lock()
            .map_err(|_| lock_err("store.write_budget"))?;
        match budget.as_mut() {
            None => Ok(()),
            Some(0) => Err(StorageError::Backend(format!("injected write failure ({context})"))),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
        }
    }

    /// Number of cached result rows across all posts.
    pub fn result_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("store.result_count"))?;
        Ok(state.results.values().map(BTreeMap::len).sum())
    }
}

impl FilterStore for InMemoryStore {
    fn insert_definition(&self, definition: FilterDefinition) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("definition.insert"))?;
        if state.definitions.contains_key(&definition.id) {
            return Err(StorageError::DuplicateKey(definition.id.to_string()));
        }
        if state
            .definitions
            .values()
            .any(|d| d.name.trim() == definition.name.trim())
        {
            return Err(StorageError::DuplicateKey(definition.name.clone()));
        }
        state.definitions.insert(definition.id, definition);
        Ok(())
    }

    fn update_definition(&self, definition: FilterDefinition) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("definition.update"))?;
        let slot = state
            .definitions
            .get_mut(&definition.id)
            .ok_or(StorageError::DefinitionNotFound(definition.id))?;
        *slot = definition;
        Ok(())
    }

    fn get_definition(&self, id: FilterDefinitionId) -> Result<Option<FilterDefinition>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("definition.get"))?;
        Ok(state.definitions.get(&id).cloned())
    }

    fn list_definitions(&self) -> Result<Vec<FilterDefinition>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("definition.list"))?;
        let mut out: Vec<FilterDefinition> = state.definitions.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn insert_instance(&self, instance: FilterInstance) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("instance.insert"))?;
        if state.instances.contains_key(&instance.id) {
            return Err(StorageError::DuplicateKey(instance.id.to_string()));
        }
        if !state.definitions.contains_key(&instance.definition) {
            return Err(StorageError::DefinitionNotFound(instance.definition));
        }
        state.instances.insert(instance.id, instance);
        Ok(())
    }

    fn get_instance(&self, id: FilterInstanceId) -> Result<Option<FilterInstance>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("instance.get"))?;
        Ok(state.instances.get(&id).cloned())
    }

    fn instances_of(&self, definition: FilterDefinitionId) -> Result<Vec<FilterInstance>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("instance.instances_of"))?;
        let mut out: Vec<FilterInstance> = state
            .instances
            .values()
            .filter(|i| i.definition == definition)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.id);
        Ok(out)
    }
}

impl FeedStore for InMemoryStore {
    fn insert_feed(&self, feed: Feed) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed.insert"))?;
        if state.feeds.contains_key(&feed.id) {
            return Err(StorageError::DuplicateKey(feed.id.to_string()));
        }
        if let Some(missing) = feed
            .binding
            .filters
            .iter()
            .find(|id| !state.instances.contains_key(id))
        {
            return Err(StorageError::InstanceNotFound(*missing));
        }
        state.posts_by_feed.entry(feed.id).or_default();
        state.feeds.insert(feed.id, feed);
        Ok(())
    }

    fn get_feed(&self, id: FeedId) -> Result<Option<Feed>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("feed.get"))?;
        Ok(state.feeds.get(&id).cloned())
    }

    fn update_binding(&self, id: FeedId, binding: FeedFilterBinding) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed.update_binding"))?;
        if let Some(missing) = binding
            .filters
            .iter()
            .find(|fid| !state.instances.contains_key(fid))
        {
            return Err(StorageError::InstanceNotFound(*missing));
        }
        let feed = state.feeds.get_mut(&id).ok_or(StorageError::FeedNotFound(id))?;
        feed.binding = binding;
        Ok(())
    }

    fn feeds_binding(&self, instance: FilterInstanceId) -> Result<Vec<FeedId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("feed.feeds_binding"))?;
        let mut out: Vec<FeedId> = state
            .feeds
            .values()
            .filter(|f| f.binding.filters.contains(&instance))
            .map(|f| f.id)
            .collect();
        out.sort();
        Ok(out)
    }

    fn subscribe(&self, subscription: Subscription) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed.subscribe"))?;
        if !state.feeds.contains_key(&subscription.feed) {
            return Err(StorageError::FeedNotFound(subscription.feed));
        }
        state.subscriptions.insert(subscription);
        Ok(())
    }

    fn unsubscribe(&self, subscription: Subscription) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed.unsubscribe"))?;
        state.subscriptions.remove(&subscription);
        Ok(())
    }

    fn scopes_of(&self, feed: FeedId) -> Result<Vec<ScopeId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("feed.scopes_of"))?;
        let scopes: BTreeSet<ScopeId> = state
            .subscriptions
            .iter()
            .filter(|s| s.feed == feed)
            .map(|s| s.scope)
            .collect();
        Ok(scopes.into_iter().collect())
    }

    fn feeds_in(&self, scope: ScopeId) -> Result<Vec<FeedId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("feed.feeds_in"))?;
        let feeds: BTreeSet<FeedId> = state
            .subscriptions
            .iter()
            .filter(|s| s.scope == scope)
            .map(|s| s.feed)
            .collect();
        Ok(feeds.into_iter().collect())
    }
}

impl PostStore for InMemoryStore {
    fn insert_post(&self, post: Post) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("post.insert"))?;
        if state.posts.contains_key(&post.id) {
            return Err(StorageError::DuplicateKey(post.id.to_string()));
        }
        if !state.feeds.contains_key(&post.feed) {
            return Err(StorageError::FeedNotFound(post.feed));
        }
        state.posts_by_feed.entry(post.feed).or_default().insert(post.id);
        state.posts.insert(post.id, post);
        Ok(())
    }

    fn update_post(&self, mut post: Post) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("post.update"))?;
        let (prev_feed, aggregate) = state
            .posts
            .get(&post.id)
            .map(|p| (p.feed, p.aggregate))
            .ok_or(StorageError::PostNotFound(post.id))?;
        post.aggregate = aggregate;
        if prev_feed != post.feed {
            if !state.feeds.contains_key(&post.feed) {
                return Err(StorageError::FeedNotFound(post.feed));
            }
            if let Some(set) = state.posts_by_feed.get_mut(&prev_feed) {
                set.remove(&post.id);
            }
            state.posts_by_feed.entry(post.feed).or_default().insert(post.id);
        }
        state.posts.insert(post.id, post);
        Ok(())
    }

    fn delete_post(&self, id: PostId) -> Result<Post, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("post.delete"))?;
        let prev = state.posts.remove(&id).ok_or(StorageError::PostNotFound(id))?;
        if let Some(set) = state.posts_by_feed.get_mut(&prev.feed) {
            set.remove(&id);
        }
        state.results.remove(&id);
        Ok(prev)
    }

    fn get_post(&self, id: PostId) -> Result<Option<Post>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("post.get"))?;
        Ok(state.posts.get(&id).cloned())
    }

    fn posts_of_feed(&self, feed: FeedId) -> Result<Vec<Post>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("post.posts_of_feed"))?;
        let Some(ids) = state.posts_by_feed.get(&feed) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| state.posts.get(id).cloned()).collect())
    }

    fn set_aggregate(&self, id: PostId, aggregate: AggregateResult) -> Result<(), StorageError> {
        self.charge_cache_write("post.set_aggregate")?;
        let mut state = self.state.write().map_err(|_| lock_err("post.set_aggregate"))?;
        let post = state.posts.get_mut(&id).ok_or(StorageError::PostNotFound(id))?;
        post.aggregate = aggregate;
        Ok(())
    }
}

impl ResultStore for InMemoryStore {
    fn results_for_post(&self, post: PostId) -> Result<Vec<FilterResult>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("result.for_post"))?;
        Ok(state
            .results
            .get(&post)
            .map(|rows| rows.values().copied().collect())
            .unwrap_or_default())
    }

    fn put_result(&self, result: FilterResult) -> Result<(), StorageError> {
        self.charge_cache_write("result.put")?;
        let mut state = self.state.write().map_err(|_| lock_err("result.put"))?;
        if !state.posts.contains_key(&result.post) {
            return Err(StorageError::PostNotFound(result.post));
        }
        if !state.instances.contains_key(&result.filter) {
            return Err(StorageError::InstanceNotFound(result.filter));
        }
        state
            .results
            .entry(result.post)
            .or_default()
            .insert(result.filter, result);
        Ok(())
    }

    fn delete_results(&self, post: PostId, filters: &[FilterInstanceId]) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("result.delete"))?;
        let Some(rows) = state.results.get_mut(&post) else {
            return Ok(0);
        };
        let removed = filters.iter().filter(|f| rows.remove(f).is_some()).count();
        if rows.is_empty() {
            state.results.remove(&post);
        }
        Ok(removed)
    }
}

impl UnitOfWorkStore for InMemoryStore {
    fn begin(&self) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.lock().map_err(|_| lock_err("uow.begin"))?;
        if snapshot.is_some() {
            return Err(StorageError::Transaction(
                "a unit of work is already open".to_string(),
            ));
        }
        let state = self.state.read().map_err(|_| lock_err("uow.begin"))?;
        *snapshot = Some(state.clone());
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.lock().map_err(|_| lock_err("uow.commit"))?;
        if snapshot.take().is_none() {
            return Err(StorageError::Transaction("no unit of work is open".to_string()));
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), StorageError> {
        let mut snapshot = self.snapshot.lock().map_err(|_| lock_err("uow.rollback"))?;
        let saved = snapshot
            .take()
            .ok_or_else(|| StorageError::Transaction("no unit of work is open".to_string()))?;
        let mut state = self.state.write().map_err(|_| lock_err("uow.rollback"))?;
        *state = saved;
        Ok(())
    }
}
