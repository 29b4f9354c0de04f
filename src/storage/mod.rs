//! Storage traits and the in-memory backend.

mod memory;
mod traits;

pub use memory::InMemoryStore;
pub use traits::{
    FeedStore, FilterStore, PostStore, ResultStore, SieveStore, StorageError, UnitOfWorkStore,
};
