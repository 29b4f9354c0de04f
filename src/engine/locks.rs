//! Striped per-post write locks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use crate::post::PostId;
use crate::storage::StorageError;

/// Serializes read-modify-write of one post's cache rows and aggregate.
///
/// Posts hashing to the same stripe share a lock; correctness only needs
/// every writer of a given post to take the same one.
#[derive(Debug)]
pub(crate) struct PostLocks {
    stripes: Vec<Mutex<()>>,
}

impl PostLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock(&self, post: PostId) -> Result<MutexGuard<'_, ()>, StorageError> {
        let mut hasher = DefaultHasher::new();
        post.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let idx = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[idx]
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: post stripe".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_stripes_is_clamped_to_one() {
        let locks = PostLocks::new(0);
        let guard = locks.lock(PostId::new()).unwrap();
        drop(guard);
        assert!(locks.lock(PostId::new()).is_ok());
    }

    #[test]
    fn same_post_maps_to_same_stripe() {
        let locks = PostLocks::new(8);
        let id = PostId::new();
        let guard = locks.lock(id).unwrap();
        assert!(locks.stripes.iter().filter(|m| m.try_lock().is_err()).count() == 1);
        drop(guard);
    }
}
