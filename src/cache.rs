//! Per-space user lists, kept for the lifetime of the process.
//!
//! Entries never expire. Stale membership is accepted; call [`UserCache::invalidate`] when a
//! space's users are known to have changed.

use crate::ticket::User;

use smol_str::SmolStr;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct UserCache {
    by_space: RwLock<HashMap<SmolStr, Arc<Vec<User>>>>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, space: &str) -> Option<Arc<Vec<User>>> {
        let map = self.by_space.read().unwrap_or_else(PoisonError::into_inner);
        map.get(space).cloned()
    }

    /// Returns cached users for `space` or fills the cache with the result of `fetch`.
    ///
    /// `fetch` runs without holding the lock. If two callers race, the first insert wins and
    /// both see the same list afterwards.
    pub fn get_or_try_insert_with<E, F>(&self, space: &str, fetch: F) -> Result<Arc<Vec<User>>, E>
    where
        F: FnOnce() -> Result<Vec<User>, E>,
    {
        if let Some(users) = self.get(space) {
            return Ok(users);
        }
        let users = Arc::new(fetch()?);
        let mut map = self.by_space.write().unwrap_or_else(PoisonError::into_inner);
        Ok(map.entry(SmolStr::new(space)).or_insert(users).clone())
    }

    /// Forgets the users of `space`. Returns whether anything was cached.
    pub fn invalidate(&self, space: &str) -> bool {
        let mut map = self.by_space.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(space).is_some()
    }
}
