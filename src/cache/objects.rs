//! Process-local cache of reusable objects with age-based expiry
//!
//! Backends keep expensive handles here (FTP control connections, access
//! tokens) and get a fresh one once the cached handle is older than the
//! configured max age.

use crate::error::GfsResult;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

struct Slot<V> {
    value: Arc<V>,
    created: Instant,
}

/// Map from key to shared value, expiring values after `max_age`
pub struct ObjectCache<K, V> {
    max_age: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> ObjectCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Cached value for `key`, if present and not expired
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.get(key) {
            Some(slot) if slot.created.elapsed() < self.max_age => Some(slot.value.clone()),
            Some(_) => {
                debug!("Cached object {:?} expired", key);
                slots.remove(key);
                None
            }
            None => None,
        }
    }

    /// Cached value for `key`, or the result of `create` which is then cached.
    ///
    /// `create` runs without the map locked, so two callers racing on the
    /// same key may both create a value; the last one wins.
    pub fn get_or_try_insert_with(
        &self,
        key: &K,
        create: impl FnOnce() -> GfsResult<V>,
    ) -> GfsResult<Arc<V>> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = Arc::new(create()?);
        self.evict_expired();
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                Slot {
                    value: value.clone(),
                    created: Instant::now(),
                },
            );
        Ok(value)
    }

    /// Drop the value for `key`, typically after it turned out broken
    pub fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|slot| slot.value)
    }

    /// Drop every expired value, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|_, slot| slot.created.elapsed() < self.max_age);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GfsError;
    use std::thread;

    #[test]
    fn value_is_reused_until_it_expires() {
        let cache = ObjectCache::new(Duration::from_millis(50));
        let mut created = 0;

        let a = cache
            .get_or_try_insert_with(&"k", || {
                created += 1;
                Ok(created)
            })
            .unwrap();
        let b = cache.get_or_try_insert_with(&"k", || Ok(99)).unwrap();
        assert_eq!((*a, *b), (1, 1));

        thread::sleep(Duration::from_millis(80));
        assert!(cache.get(&"k").is_none());
        assert_eq!(*cache.get_or_try_insert_with(&"k", || Ok(2)).unwrap(), 2);
    }

    #[test]
    fn failed_creation_is_not_cached() {
        let cache: ObjectCache<&str, u32> = ObjectCache::new(Duration::from_secs(60));
        let err = cache.get_or_try_insert_with(&"k", || Err(GfsError::Internal("boom".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_and_evict() {
        let cache = ObjectCache::new(Duration::from_millis(30));
        cache.get_or_try_insert_with(&1, || Ok("a")).unwrap();
        cache.get_or_try_insert_with(&2, || Ok("b")).unwrap();

        assert_eq!(cache.invalidate(&1).as_deref(), Some(&"a"));
        assert_eq!(cache.len(), 1);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }
}
