//! Lazily populated SQL text cache.
//!
//! Statement text depends only on the schema and a small key (queue location,
//! retry type, sequence name). The key space is bounded by the configured
//! queues, so entries are never evicted. Two callers racing on the same key
//! may both render the text; the first insert wins and both get equal text.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

/// Concurrent map from a key to rendered statement text.
#[derive(Debug)]
pub struct SqlCache<K, V = Arc<str>> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for SqlCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> SqlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value for `key`, rendering it with `render` on a miss.
    pub fn get_or_try_insert<Q, E>(
        &self,
        key: &Q,
        render: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(hit) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Ok(hit.clone());
        }

        let value = render()?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.entry(key.to_owned()).or_insert(value).clone())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn renders_once_per_key() {
        let cache: SqlCache<String> = SqlCache::new();
        let renders = AtomicUsize::new(0);
        let render = || {
            renders.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(Arc::<str>::from("SELECT 1"))
        };

        let a = cache.get_or_try_insert("q", render).unwrap();
        let b = cache.get_or_try_insert("q", render).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_render_is_not_cached() {
        let cache: SqlCache<String> = SqlCache::new();
        let err = cache.get_or_try_insert("q", || Err::<Arc<str>, _>("boom"));
        assert_eq!(err.unwrap_err(), "boom");
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_population_yields_equal_text() {
        let cache: Arc<SqlCache<u32>> = Arc::new(SqlCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache
                        .get_or_try_insert(&7, || Ok::<_, ()>(Arc::<str>::from("text")))
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(&*h.join().unwrap(), "text");
        }
        assert_eq!(cache.len(), 1);
    }
}
