//! Keyed upsert collections.
//!
//! Every persisted shape in the system is written as an idempotent upsert on
//! a stable key (last-writer-wins), so the store surface is a small typed
//! map guarded by an async lock. A durable backend can be swapped in behind
//! the same operations.

use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct Collection<K, V> {
    name: &'static str,
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Collection<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn upsert(&self, key: K, value: V) {
        self.inner.write().await.insert(key, value);
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().await.remove(key)
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.inner.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<V> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn keys(&self) -> Vec<K> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Apply `mutate` to the stored value under the write lock; a
    /// compare-and-swap for single-entity updates.
    pub async fn update<F>(&self, key: &K, mutate: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let mut guard = self.inner.write().await;
        match guard.get_mut(key) {
            Some(value) => {
                mutate(value);
                true
            }
            None => false,
        }
    }

    /// Remove every entry matching the predicate, returning how many were
    /// dropped.
    pub async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K, &V) -> bool,
    {
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|k, v| !predicate(k, v));
        before - guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let collection: Collection<String, u32> = Collection::new("test");
        collection.upsert("a".to_string(), 1).await;
        collection.upsert("a".to_string(), 2).await;
        assert_eq!(collection.get(&"a".to_string()).await, Some(2));
        assert_eq!(collection.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_missing() {
        let collection: Collection<String, u32> = Collection::new("test");
        assert!(!collection.update(&"a".to_string(), |v| *v += 1).await);
        collection.upsert("a".to_string(), 1).await;
        assert!(collection.update(&"a".to_string(), |v| *v += 1).await);
        assert_eq!(collection.get(&"a".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn test_remove_where() {
        let collection: Collection<String, u32> = Collection::new("test");
        collection.upsert("a".to_string(), 1).await;
        collection.upsert("b".to_string(), 2).await;
        collection.upsert("c".to_string(), 3).await;
        let removed = collection.remove_where(|_, v| *v >= 2).await;
        assert_eq!(removed, 2);
        assert_eq!(collection.keys().await, vec!["a".to_string()]);
    }
}
