use std::{collections::HashMap, hash::Hash};

use tokio::sync::Mutex;

/// Identity-keyed map behind a single lock.
///
/// The lock only guards map mutation; callers clone values out and do I/O after the guard
/// is released. There is no iteration API that hands out references.
#[derive(Debug)]
pub struct Table<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().await.insert(key, value)
    }

    /// Inserts `value` unless `key` is already present. On conflict the existing value is
    /// returned and `value` is dropped.
    pub async fn insert_if_absent(&self, key: K, value: V) -> Result<(), V> {
        let mut m = self.inner.lock().await;
        if let Some(existing) = m.get(&key) {
            return Err(existing.clone());
        }
        m.insert(key, value);
        Ok(())
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().await.remove(key)
    }

    /// Removes the entry only if `pred` accepts the current value.
    pub async fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut m = self.inner.lock().await;
        if m.get(key).is_some_and(pred) {
            return m.remove(key);
        }
        None
    }

    /// Removes and returns every entry matching `pred`.
    pub async fn remove_where<F>(&self, mut pred: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut m = self.inner.lock().await;
        let keys: Vec<K> = m
            .iter()
            .filter(|(k, v)| pred(*k, *v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| m.remove(&k).map(|v| (k, v)))
            .collect()
    }

    pub async fn drain(&self) -> Vec<(K, V)> {
        self.inner.lock().await.drain().collect()
    }

    pub async fn snapshot(&self) -> Vec<(K, V)> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
