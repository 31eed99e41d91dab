//! On-heap entry caches for caches configured with `on_heap_cache`.
//!
//! Primaries keep recently read or written entries in a Moka cache in front
//! of the partition store. The cache of a group is invalidated whenever its
//! assignment changes.

use crate::types::CacheId;
use bytes::Bytes;
use dashmap::DashMap;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct HeapCaches {
    caches: DashMap<CacheId, Cache<Bytes, Bytes>>,
    max_capacity: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HeapCaches {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            caches: DashMap::new(),
            max_capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn cache(&self, cache_id: CacheId) -> Cache<Bytes, Bytes> {
        self.caches
            .entry(cache_id)
            .or_insert_with(|| {
                Cache::builder()
                    .max_capacity(self.max_capacity)
                    .weigher(|key: &Bytes, value: &Bytes| {
                        (key.len() + value.len()).min(u32::MAX as usize) as u32
                    })
                    .build()
            })
            .clone()
    }

    pub async fn get(&self, cache_id: CacheId, key: &Bytes) -> Option<Bytes> {
        let result = self.cache(cache_id).get(key).await;
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub async fn insert(&self, cache_id: CacheId, key: Bytes, value: Bytes) {
        self.cache(cache_id).insert(key, value).await;
    }

    pub async fn invalidate(&self, cache_id: CacheId, key: &Bytes) {
        if let Some(cache) = self.caches.get(&cache_id).map(|c| c.value().clone()) {
            cache.invalidate(key).await;
        }
    }

    /// Drop every entry of a cache.
    pub fn invalidate_cache(&self, cache_id: CacheId) {
        if let Some(cache) = self.caches.get(&cache_id) {
            cache.invalidate_all();
        }
    }

    /// Forget a destroyed cache.
    pub fn remove_cache(&self, cache_id: CacheId) {
        if let Some((_, cache)) = self.caches.remove(&cache_id) {
            cache.invalidate_all();
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_invalidate() {
        let heap = HeapCaches::new(100);
        let key = Bytes::from_static(b"k");

        assert!(heap.get(1, &key).await.is_none());
        heap.insert(1, key.clone(), Bytes::from_static(b"v")).await;
        assert_eq!(heap.get(1, &key).await, Some(Bytes::from_static(b"v")));
        assert!(heap.get(2, &key).await.is_none());

        heap.invalidate(1, &key).await;
        assert!(heap.get(1, &key).await.is_none());
        assert_eq!(heap.hits(), 1);
        assert_eq!(heap.misses(), 3);
    }
}
