//! Bounded bitmap cache
//!
//! Recency-ordered store of decoded pages. Evicted entries have their
//! backing resource released explicitly: immediately when the cache held the
//! last reference, otherwise when the last caller drops its `Arc`.
//!
//! The cache is owned by the coordinator on the render-owner thread, so it
//! takes `&mut self` instead of locking.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;

use super::types::{CacheKey, RenderedPage};

/// Default number of cached pages
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Releases handed to a caller still holding the page
    pub deferred_releases: u64,
    /// Failed releases (logged, never propagated)
    pub release_failures: u64,
    pub resident_bytes: usize,
}

/// LRU cache of rendered pages
pub struct BitmapCache {
    entries: LruCache<CacheKey, Arc<RenderedPage>>,
    /// Entries older than this are treated as misses
    max_age: Option<Duration>,
    hits: u64,
    misses: u64,
    evictions: u64,
    deferred_releases: u64,
    release_failures: u64,
}

impl Default for BitmapCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl BitmapCache {
    /// Create a cache holding at most `capacity` pages (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_age: None,
            hits: 0,
            misses: 0,
            evictions: 0,
            deferred_releases: 0,
            release_failures: 0,
        }
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Look up a page and mark it most recently used
    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<RenderedPage>> {
        let stale = match (self.entries.peek(key), self.max_age) {
            (Some(page), Some(max_age)) => page.age() > max_age,
            _ => false,
        };

        if stale {
            if let Some(page) = self.entries.pop(key) {
                tracing::debug!(key = %key, "Dropping stale cache entry");
                self.release(page);
            }
        }

        match self.entries.get(key) {
            Some(page) => {
                self.hits += 1;
                tracing::debug!(key = %key, "Cache hit");
                Some(Arc::clone(page))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up a page without touching recency or counters
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<RenderedPage>> {
        self.entries.peek(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Insert a page, returning the key evicted to make room (if any)
    pub fn insert(&mut self, page: Arc<RenderedPage>) -> Option<CacheKey> {
        let key = page.key.clone();
        match self.entries.push(key.clone(), page) {
            Some((old_key, old_page)) if old_key == key => {
                // Same key replaced; not an eviction
                self.release(old_page);
                None
            }
            Some((evicted_key, evicted_page)) => {
                self.evictions += 1;
                tracing::debug!(evicted = %evicted_key, inserted = %key, "Evicted LRU page");
                self.release(evicted_page);
                Some(evicted_key)
            }
            None => None,
        }
    }

    /// Remove a single entry
    pub fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.pop(key) {
            Some(page) => {
                self.release(page);
                true
            }
            None => false,
        }
    }

    /// Drop every page of a document; returns the number removed
    pub fn remove_document(&mut self, document_id: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(key, _)| &*key.document_id == document_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(page) = self.entries.pop(key) {
                self.release(page);
            }
        }

        if !keys.is_empty() {
            tracing::debug!(document_id, removed = keys.len(), "Removed document pages from cache");
        }
        keys.len()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        while let Some((_, page)) = self.entries.pop_lru() {
            self.release(page);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Decoded pixel bytes held by cached pages
    pub fn resident_bytes(&self) -> usize {
        self.entries.iter().map(|(_, page)| page.resident_bytes()).sum()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            deferred_releases: self.deferred_releases,
            release_failures: self.release_failures,
            resident_bytes: self.resident_bytes(),
        }
    }

    fn release(&mut self, page: Arc<RenderedPage>) {
        match Arc::try_unwrap(page) {
            Ok(page) => {
                let key = page.key.clone();
                if let Err(e) = page.release() {
                    self.release_failures += 1;
                    tracing::warn!(key = %key, error = %e, "Failed to release evicted page");
                }
            }
            Err(shared) => {
                // A caller still holds it; its drop tears the resource down
                self.deferred_releases += 1;
                tracing::debug!(key = %shared.key, "Release deferred to last holder");
            }
        }
    }
}

impl Drop for BitmapCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::types::{PageImage, StrategyKind};
    use image::{Rgba, RgbaImage};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn resident(page_number: u32) -> Arc<RenderedPage> {
        Arc::new(RenderedPage::new(
            CacheKey::new("doc", page_number, 96.0),
            PageImage::Resident(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]))),
            2,
            2,
            Duration::ZERO,
            StrategyKind::ResidentBitmap,
        ))
    }

    fn file_backed(page_number: u32) -> (Arc<RenderedPage>, std::path::PathBuf) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"png").unwrap();
        let path = file.path().to_path_buf();
        let page = RenderedPage::new(
            CacheKey::new("doc", page_number, 96.0),
            PageImage::FileBacked { file, len: 3 },
            1,
            1,
            Duration::ZERO,
            StrategyKind::FileBacked,
        );
        (Arc::new(page), path)
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let mut cache = BitmapCache::new(3);
        for page in 1..=3 {
            assert_eq!(cache.insert(resident(page)), None);
        }
        assert_eq!(cache.len(), 3);

        // Touch page 1 so page 2 becomes least recently used
        assert!(cache.get(&CacheKey::new("doc", 1, 96.0)).is_some());

        let evicted = cache.insert(resident(4));
        assert_eq!(evicted, Some(CacheKey::new("doc", 2, 96.0)));
        assert_eq!(cache.len(), 3);

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.resident_bytes, 3 * 16);
    }

    #[test]
    fn test_eviction_deletes_file_when_unshared() {
        let mut cache = BitmapCache::new(1);
        let (page, path) = file_backed(1);
        cache.insert(page);
        assert!(path.exists());

        cache.insert(resident(2));
        assert!(!path.exists());
        assert_eq!(cache.stats().release_failures, 0);
    }

    #[test]
    fn test_eviction_defers_release_while_held() {
        let mut cache = BitmapCache::new(1);
        let (page, path) = file_backed(1);
        let held = Arc::clone(&page);
        cache.insert(page);

        cache.insert(resident(2));
        assert_eq!(cache.stats().deferred_releases, 1);
        assert!(path.exists(), "caller still holds the page");

        drop(held);
        assert!(!path.exists());
    }

    #[test]
    fn test_release_failure_is_counted_not_fatal() {
        let mut cache = BitmapCache::new(1);
        let (page, path) = file_backed(1);
        cache.insert(page);
        std::fs::remove_file(&path).unwrap();

        let evicted = cache.insert(resident(2));
        assert_eq!(evicted, Some(CacheKey::new("doc", 1, 96.0)));
        assert_eq!(cache.stats().release_failures, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_document() {
        let mut cache = BitmapCache::new(10);
        cache.insert(resident(1));
        cache.insert(resident(2));
        cache.insert(Arc::new(RenderedPage::new(
            CacheKey::new("other", 1, 96.0),
            PageImage::Resident(RgbaImage::new(1, 1)),
            1,
            1,
            Duration::ZERO,
            StrategyKind::ResidentBitmap,
        )));

        assert_eq!(cache.remove_document("doc"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&CacheKey::new("other", 1, 96.0)));
    }

    #[test]
    fn test_miss_is_counted() {
        let mut cache = BitmapCache::default();
        assert!(cache.get(&CacheKey::new("doc", 9, 96.0)).is_none());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.capacity(), DEFAULT_CACHE_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_are_misses() {
        let mut cache = BitmapCache::new(4).with_max_age(Some(Duration::from_secs(60)));
        cache.insert(resident(1));
        let key = CacheKey::new("doc", 1, 96.0);

        assert!(cache.get(&key).is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }
}
