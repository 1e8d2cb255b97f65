use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use image::RgbaImage;
use lru::LruCache;

use crate::core::geo::TileCoord;

/// In-memory cache of decoded tile images using LRU eviction
#[derive(Debug)]
pub struct ImageCache {
    cache: Arc<Mutex<LruCache<TileCoord, Arc<RgbaImage>>>>,
}

impl ImageCache {
    /// Create a new image cache with the given capacity
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1024).unwrap());
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Create a new image cache with default capacity (1024 tiles)
    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    /// Get a decoded image from the cache
    pub fn get(&self, coord: &TileCoord) -> Option<Arc<RgbaImage>> {
        self.cache.lock().ok()?.get(coord).cloned()
    }

    /// Insert a decoded image into the cache
    pub fn put(&self, coord: TileCoord, image: Arc<RgbaImage>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(coord, image);
        }
    }

    /// Check if an image is in the cache
    pub fn contains(&self, coord: &TileCoord) -> bool {
        self.cache
            .lock()
            .ok()
            .map(|cache| cache.contains(coord))
            .unwrap_or(false)
    }

    /// Clear all images from the cache
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Get the current number of cached images
    pub fn len(&self) -> usize {
        self.cache.lock().ok().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for ImageCache {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(coord: TileCoord) -> Arc<RgbaImage> {
        Arc::new(RgbaImage::from_pixel(
            1,
            1,
            image::Rgba([coord.x as u8, coord.y as u8, coord.z, 255]),
        ))
    }

    #[test]
    fn test_image_cache_basic_operations() {
        let cache = ImageCache::new(2);
        let coord1 = TileCoord::new(1, 2, 3);
        let coord2 = TileCoord::new(4, 5, 6);

        assert!(cache.is_empty());

        cache.put(coord1, pixel(coord1));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&coord1));
        assert!(cache.get(&coord1).is_some());

        cache.put(coord2, pixel(coord2));
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_image_cache_lru_eviction() {
        let cache = ImageCache::new(2);
        let coord1 = TileCoord::new(1, 1, 1);
        let coord2 = TileCoord::new(2, 2, 2);
        let coord3 = TileCoord::new(3, 3, 3);

        cache.put(coord1, pixel(coord1));
        cache.put(coord2, pixel(coord2));
        cache.put(coord3, pixel(coord3));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&coord1)); // evicted
        assert!(cache.contains(&coord2));
        assert!(cache.contains(&coord3));
    }
}
