//! Recycling cache for single pages
//!
//! Page-sized mappings come and go constantly (metadata growth, small
//! code objects, collector work lists), so released pages are parked
//! on a free list instead of being returned to the OS. Slots live in
//! one arena preallocated at context creation; the chain is held as
//! slot indices rather than raw pointers.

/// Default number of pages retained before releases fall through to
/// the mapper again. A tuning value, not an invariant.
pub const PAGE_CACHE_SLOTS: usize = 128;

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Base address of the cached page (meaningful only while the
    /// slot is on the cached chain)
    base: usize,
    next: Option<usize>,
}

/// Free list of single pages, retained mapped across
/// release/acquire cycles.
///
/// Pages popped from the cache keep their stale contents: a cache hit
/// must never be assumed zeroed or sentinel-filled.
#[derive(Debug)]
pub struct PageCache {
    /// Slot arena, fixed at creation
    slots: Vec<Slot>,
    /// Head of the chain of slots holding a reusable page
    cached: Option<usize>,
    /// Head of the chain of slots free to record a future release
    unused: Option<usize>,
}

impl PageCache {
    /// Preallocate the slot arena and thread every slot onto the
    /// unused chain.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut prev = None;
        for _ in 0..capacity {
            slots.push(Slot { base: 0, next: prev });
            prev = Some(slots.len() - 1);
        }
        PageCache {
            slots,
            cached: None,
            unused: prev,
        }
    }

    /// Pop a retained page if one is available. The returned page is
    /// still mapped and holds whatever it held when released.
    pub fn acquire(&mut self) -> Option<usize> {
        let index = self.cached?;
        let slot = self.slots[index];
        self.cached = slot.next;
        self.slots[index].next = self.unused;
        self.unused = Some(index);
        Some(slot.base)
    }

    /// Park a page on the free list, leaving its contents untouched.
    /// Returns false when every slot is occupied; the caller then
    /// owns the page and must unmap it.
    pub fn release(&mut self, base: usize) -> bool {
        match self.unused {
            Some(index) => {
                self.unused = self.slots[index].next;
                self.slots[index] = Slot {
                    base,
                    next: self.cached,
                };
                self.cached = Some(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return every retained page, for teardown
    pub fn drain(&mut self) -> Vec<usize> {
        let mut pages = vec![];
        while let Some(base) = self.acquire() {
            pages.push(base);
        }
        pages
    }

    /// Number of pages currently retained
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.cached;
        while let Some(index) = cursor {
            count += 1;
            cursor = self.slots[index].next;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    pub fn test_empty_cache_misses() {
        let mut cache = PageCache::new(4);
        assert!(cache.is_empty());
        assert_eq!(cache.acquire(), None);
    }

    #[test]
    pub fn test_lifo_reuse() {
        let mut cache = PageCache::new(4);
        assert!(cache.release(0x1000));
        assert!(cache.release(0x2000));
        assert_eq!(cache.acquire(), Some(0x2000));
        assert_eq!(cache.acquire(), Some(0x1000));
        assert_eq!(cache.acquire(), None);
    }

    #[test]
    pub fn test_capacity_bound() {
        let mut cache = PageCache::new(2);
        assert!(cache.release(0x1000));
        assert!(cache.release(0x2000));
        assert!(!cache.release(0x3000));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    pub fn test_slots_recycle() {
        let mut cache = PageCache::new(1);
        for page in [0x1000usize, 0x2000, 0x3000] {
            assert!(cache.release(page));
            assert_eq!(cache.acquire(), Some(page));
        }
    }

    #[test]
    pub fn test_drain() {
        let mut cache = PageCache::new(4);
        cache.release(0x1000);
        cache.release(0x2000);
        cache.release(0x3000);
        let pages = cache.drain();
        assert_eq!(pages, vec![0x3000, 0x2000, 0x1000]);
        assert!(cache.is_empty());
    }
}
