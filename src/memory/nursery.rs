//! Nursery bump allocator
//!
//! All small-object allocation happens by bumping a cursor through the
//! hot block. When the hot block cannot satisfy a request the context
//! either collects or retires the block and installs a fresh one; this
//! module holds the mechanics (the bump, the retired list and the
//! allocation accounting) while the context decides when to collect.

use super::mapper::{self, PAGE_SIZE};

/// Default hot block size (4MiB). A tuning value.
pub const DEFAULT_NURSERY_SIZE: usize = 1024 * PAGE_SIZE;

/// Headroom kept between the redline and the true end of the hot
/// block, so the fast path can overshoot by a small object before
/// anyone notices. A tuning value, not an invariant.
pub const NURSERY_SLACK: usize = 2 * PAGE_SIZE;

/// Bytes of minor allocation that roll over into one major count
pub const MOST_BYTES_IN_MINOR: usize = 0x1000_0000;

/// A hot block that filled up and was replaced. Its pages stay mapped
/// and tagged until the next collection sweeps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetiredBlock {
    pub base: usize,
    pub size: usize,
}

/// The hot block plus the retired list and allocation counters
#[derive(Debug)]
pub struct Nursery {
    /// Base of the current hot block
    base: usize,
    /// Size of the current hot block in bytes
    size: usize,
    /// Next allocation address
    cursor: usize,
    /// Size newly installed hot blocks default to
    configured_size: usize,
    /// Replaced hot blocks, newest first
    retired: Vec<RetiredBlock>,
    /// Bytes allocated since the last rollover, low word of the
    /// two-level allocation counter
    minor_bytes: usize,
    /// Rollover count, high word of the allocation counter
    major_count: usize,
}

impl Nursery {
    /// Adopt a freshly mapped region as the first hot block
    pub fn new(base: usize, size: usize) -> Self {
        debug_assert!(mapper::is_page_aligned(base));
        debug_assert!(mapper::is_page_aligned(size));
        Nursery {
            base,
            size,
            cursor: base,
            configured_size: size,
            retired: vec![],
            minor_bytes: 0,
            major_count: 0,
        }
    }

    /// The fast path: claim `size` bytes if the hot block has room.
    /// Requests are in whole words.
    pub fn bump(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size % mapper::WORD_SIZE == 0);
        if self.cursor + size <= self.base + self.size {
            let addr = self.cursor;
            self.cursor += size;
            Some(addr)
        } else {
            None
        }
    }

    /// Size the replacement hot block should be for a request the
    /// current one could not hold. Oversized requests get their own
    /// block with slack; ordinary exhaustion reuses the configured
    /// size.
    pub fn grow_size_for(&self, requested: usize) -> usize {
        if requested > self.configured_size.saturating_sub(NURSERY_SLACK) {
            mapper::page_round_up(requested + NURSERY_SLACK)
        } else {
            self.configured_size
        }
    }

    /// Move the current hot block onto the retired list and adopt a
    /// replacement. Bytes allocated in the old block are credited to
    /// the allocation counters before it is retired.
    pub fn retire_and_install(&mut self, new_base: usize, new_size: usize) {
        debug_assert!(mapper::is_page_aligned(new_base));
        debug_assert!(mapper::is_page_aligned(new_size));
        self.account(self.used_bytes());
        self.retired.insert(
            0,
            RetiredBlock {
                base: self.base,
                size: self.size,
            },
        );
        self.base = new_base;
        self.size = new_size;
        self.cursor = new_base;
    }

    /// Credit allocated bytes to the two-level counter, carrying into
    /// the major count at the rollover threshold.
    pub fn account(&mut self, bytes: usize) {
        self.minor_bytes += bytes;
        while self.minor_bytes >= MOST_BYTES_IN_MINOR {
            self.minor_bytes -= MOST_BYTES_IN_MINOR;
            self.major_count += 1;
        }
    }

    /// Drop the retired list (collection has swept those blocks; their
    /// pages are the collector's to release).
    pub fn clear_retired(&mut self) -> Vec<RetiredBlock> {
        std::mem::take(&mut self.retired)
    }

    /// Bytes allocated in the current hot block
    pub fn used_bytes(&self) -> usize {
        self.cursor - self.base
    }

    /// Bytes still free in the current hot block
    pub fn free_bytes(&self) -> usize {
        self.base + self.size - self.cursor
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn configured_size(&self) -> usize {
        self.configured_size
    }

    /// Retired hot blocks, newest first
    pub fn retired(&self) -> &[RetiredBlock] {
        &self.retired
    }

    pub fn minor_bytes(&self) -> usize {
        self.minor_bytes
    }

    pub fn major_count(&self) -> usize {
        self.major_count
    }

    /// Total bytes ever allocated, folding the counter levels back
    /// together (for statistics output)
    pub fn total_allocated(&self) -> usize {
        self.major_count * MOST_BYTES_IN_MINOR + self.minor_bytes + self.used_bytes()
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::memory::mapper::WORD_SIZE;

    fn nursery() -> Nursery {
        Nursery::new(0x10_0000, 4 * PAGE_SIZE)
    }

    #[test]
    pub fn test_bump_advances() {
        let mut n = nursery();
        let a = n.bump(8 * WORD_SIZE).unwrap();
        let b = n.bump(2 * WORD_SIZE).unwrap();
        assert_eq!(a, 0x10_0000);
        assert_eq!(b, a + 8 * WORD_SIZE);
        assert_eq!(n.used_bytes(), 10 * WORD_SIZE);
    }

    #[test]
    pub fn test_bump_fills_to_the_last_word() {
        let mut n = nursery();
        assert!(n.bump(4 * PAGE_SIZE - WORD_SIZE).is_some());
        assert!(n.bump(WORD_SIZE).is_some());
        assert_eq!(n.free_bytes(), 0);
        assert!(n.bump(WORD_SIZE).is_none());
    }

    #[test]
    pub fn test_grow_size_ordinary_exhaustion() {
        let n = nursery();
        assert_eq!(n.grow_size_for(16 * WORD_SIZE), 4 * PAGE_SIZE);
    }

    #[test]
    pub fn test_grow_size_oversized_request() {
        let n = nursery();
        let request = 16 * PAGE_SIZE + 24;
        assert_eq!(
            n.grow_size_for(request),
            mapper::page_round_up(request + NURSERY_SLACK)
        );
    }

    #[test]
    pub fn test_grow_size_with_tiny_configured_block() {
        // a configured size below the slack must not underflow; every
        // request then takes the oversized path
        let n = Nursery::new(0x10_0000, PAGE_SIZE);
        assert_eq!(
            n.grow_size_for(WORD_SIZE),
            mapper::page_round_up(WORD_SIZE + NURSERY_SLACK)
        );
    }

    #[test]
    pub fn test_retire_prepends() {
        let mut n = nursery();
        n.bump(WORD_SIZE).unwrap();
        n.retire_and_install(0x20_0000, 4 * PAGE_SIZE);
        n.retire_and_install(0x30_0000, 4 * PAGE_SIZE);

        assert_eq!(n.retired().len(), 2);
        assert_eq!(n.retired()[0].base, 0x20_0000);
        assert_eq!(n.retired()[1].base, 0x10_0000);
        assert_eq!(n.base(), 0x30_0000);
        assert_eq!(n.used_bytes(), 0);
    }

    #[test]
    pub fn test_accounting_carries_at_threshold() {
        let mut n = nursery();
        for _ in 0..5 {
            n.account(0x0800_0000);
        }
        assert_eq!(n.major_count(), 2);
        assert_eq!(n.minor_bytes(), 0x0800_0000);
    }

    #[test]
    pub fn test_retire_credits_used_bytes() {
        let mut n = nursery();
        n.bump(64 * WORD_SIZE).unwrap();
        n.retire_and_install(0x20_0000, 4 * PAGE_SIZE);
        assert_eq!(n.minor_bytes(), 64 * WORD_SIZE);
    }
}
