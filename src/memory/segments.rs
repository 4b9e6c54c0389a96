//! Segment and dirty metadata vectors
//!
//! Two parallel page-indexed vectors cover the whole address range
//! the runtime has touched, [memory_base, memory_end). The segment
//! vector records what each page is used for and which collection
//! generation it belongs to; the dirty vector records the write
//! barrier's pure/dirty flag consumed by the collector when deciding
//! which pages to rescan.
//!
//! Indices are not zero based: they are computed from absolute
//! addresses through `page_index` and offset by the stored bias of
//! the first tracked page. The tracked range grows in whole logical
//! segments so each extension adds a page-sized stride of slots.

use itertools::Itertools;

use super::mapper::{self, PAGE_SHIFT, PAGE_SIZE};

/// Pages in one logical segment; range extension is always a whole
/// number of segments.
pub const SLOTS_PER_SEGMENT: usize = PAGE_SIZE / std::mem::size_of::<u32>();

/// Bytes spanned by one logical segment (4MiB with 4K pages)
pub const SEGMENT_SIZE: usize = PAGE_SIZE * SLOTS_PER_SEGMENT;

/// What a tracked page is used for
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Not part of any allocated region
    #[default]
    Hole,
    /// Nursery memory (current or retired hot block); not itself a
    /// collector root
    Heap,
    /// The active execution-stack segment
    Stack,
    /// Collector-managed memory holding object references
    Pointers,
    /// Opaque bytes; never scanned for references
    Data,
    /// First page of a code object; scanned as a root source
    Code,
}

/// One segment-vector slot: page use plus collection generation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSlot {
    kind: PageKind,
    generation: u8,
}

impl SegmentSlot {
    pub fn new(kind: PageKind, generation: u8) -> Self {
        SegmentSlot { kind, generation }
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    pub fn is_hole(&self) -> bool {
        self.kind == PageKind::Hole
    }
}

/// The segment vector and dirty vector plus the address range they
/// cover
#[derive(Debug)]
pub struct PageTable {
    /// Per-page use and generation tags
    segments: Vec<SegmentSlot>,
    /// Per-page write-barrier flags; false is pure
    dirty: Vec<bool>,
    /// Index bias: `page_index(memory_base)`, subtracted from
    /// absolute page indices to reach vector slots
    first_page: usize,
    /// Low bound of the tracked range, segment aligned
    memory_base: usize,
    /// High bound (exclusive) of the tracked range, segment aligned
    memory_end: usize,
}

/// Page index of an absolute address; the one address-to-index
/// mapping used throughout.
pub fn page_index(addr: usize) -> usize {
    addr >> PAGE_SHIFT
}

fn segment_index(addr: usize) -> usize {
    addr / SEGMENT_SIZE
}

impl PageTable {
    /// Build vectors covering the segment-aligned envelope of
    /// [lo_mem, hi_mem); every slot starts as hole/pure.
    pub fn new(lo_mem: usize, hi_mem: usize) -> Self {
        debug_assert!(lo_mem < hi_mem);
        let lo_seg = segment_index(lo_mem);
        let hi_seg = segment_index(hi_mem + SEGMENT_SIZE - 1);
        let slots = (hi_seg - lo_seg) * SLOTS_PER_SEGMENT;
        PageTable {
            segments: vec![SegmentSlot::default(); slots],
            dirty: vec![false; slots],
            first_page: lo_seg * SLOTS_PER_SEGMENT,
            memory_base: lo_seg * SEGMENT_SIZE,
            memory_end: hi_seg * SEGMENT_SIZE,
        }
    }

    pub fn memory_base(&self) -> usize {
        self.memory_base
    }

    pub fn memory_end(&self) -> usize {
        self.memory_end
    }

    /// Whether an address falls in the tracked range
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.memory_base && addr < self.memory_end
    }

    fn slot_index(&self, addr: usize) -> usize {
        debug_assert!(self.covers(addr));
        page_index(addr) - self.first_page
    }

    /// Tag every page of [base, base + size) with `slot`. The range
    /// must already lie within the tracked bounds.
    pub fn tag_range(&mut self, base: usize, size: usize, slot: SegmentSlot) {
        debug_assert!(mapper::is_page_aligned(base));
        debug_assert!(mapper::is_page_aligned(size));
        debug_assert!(base >= self.memory_base);
        debug_assert!(base + size <= self.memory_end);

        let first = self.slot_index(base);
        for index in first..first + (size >> PAGE_SHIFT) {
            self.segments[index] = slot;
        }
    }

    /// The tag of the page containing `addr`; pages outside the
    /// tracked range read as hole.
    pub fn slot_at(&self, addr: usize) -> SegmentSlot {
        if self.covers(addr) {
            self.segments[self.slot_index(addr)]
        } else {
            SegmentSlot::default()
        }
    }

    /// Grow both vectors so [base, base + size) is tracked. Existing
    /// slot values keep their pages: extension downward prepends
    /// fresh hole/pure slots, extension upward appends them. A range
    /// already covered leaves the table untouched.
    pub fn ensure_covers(&mut self, base: usize, size: usize) {
        debug_assert!(mapper::is_page_aligned(size));
        let end = base + size;

        if base < self.memory_base {
            let new_lo_seg = segment_index(base);
            let old_lo_seg = segment_index(self.memory_base);
            let added = (old_lo_seg - new_lo_seg) * SLOTS_PER_SEGMENT;
            self.segments
                .splice(0..0, std::iter::repeat(SegmentSlot::default()).take(added));
            self.dirty.splice(0..0, std::iter::repeat(false).take(added));
            self.first_page -= added;
            self.memory_base = new_lo_seg * SEGMENT_SIZE;
        }

        if end >= self.memory_end {
            let new_hi_seg = segment_index(end + SEGMENT_SIZE - 1);
            let old_hi_seg = segment_index(self.memory_end);
            let added = (new_hi_seg - old_hi_seg) * SLOTS_PER_SEGMENT;
            self.segments
                .extend(std::iter::repeat(SegmentSlot::default()).take(added));
            self.dirty.extend(std::iter::repeat(false).take(added));
            self.memory_end = new_hi_seg * SEGMENT_SIZE;
        }
    }

    /// Signal a write barrier: mark the page containing `addr` dirty
    pub fn mark_dirty(&mut self, addr: usize) {
        let index = self.slot_index(addr);
        self.dirty[index] = true;
    }

    /// Reset the page containing `addr` to pure (collector use, after
    /// a rescan)
    pub fn mark_pure(&mut self, addr: usize) {
        let index = self.slot_index(addr);
        self.dirty[index] = false;
    }

    pub fn is_dirty(&self, addr: usize) -> bool {
        if self.covers(addr) {
            self.dirty[self.slot_index(addr)]
        } else {
            false
        }
    }

    /// Base addresses and tags of every page not marked hole. Live
    /// regions are exactly the pages this yields, which is how
    /// teardown finds everything still mapped.
    pub fn live_pages(&self) -> impl Iterator<Item = (usize, SegmentSlot)> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_hole())
            .map(move |(index, slot)| ((self.first_page + index) << PAGE_SHIFT, *slot))
    }

    /// Run-length rendering of the segment vector, for diagnostics
    pub fn render_metatable(&self) -> String {
        let mut out = String::new();
        for (kind, group) in &self
            .segments
            .iter()
            .enumerate()
            .group_by(|(_, slot)| slot.kind())
        {
            let run: Vec<_> = group.collect();
            let start = (self.first_page + run[0].0) << PAGE_SHIFT;
            out.push_str(&format!(
                "{:#018x} + {:5} pages = {:?}\n",
                start,
                run.len(),
                kind
            ));
        }
        out
    }

    /// Run-length rendering of the dirty vector, for diagnostics
    pub fn render_dirty_vector(&self) -> String {
        let mut out = String::new();
        for (flag, group) in &self.dirty.iter().enumerate().group_by(|(_, d)| **d) {
            let run: Vec<_> = group.collect();
            let start = (self.first_page + run[0].0) << PAGE_SHIFT;
            out.push_str(&format!(
                "{:#018x} + {:5} pages = {}\n",
                start,
                run.len(),
                if flag { "dirty" } else { "pure" }
            ));
        }
        out
    }
}
