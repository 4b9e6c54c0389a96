//! The runtime context
//!
//! One `Pcb` owns everything a running program needs from the memory
//! substrate: the page mapper and its accounting, the single-page
//! cache, the segment and dirty vectors, the nursery, the active
//! stack segment and the frozen continuation chain. There is no
//! global state; embedders create as many contexts as they like and
//! tear each down independently.

use crate::error::FatalError;

use super::cache::{PageCache, PAGE_CACHE_SLOTS};
use super::code::{self, CodeRef};
use super::mapper::{self, PageMapper, Protection, PAGE_SIZE, WORD_SIZE};
use super::nursery::{Nursery, DEFAULT_NURSERY_SIZE};
use super::segments::{PageKind, PageTable, SegmentSlot};
use super::stack::{ContinuationArena, ExecStack, DEFAULT_STACK_SIZE};

/// Sizing knobs for a new context. All sizes are rounded up to whole
/// pages.
#[derive(Debug, Clone)]
pub struct PcbConfig {
    pub nursery_size: usize,
    pub stack_size: usize,
    /// Protect the lowest page of each stack segment so a runaway
    /// frame faults instead of scribbling
    pub guard_pages: bool,
    pub page_cache_slots: usize,
}

impl Default for PcbConfig {
    fn default() -> Self {
        PcbConfig {
            nursery_size: DEFAULT_NURSERY_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: true,
            page_cache_slots: PAGE_CACHE_SLOTS,
        }
    }
}

/// The external collector the checked allocation path hands control
/// to on exhaustion. Implementations reclaim or grow memory through
/// the context they are passed; on return the nursery must be able to
/// satisfy the request.
pub trait Collector {
    fn collect(&mut self, pcb: &mut Pcb, requested: usize) -> Result<(), FatalError>;
}

/// A runtime context (process control block)
pub struct Pcb {
    mapper: PageMapper,
    cache: PageCache,
    table: PageTable,
    nursery: Nursery,
    stack: ExecStack,
    continuations: ContinuationArena,
    collector: Option<Box<dyn Collector>>,
    collection_suspended: bool,
    stack_size: usize,
    guard_pages: bool,
}

impl Pcb {
    /// Map and wire up a fresh context: nursery first, then the stack
    /// segment, then metadata vectors covering both with a page of
    /// padding either side.
    pub fn new(config: PcbConfig) -> Result<Self, FatalError> {
        let nursery_size = mapper::page_round_up(config.nursery_size);
        let stack_size = mapper::page_round_up(config.stack_size);
        let mut mapper = PageMapper::new();

        let nursery_base = mapper.map(nursery_size)?;
        let stack_base = mapper.map(stack_size)?;

        let lo = nursery_base.min(stack_base) - PAGE_SIZE;
        let hi = (nursery_base + nursery_size).max(stack_base + stack_size) + PAGE_SIZE;
        let mut table = PageTable::new(lo, hi);
        table.tag_range(
            nursery_base,
            nursery_size,
            SegmentSlot::new(PageKind::Heap, 0),
        );
        table.tag_range(stack_base, stack_size, SegmentSlot::new(PageKind::Stack, 0));

        let stack = unsafe { ExecStack::install(stack_base, stack_size, config.guard_pages) };
        if config.guard_pages {
            mapper.protect(stack_base, PAGE_SIZE, Protection::NONE)?;
        }

        log::info!(
            "context up: nursery {:#x}+{:#x}, stack {:#x}+{:#x}",
            nursery_base,
            nursery_size,
            stack_base,
            stack_size
        );

        Ok(Pcb {
            mapper,
            cache: PageCache::new(config.page_cache_slots),
            table,
            nursery: Nursery::new(nursery_base, nursery_size),
            stack,
            continuations: ContinuationArena::new(),
            collector: None,
            collection_suspended: false,
            stack_size,
            guard_pages: config.guard_pages,
        })
    }

    /// Install the collector invoked by checked allocation
    pub fn set_collector(&mut self, collector: Box<dyn Collector>) {
        self.collector = Some(collector);
    }

    /// Allocate from the nursery, collecting on exhaustion. `size` is
    /// a whole number of words.
    ///
    /// With collection suspended (or no collector installed) the
    /// nursery force-grows instead; either way a request that still
    /// cannot be satisfied after one recovery attempt is fatal.
    pub fn alloc_checked(&mut self, size: usize) -> Result<usize, FatalError> {
        debug_assert!(size % WORD_SIZE == 0);
        if let Some(addr) = self.nursery.bump(size) {
            return Ok(addr);
        }

        match self.collector.take() {
            Some(mut collector) if !self.collection_suspended => {
                let outcome = collector.collect(self, size);
                self.collector = Some(collector);
                outcome?;
                self.nursery
                    .bump(size)
                    .ok_or(FatalError::CollectorContract { requested: size })
            }
            taken => {
                self.collector = taken;
                self.make_room_in_nursery(size)?;
                self.nursery
                    .bump(size)
                    .ok_or(FatalError::NurseryExhausted { requested: size })
            }
        }
    }

    /// Allocate without ever collecting (for code paths holding raw
    /// addresses a collection would invalidate). Exhaustion always
    /// force-grows the nursery.
    pub fn alloc_unchecked(&mut self, size: usize) -> Result<usize, FatalError> {
        debug_assert!(size % WORD_SIZE == 0);
        if let Some(addr) = self.nursery.bump(size) {
            return Ok(addr);
        }
        self.make_room_in_nursery(size)?;
        self.nursery
            .bump(size)
            .ok_or(FatalError::NurseryExhausted { requested: size })
    }

    /// Retire the hot block and install a fresh one big enough for
    /// `requested`. Public so collectors can use it while rebuilding
    /// the nursery.
    pub fn make_room_in_nursery(&mut self, requested: usize) -> Result<(), FatalError> {
        let new_size = self.nursery.grow_size_for(requested);
        let new_base = self.map_typed(new_size, SegmentSlot::new(PageKind::Heap, 0))?;
        self.nursery.retire_and_install(new_base, new_size);
        log::debug!("nursery grown to {:#x}+{:#x}", new_base, new_size);
        Ok(())
    }

    /// Map a region and tag all of its pages. Page-sized requests are
    /// served from the cache when possible; a cache hit keeps its
    /// stale contents.
    pub fn map_typed(&mut self, size: usize, slot: SegmentSlot) -> Result<usize, FatalError> {
        let base = self.acquire_region(size)?;
        self.table.tag_range(base, size, slot);
        Ok(base)
    }

    fn acquire_region(&mut self, size: usize) -> Result<usize, FatalError> {
        debug_assert!(mapper::is_page_aligned(size));
        let base = if size == PAGE_SIZE {
            match self.cache.acquire() {
                Some(page) => page,
                None => self.mapper.map(size)?,
            }
        } else {
            self.mapper.map(size)?
        };
        self.table.ensure_covers(base, size);
        Ok(base)
    }

    /// A single page, from the cache or freshly mapped, left untagged
    /// for the caller
    pub fn acquire_page(&mut self) -> Result<usize, FatalError> {
        self.acquire_region(PAGE_SIZE)
    }

    /// Return a single page: tag it hole and park it on the cache, or
    /// unmap it when the cache is full.
    pub fn release_page(&mut self, base: usize) -> Result<(), FatalError> {
        self.table
            .tag_range(base, PAGE_SIZE, SegmentSlot::default());
        if !self.cache.release(base) {
            self.mapper.unmap(base, PAGE_SIZE)?;
        }
        Ok(())
    }

    /// Freeze the live frames of the current stack segment into a
    /// continuation and switch to a fresh segment.
    ///
    /// The old segment's pages are retagged as data so the frozen
    /// frames survive as ordinary collector-visible bytes; its guard
    /// page is reopened first.
    pub fn stack_overflow(&mut self) -> Result<(), FatalError> {
        let old_base = self.stack.base();
        let old_size = self.stack.size();
        let top = self.stack.frame_pointer();
        let live = self.stack.live_bytes();

        self.continuations.freeze(top, live);

        if self.stack.guarded() {
            self.mapper
                .protect(old_base, PAGE_SIZE, Protection::all_access())?;
        }
        self.table
            .tag_range(old_base, old_size, SegmentSlot::new(PageKind::Data, 0));

        let new_base = self.map_typed(self.stack_size, SegmentSlot::new(PageKind::Stack, 0))?;
        self.stack = unsafe { ExecStack::install(new_base, self.stack_size, self.guard_pages) };
        if self.guard_pages {
            self.mapper.protect(new_base, PAGE_SIZE, Protection::NONE)?;
        }

        log::debug!(
            "stack overflow: froze {:#x} bytes, new segment {:#x}+{:#x}",
            live,
            new_base,
            self.stack_size
        );
        Ok(())
    }

    /// Claim frame space, freezing into a fresh segment when the
    /// redline is hit. A request no fresh segment could hold fails
    /// up front, without freezing an empty continuation.
    pub fn enter_frame(&mut self, bytes: usize) -> Result<usize, FatalError> {
        if let Some(fp) = self.stack.enter_frame(bytes) {
            return Ok(fp);
        }
        if bytes > self.stack_size - WORD_SIZE - self.stack.slack() {
            return Err(FatalError::FrameTooLarge { requested: bytes });
        }
        self.stack_overflow()?;
        self.stack
            .enter_frame(bytes)
            .ok_or(FatalError::FrameTooLarge { requested: bytes })
    }

    pub fn leave_frame(&mut self, bytes: usize) {
        self.stack.leave_frame(bytes)
    }

    /// Allocate a code object: a zeroed page-aligned region with its
    /// first page tagged code and the rest opaque data.
    pub fn alloc_code(&mut self, code_size: usize, freevars: usize) -> Result<CodeRef, FatalError> {
        let size = code::memory_required(code_size);
        let base = self.acquire_region(size)?;
        // cache hits carry stale contents
        unsafe {
            std::ptr::write_bytes(base as *mut u8, 0, size);
        }
        self.table
            .tag_range(base, PAGE_SIZE, SegmentSlot::new(PageKind::Code, 0));
        if size > PAGE_SIZE {
            self.table.tag_range(
                base + PAGE_SIZE,
                size - PAGE_SIZE,
                SegmentSlot::new(PageKind::Data, 0),
            );
        }
        Ok(unsafe { CodeRef::init(base, code_size, freevars) })
    }

    /// Store a code object's relocation vector and flag its page for
    /// rescanning
    pub fn set_code_reloc_vector(&mut self, code: CodeRef, value: usize) {
        unsafe { code.set_reloc_vector(value) };
        self.signal_dirt(code.base());
    }

    /// Store a code object's annotation and flag its page for
    /// rescanning
    pub fn set_code_annotation(&mut self, code: CodeRef, value: usize) {
        unsafe { code.set_annotation(value) };
        self.signal_dirt(code.base());
    }

    /// Write barrier: an old-to-young reference may now exist on the
    /// page containing `addr`
    pub fn signal_dirt(&mut self, addr: usize) {
        self.table.mark_dirty(addr);
    }

    pub fn is_dirty(&self, addr: usize) -> bool {
        self.table.is_dirty(addr)
    }

    pub fn mark_pure(&mut self, addr: usize) {
        self.table.mark_pure(addr);
    }

    /// Keep checked allocation away from the collector (used around
    /// code holding raw addresses)
    pub fn set_collection_suspended(&mut self, suspended: bool) {
        self.collection_suspended = suspended;
    }

    pub fn collection_suspended(&self) -> bool {
        self.collection_suspended
    }

    /// Human-readable rendering of the metadata vectors
    pub fn dump_metatable(&self) -> String {
        format!(
            "{}\n{}",
            self.table.render_metatable(),
            self.table.render_dirty_vector()
        )
    }

    pub fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    pub fn stack(&self) -> &ExecStack {
        &self.stack
    }

    pub fn continuations(&self) -> &ContinuationArena {
        &self.continuations
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn mapped_pages(&self) -> usize {
        self.mapper.mapped_pages()
    }

    /// Tear the context down: unmap the cache's parked pages, then
    /// every page the segment vector records as live. Returns the
    /// residual mapped-page count, which is zero unless pages leaked.
    pub fn destroy(mut self) -> Result<usize, FatalError> {
        for page in self.cache.drain() {
            self.mapper.unmap(page, PAGE_SIZE)?;
        }

        let live: Vec<usize> = self.table.live_pages().map(|(addr, _)| addr).collect();
        for page in live {
            self.mapper.unmap(page, PAGE_SIZE)?;
        }

        let residual = self.mapper.mapped_pages();
        if residual > 0 {
            log::warn!("context destroyed with {} pages still mapped", residual);
        }
        Ok(residual)
    }
}

impl std::fmt::Debug for Pcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pcb")
            .field("nursery", &self.nursery)
            .field("stack", &self.stack)
            .field("mapped_pages", &self.mapper.mapped_pages())
            .field("collection_suspended", &self.collection_suspended)
            .finish()
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    fn small_config() -> PcbConfig {
        PcbConfig {
            nursery_size: 4 * PAGE_SIZE,
            stack_size: 4 * PAGE_SIZE,
            guard_pages: false,
            page_cache_slots: 8,
        }
    }

    /// Test collector that force-grows the nursery and counts its
    /// invocations
    struct GrowingCollector {
        invocations: std::rc::Rc<std::cell::Cell<usize>>,
    }

    impl Collector for GrowingCollector {
        fn collect(&mut self, pcb: &mut Pcb, requested: usize) -> Result<(), FatalError> {
            self.invocations.set(self.invocations.get() + 1);
            pcb.make_room_in_nursery(requested)
        }
    }

    #[test]
    pub fn test_checked_alloc_invokes_collector_on_exhaustion() {
        let invocations = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut pcb = Pcb::new(small_config()).unwrap();
        pcb.set_collector(Box::new(GrowingCollector {
            invocations: invocations.clone(),
        }));

        pcb.alloc_checked(4 * PAGE_SIZE).unwrap();
        assert_eq!(invocations.get(), 0);
        pcb.alloc_checked(WORD_SIZE).unwrap();
        assert_eq!(invocations.get(), 1);

        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_suspension_bypasses_collector() {
        let invocations = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut pcb = Pcb::new(small_config()).unwrap();
        pcb.set_collector(Box::new(GrowingCollector {
            invocations: invocations.clone(),
        }));
        pcb.set_collection_suspended(true);

        pcb.alloc_checked(4 * PAGE_SIZE).unwrap();
        pcb.alloc_checked(WORD_SIZE).unwrap();
        assert_eq!(invocations.get(), 0);
        assert_eq!(pcb.nursery().retired().len(), 1);

        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_unchecked_alloc_never_collects() {
        let mut pcb = Pcb::new(small_config()).unwrap();
        pcb.alloc_unchecked(4 * PAGE_SIZE).unwrap();
        pcb.alloc_unchecked(2 * PAGE_SIZE).unwrap();
        assert_eq!(pcb.nursery().retired().len(), 1);
        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_new_tags_heap_and_stack() {
        let pcb = Pcb::new(small_config()).unwrap();
        assert_eq!(
            pcb.table().slot_at(pcb.nursery().base()).kind(),
            PageKind::Heap
        );
        assert_eq!(
            pcb.table().slot_at(pcb.stack().base()).kind(),
            PageKind::Stack
        );
        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_release_page_parks_and_reuses() {
        let mut pcb = Pcb::new(small_config()).unwrap();
        let before = pcb.mapped_pages();

        let page = pcb.acquire_page().unwrap();
        pcb.release_page(page).unwrap();
        assert_eq!(pcb.table().slot_at(page).kind(), PageKind::Hole);

        let again = pcb.acquire_page().unwrap();
        assert_eq!(again, page);
        assert_eq!(pcb.mapped_pages(), before + 1);

        pcb.release_page(again).unwrap();
        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_code_page_tagging_and_dirt() {
        let mut pcb = Pcb::new(small_config()).unwrap();
        let code = pcb.alloc_code(2 * PAGE_SIZE, 0).unwrap();

        assert_eq!(pcb.table().slot_at(code.base()).kind(), PageKind::Code);
        assert_eq!(
            pcb.table().slot_at(code.base() + PAGE_SIZE).kind(),
            PageKind::Data
        );
        assert_eq!(
            pcb.table().slot_at(code.base() + 2 * PAGE_SIZE).kind(),
            PageKind::Data
        );

        assert!(!pcb.is_dirty(code.base()));
        pcb.set_code_reloc_vector(code, 0x42);
        assert!(pcb.is_dirty(code.base()));
        pcb.mark_pure(code.base());
        assert!(!pcb.is_dirty(code.base()));

        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_stack_overflow_freezes_and_replaces() {
        let mut pcb = Pcb::new(small_config()).unwrap();
        let old_base = pcb.stack().base();
        let room = pcb.stack().frame_pointer() - pcb.stack().redline();
        pcb.enter_frame(room).unwrap();

        // next frame crosses the redline
        let fp = pcb.enter_frame(WORD_SIZE).unwrap();

        let kont = pcb.continuations().head().unwrap();
        assert_eq!(kont.size, room);
        assert_eq!(kont.link, None);
        assert_ne!(pcb.stack().base(), old_base);
        assert_eq!(pcb.table().slot_at(old_base).kind(), PageKind::Data);
        assert_eq!(fp, pcb.stack().frame_base() - WORD_SIZE - WORD_SIZE);

        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_oversized_frame_fails_without_freezing() {
        let mut pcb = Pcb::new(small_config()).unwrap();
        let old_base = pcb.stack().base();

        let err = pcb.enter_frame(8 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, FatalError::FrameTooLarge { .. }));
        // no segment switch and no empty continuation
        assert_eq!(pcb.stack().base(), old_base);
        assert!(pcb.continuations().is_empty());

        pcb.destroy().unwrap();
    }

    #[test]
    pub fn test_tiny_nursery_still_grows() {
        let mut pcb = Pcb::new(PcbConfig {
            nursery_size: PAGE_SIZE,
            ..small_config()
        })
        .unwrap();

        pcb.alloc_unchecked(PAGE_SIZE).unwrap();
        pcb.alloc_unchecked(WORD_SIZE).unwrap();
        assert_eq!(pcb.nursery().retired().len(), 1);

        assert_eq!(pcb.destroy().unwrap(), 0);
    }

    #[test]
    pub fn test_destroy_leaves_nothing_mapped() {
        let mut pcb = Pcb::new(small_config()).unwrap();
        pcb.alloc_unchecked(4 * PAGE_SIZE).unwrap();
        pcb.alloc_unchecked(WORD_SIZE).unwrap();
        pcb.alloc_code(100, 1).unwrap();
        let page = pcb.acquire_page().unwrap();
        pcb.release_page(page).unwrap();

        assert_eq!(pcb.destroy().unwrap(), 0);
    }
}
