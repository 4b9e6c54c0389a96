//! Execution stack segments and frozen continuations
//!
//! The runtime runs user code against one active stack segment at a
//! time. Frames grow downward from the segment's top; when the frame
//! pointer reaches the redline the live portion is frozen into a
//! continuation record and a fresh segment takes over. Frozen
//! continuations are plain context-owned records linked by index, not
//! heap objects.

use super::mapper::{self, PAGE_SIZE, WORD_SIZE};

/// Default stack segment size (128K). A tuning value.
pub const DEFAULT_STACK_SIZE: usize = 32 * PAGE_SIZE;

/// Word written at the very top of every fresh stack segment. A
/// return through this word means the segment has unwound completely
/// and control must resume in the continuation chain. Distinct from
/// the fresh-mapping sentinel.
pub const UNDERFLOW_MARKER: usize = usize::MAX - 1;

/// Distance kept between the base of a segment and the overflow
/// redline. With a guard page the redline sits above the protected
/// page plus two pages of margin, so the handler itself has stack to
/// run on; without one a single page of margin remains. Tuning
/// values.
fn redline_for(base: usize, guarded: bool) -> usize {
    if guarded {
        base + 3 * PAGE_SIZE
    } else {
        base + PAGE_SIZE
    }
}

/// The active stack segment
#[derive(Debug)]
pub struct ExecStack {
    /// Lowest address of the segment
    base: usize,
    /// Segment size in bytes
    size: usize,
    /// Current frame pointer; frames grow toward `base`
    frame_pointer: usize,
    /// One past the highest frame slot; the underflow marker lives in
    /// the word just below
    frame_base: usize,
    /// Crossing below this address triggers overflow handling
    redline: usize,
    /// Whether the lowest page is access-protected
    guarded: bool,
}

impl ExecStack {
    /// Adopt a freshly mapped region as the active segment: write the
    /// underflow marker into the top word and park the frame pointer
    /// on it.
    ///
    /// # Safety
    /// The region [base, base + size) must be mapped and writable
    /// (the guard page, if any, is protected after this call).
    pub unsafe fn install(base: usize, size: usize, guarded: bool) -> Self {
        debug_assert!(mapper::is_page_aligned(base));
        debug_assert!(mapper::is_page_aligned(size));
        let frame_base = base + size;
        let frame_pointer = frame_base - WORD_SIZE;
        mapper::set_word_at(frame_pointer, UNDERFLOW_MARKER);
        ExecStack {
            base,
            size,
            frame_pointer,
            frame_base,
            redline: redline_for(base, guarded),
            guarded,
        }
    }

    /// Claim `bytes` of frame space, or None when doing so would
    /// cross the redline and the segment must be frozen first.
    pub fn enter_frame(&mut self, bytes: usize) -> Option<usize> {
        debug_assert!(bytes % WORD_SIZE == 0);
        let next = self.frame_pointer.checked_sub(bytes)?;
        if next < self.redline {
            None
        } else {
            self.frame_pointer = next;
            Some(next)
        }
    }

    /// Release `bytes` of frame space. The frame pointer never moves
    /// past the underflow-marker slot.
    pub fn leave_frame(&mut self, bytes: usize) {
        debug_assert!(bytes % WORD_SIZE == 0);
        debug_assert!(self.frame_pointer + bytes <= self.frame_base - WORD_SIZE);
        self.frame_pointer += bytes;
    }

    /// Bytes of live frames above the frame pointer, excluding the
    /// underflow marker word. This is what a freeze captures.
    pub fn live_bytes(&self) -> usize {
        self.frame_base - self.frame_pointer - WORD_SIZE
    }

    /// Bytes between the base and the redline, unusable by ordinary
    /// frames
    pub fn slack(&self) -> usize {
        self.redline - self.base
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn frame_pointer(&self) -> usize {
        self.frame_pointer
    }

    pub fn frame_base(&self) -> usize {
        self.frame_base
    }

    pub fn redline(&self) -> usize {
        self.redline
    }

    pub fn guarded(&self) -> bool {
        self.guarded
    }
}

/// A frozen stack segment's live portion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    /// Address of the deepest live frame slot (the frame pointer at
    /// the moment of the freeze)
    pub top: usize,
    /// Bytes of frozen frames above `top`
    pub size: usize,
    /// Next continuation in the chain, older
    pub link: Option<usize>,
}

/// Context-owned store of frozen continuations, chained newest first
/// by index
#[derive(Debug, Default)]
pub struct ContinuationArena {
    nodes: Vec<Continuation>,
    head: Option<usize>,
}

impl ContinuationArena {
    pub fn new() -> Self {
        ContinuationArena::default()
    }

    /// Record a freeze and make it the head of the chain; returns its
    /// index.
    pub fn freeze(&mut self, top: usize, size: usize) -> usize {
        self.nodes.push(Continuation {
            top,
            size,
            link: self.head,
        });
        let index = self.nodes.len() - 1;
        self.head = Some(index);
        index
    }

    pub fn head(&self) -> Option<&Continuation> {
        self.head.map(|index| &self.nodes[index])
    }

    pub fn get(&self, index: usize) -> Option<&Continuation> {
        self.nodes.get(index)
    }

    /// Walk the chain newest to oldest
    pub fn iter(&self) -> ContinuationIter<'_> {
        ContinuationIter {
            arena: self,
            cursor: self.head,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct ContinuationIter<'a> {
    arena: &'a ContinuationArena,
    cursor: Option<usize>,
}

impl<'a> Iterator for ContinuationIter<'a> {
    type Item = &'a Continuation;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = &self.arena.nodes[index];
        self.cursor = node.link;
        Some(node)
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;
    use crate::memory::mapper::PageMapper;

    #[test]
    pub fn test_install_writes_underflow_marker() {
        let mut mapper = PageMapper::new();
        let base = mapper.map(4 * PAGE_SIZE).unwrap();
        let stack = unsafe { ExecStack::install(base, 4 * PAGE_SIZE, false) };

        assert_eq!(stack.frame_pointer(), base + 4 * PAGE_SIZE - WORD_SIZE);
        assert_eq!(
            unsafe { mapper::word_at(stack.frame_pointer()) },
            UNDERFLOW_MARKER
        );
        assert_eq!(stack.live_bytes(), 0);

        mapper.unmap(base, 4 * PAGE_SIZE).unwrap();
    }

    #[test]
    pub fn test_frames_stop_at_the_redline() {
        let mut mapper = PageMapper::new();
        let base = mapper.map(4 * PAGE_SIZE).unwrap();
        let mut stack = unsafe { ExecStack::install(base, 4 * PAGE_SIZE, false) };

        // exactly down to the redline is fine
        let room = stack.frame_pointer() - stack.redline();
        assert!(stack.enter_frame(room).is_some());
        assert_eq!(stack.frame_pointer(), stack.redline());
        // one more word is not
        assert!(stack.enter_frame(WORD_SIZE).is_none());

        stack.leave_frame(room);
        assert_eq!(stack.live_bytes(), 0);

        mapper.unmap(base, 4 * PAGE_SIZE).unwrap();
    }

    #[test]
    pub fn test_leave_frame_stops_at_the_marker() {
        let mut mapper = PageMapper::new();
        let base = mapper.map(4 * PAGE_SIZE).unwrap();
        let mut stack = unsafe { ExecStack::install(base, 4 * PAGE_SIZE, false) };

        stack.enter_frame(4 * WORD_SIZE).unwrap();
        stack.leave_frame(4 * WORD_SIZE);
        // back on the marker slot, not past it
        assert_eq!(stack.frame_pointer(), stack.frame_base() - WORD_SIZE);
        assert_eq!(
            unsafe { mapper::word_at(stack.frame_pointer()) },
            UNDERFLOW_MARKER
        );

        mapper.unmap(base, 4 * PAGE_SIZE).unwrap();
    }

    #[test]
    #[should_panic]
    pub fn test_leave_frame_past_the_marker_is_rejected() {
        let mut mapper = PageMapper::new();
        let base = mapper.map(4 * PAGE_SIZE).unwrap();
        let mut stack = unsafe { ExecStack::install(base, 4 * PAGE_SIZE, false) };

        stack.leave_frame(WORD_SIZE);

        // unreachable; keeps the mapping balanced if the assert were
        // ever compiled out
        mapper.unmap(base, 4 * PAGE_SIZE).unwrap();
    }

    #[test]
    pub fn test_guard_widens_the_slack() {
        let mut mapper = PageMapper::new();
        let base = mapper.map(8 * PAGE_SIZE).unwrap();
        let plain = unsafe { ExecStack::install(base, 4 * PAGE_SIZE, false) };
        let guarded = unsafe { ExecStack::install(base + 4 * PAGE_SIZE, 4 * PAGE_SIZE, true) };

        assert_eq!(plain.slack(), PAGE_SIZE);
        assert_eq!(guarded.slack(), 3 * PAGE_SIZE);

        mapper.unmap(base, 8 * PAGE_SIZE).unwrap();
    }

    #[test]
    pub fn test_arena_chains_newest_first() {
        let mut arena = ContinuationArena::new();
        let first = arena.freeze(0x1000, 64);
        let second = arena.freeze(0x2000, 128);

        assert_eq!(arena.head().unwrap().top, 0x2000);
        assert_eq!(arena.get(second).unwrap().link, Some(first));

        let tops: Vec<_> = arena.iter().map(|k| k.top).collect();
        assert_eq!(tops, vec![0x2000, 0x1000]);
    }
}
