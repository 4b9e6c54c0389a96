//! Code objects
//!
//! A code object is a page-aligned region holding a fixed word header
//! followed by machine code. Only the first page is tagged as code in
//! the segment vector; the collector scans code pages for the header
//! and follows the relocation vector from there, so the remaining
//! pages can stay opaque data.

use super::mapper::{self, WORD_SIZE};

/// Words in a code object header: tag, code size, free-variable
/// count, relocation vector, annotation, one word of padding keeping
/// the body double-word aligned.
pub const CODE_HEADER_WORDS: usize = 6;

/// Header size in bytes
pub const CODE_HEADER_BYTES: usize = CODE_HEADER_WORDS * WORD_SIZE;

/// First header word of every code object
pub const CODE_TAG: usize = 0x2F;

const TAG_OFFSET: usize = 0;
const SIZE_OFFSET: usize = WORD_SIZE;
const FREEVARS_OFFSET: usize = 2 * WORD_SIZE;
const RELOC_OFFSET: usize = 3 * WORD_SIZE;
const ANNOTATION_OFFSET: usize = 4 * WORD_SIZE;

/// Bytes of mapping a code object with `code_size` bytes of machine
/// code needs
pub fn memory_required(code_size: usize) -> usize {
    mapper::page_round_up(CODE_HEADER_BYTES + code_size)
}

/// A view over a mapped code object. Holds only the base address;
/// the context owns the pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRef {
    base: usize,
}

impl CodeRef {
    /// Initialise a header over a freshly mapped, zeroed region and
    /// return the view.
    ///
    /// # Safety
    /// [base, base + memory_required(code_size)) must be mapped and
    /// writable.
    pub unsafe fn init(base: usize, code_size: usize, freevars: usize) -> Self {
        debug_assert!(mapper::is_page_aligned(base));
        mapper::set_word_at(base + TAG_OFFSET, CODE_TAG);
        mapper::set_word_at(base + SIZE_OFFSET, code_size);
        mapper::set_word_at(base + FREEVARS_OFFSET, freevars);
        mapper::set_word_at(base + RELOC_OFFSET, 0);
        mapper::set_word_at(base + ANNOTATION_OFFSET, 0);
        CodeRef { base }
    }

    /// View an already initialised code object
    ///
    /// # Safety
    /// `base` must point at a header previously written by `init`.
    pub unsafe fn at(base: usize) -> Self {
        debug_assert_eq!(mapper::word_at(base + TAG_OFFSET), CODE_TAG);
        CodeRef { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Address of the first machine-code byte
    pub fn body(&self) -> usize {
        self.base + CODE_HEADER_BYTES
    }

    /// # Safety
    /// The object's pages must still be mapped.
    pub unsafe fn code_size(&self) -> usize {
        mapper::word_at(self.base + SIZE_OFFSET)
    }

    /// # Safety
    /// The object's pages must still be mapped.
    pub unsafe fn freevars(&self) -> usize {
        mapper::word_at(self.base + FREEVARS_OFFSET)
    }

    /// # Safety
    /// The object's pages must still be mapped.
    pub unsafe fn reloc_vector(&self) -> usize {
        mapper::word_at(self.base + RELOC_OFFSET)
    }

    /// # Safety
    /// The object's pages must still be mapped.
    pub unsafe fn annotation(&self) -> usize {
        mapper::word_at(self.base + ANNOTATION_OFFSET)
    }

    /// Store the relocation vector reference. The caller signals the
    /// write barrier; a header now refers to a younger object.
    ///
    /// # Safety
    /// The object's pages must still be mapped.
    pub unsafe fn set_reloc_vector(&self, value: usize) {
        mapper::set_word_at(self.base + RELOC_OFFSET, value)
    }

    /// Store the annotation reference. The caller signals the write
    /// barrier.
    ///
    /// # Safety
    /// The object's pages must still be mapped.
    pub unsafe fn set_annotation(&self, value: usize) {
        mapper::set_word_at(self.base + ANNOTATION_OFFSET, value)
    }
}
