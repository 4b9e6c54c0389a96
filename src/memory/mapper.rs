//! Pages of memory acquired from the OS
//!
//! All memory the runtime hands to the collector flows through this
//! one wrapper over the platform mapping primitive. Freshly mapped
//! regions are filled with the uninitialised-word sentinel so the
//! collector can detect machine words that were never written.

use std::io;

use bitflags::bitflags;

use crate::error::FatalError;

/// 4K page
pub const PAGE_SHIFT: usize = 12;
/// 4K page
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Machine word size in bytes
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Every byte of a fresh mapping is set to 0xFF, so every machine
/// word reads as all-ones. The collector treats such a word as "not
/// yet initialised - do not interpret as an object".
pub const UNINITIALISED_BYTE: u8 = 0xFF;

/// Whether a word still carries the fresh-mapping sentinel.
///
/// The only sanctioned way of inspecting the sentinel; callers must
/// not compare against the magic pattern directly.
pub fn is_uninitialised(word: usize) -> bool {
    word == usize::MAX
}

/// Round a byte count up to a whole number of pages
pub fn page_round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Whether an address or size sits on a page boundary
pub fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Read the machine word at an absolute address
///
/// # Safety
/// The address must lie within a mapped, readable region.
pub unsafe fn word_at(addr: usize) -> usize {
    std::ptr::read(addr as *const usize)
}

/// Write the machine word at an absolute address
///
/// # Safety
/// The address must lie within a mapped, writable region.
pub unsafe fn set_word_at(addr: usize, value: usize) {
    std::ptr::write(addr as *mut usize, value)
}

bitflags! {
    /// Page protection bits for mapped regions
    pub struct Protection: i32 {
        const NONE = libc::PROT_NONE;
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
    }
}

impl Protection {
    /// Readable, writable and executable - the default for runtime
    /// memory, which may hold machine code
    pub fn all_access() -> Self {
        Protection::READ | Protection::WRITE | Protection::EXEC
    }

    /// Readable and writable
    pub fn read_write() -> Self {
        Protection::READ | Protection::WRITE
    }
}

/// Wrapper over the OS mapping primitive, carrying the count of pages
/// currently mapped so teardown can verify nothing leaks.
#[derive(Debug, Default)]
pub struct PageMapper {
    /// Pages currently mapped and not yet unmapped
    mapped_pages: usize,
}

impl PageMapper {
    pub fn new() -> Self {
        PageMapper::default()
    }

    /// Map `size` bytes of fresh page-aligned memory, filled with the
    /// uninitialised sentinel.
    ///
    /// `size` must already be a whole number of pages; anything else
    /// is a programming error in the caller.
    pub fn map(&mut self, size: usize) -> Result<usize, FatalError> {
        debug_assert!(is_page_aligned(size) && size > 0);

        let mem = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                Protection::all_access().bits(),
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(FatalError::MapFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }

        unsafe {
            std::ptr::write_bytes(mem as *mut u8, UNINITIALISED_BYTE, size);
        }
        self.mapped_pages += size >> PAGE_SHIFT;
        Ok(mem as usize)
    }

    /// Exactly reverse a prior `map` (or release a page-sized slice
    /// of one - the teardown path releases regions page by page).
    pub fn unmap(&mut self, base: usize, size: usize) -> Result<(), FatalError> {
        debug_assert!(is_page_aligned(base));
        debug_assert!(is_page_aligned(size) && size > 0);

        let err = unsafe { libc::munmap(base as *mut libc::c_void, size) };
        if err != 0 {
            return Err(FatalError::UnmapFailed {
                base,
                size,
                source: io::Error::last_os_error(),
            });
        }
        self.mapped_pages -= size >> PAGE_SHIFT;
        Ok(())
    }

    /// Change the protection of a page-aligned range
    pub fn protect(
        &self,
        base: usize,
        size: usize,
        protection: Protection,
    ) -> Result<(), FatalError> {
        debug_assert!(is_page_aligned(base));
        debug_assert!(is_page_aligned(size));

        let err = unsafe { libc::mprotect(base as *mut libc::c_void, size, protection.bits()) };
        if err != 0 {
            return Err(FatalError::ProtectFailed {
                base,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Pages currently mapped
    pub fn mapped_pages(&self) -> usize {
        self.mapped_pages
    }

    /// Bytes currently mapped
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_pages << PAGE_SHIFT
    }
}
