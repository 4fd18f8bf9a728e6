//! Page ownership and the host mapping primitive.

use std::io;

use crate::{LoaderError, PAGE_SIZE, Result};

/// Record of one lazily materialized page.
///
/// Created exactly once per page on first fault and released exactly once at
/// teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRecord {
    /// Page-aligned virtual base address.
    pub addr: u32,
    /// Allocation sequence number, starting at 0.
    pub seq: u64,
}

/// Host primitive for placing and removing one page at a fixed address.
///
/// Production code uses [`MmapMapper`]; tests substitute a heap-backed mock
/// so the fault resolver can be driven by direct invocation.
pub trait PageMapper {
    /// Map one anonymous, zero-initialized, read-write-execute page at
    /// exactly `addr`.
    ///
    /// # Errors
    ///
    /// Any failure to place the page at `addr`.
    fn map_page(&mut self, addr: u32) -> io::Result<*mut u8>;

    /// Unmap the page previously mapped at `addr`.
    ///
    /// # Errors
    ///
    /// The underlying unmap failure, surfaced so the caller can log it.
    fn unmap_page(&mut self, addr: u32) -> io::Result<()>;
}

/// `mmap`/`munmap`-backed production mapper.
#[derive(Debug, Default)]
pub struct MmapMapper;

impl PageMapper for MmapMapper {
    fn map_page(&mut self, addr: u32) -> io::Result<*mut u8> {
        // MAP_FIXED_NOREPLACE honors the image's own address-space layout
        // and refuses to clobber an existing mapping; a page that is already
        // resident with RWX permissions cannot legally fault again.
        // SAFETY: an anonymous fixed-address mapping aliases no Rust object;
        // the kernel either places it or fails.
        let page = unsafe {
            libc::mmap(
                addr as usize as *mut libc::c_void,
                PAGE_SIZE as usize,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if page as usize != addr as usize {
            // Kernels without MAP_FIXED_NOREPLACE fall back to hint
            // semantics; a page at any other address is useless to the image.
            // SAFETY: `page` is the mapping the call above just created.
            unsafe { libc::munmap(page, PAGE_SIZE as usize) };
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "kernel placed the page at a different address",
            ));
        }
        Ok(page.cast())
    }

    fn unmap_page(&mut self, addr: u32) -> io::Result<()> {
        // SAFETY: `addr` is the page-aligned base of a mapping created by
        // `map_page`; the allocator releases each address exactly once.
        if unsafe { libc::munmap(addr as usize as *mut libc::c_void, PAGE_SIZE as usize) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Exclusive owner of every page the loader has materialized.
///
/// Records are append-only; no other component may unmap or reuse a page
/// address once granted.
#[derive(Debug)]
pub struct PageAllocator<M: PageMapper> {
    mapper: M,
    records: Vec<PageRecord>,
}

impl<M: PageMapper> PageAllocator<M> {
    /// Create an allocator around `mapper`, reserving room for `capacity`
    /// records up front so the fault handler never grows the vector.
    #[must_use]
    pub fn new(mapper: M, capacity: usize) -> Self {
        Self {
            mapper,
            records: Vec::with_capacity(capacity),
        }
    }

    /// Map one zeroed RWX page at exactly `page_addr` and record it.
    ///
    /// The caller guarantees `page_addr` is page-aligned and not yet mapped.
    /// A mapped RWX page cannot fault again, so a duplicate request for the
    /// same address is a caller bug, not a condition this allocator detects.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the host refuses the mapping.
    pub fn allocate_at(&mut self, page_addr: u32) -> Result<*mut u8> {
        debug_assert_eq!(page_addr % PAGE_SIZE, 0);
        let page = self.mapper.map_page(page_addr).map_err(|err| {
            log::error!("page mapping at {page_addr:#010x} failed: {err}");
            LoaderError::OutOfMemory { addr: page_addr }
        })?;
        let seq = self.records.len() as u64;
        self.records.push(PageRecord { addr: page_addr, seq });
        Ok(page)
    }

    /// Number of pages allocated so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.records.len()
    }

    /// All allocation records, in allocation order.
    #[must_use]
    pub fn records(&self) -> &[PageRecord] {
        &self.records
    }

    /// Unmap every owned page exactly once, best effort.
    ///
    /// An individual unmap failure is logged and does not abort the
    /// remaining releases.
    pub fn release_all(&mut self) {
        for record in self.records.drain(..) {
            if let Err(err) = self.mapper.unmap_page(record.addr) {
                log::warn!(
                    "release of page {:#010x} (seq {}) failed: {err}",
                    record.addr,
                    record.seq
                );
            }
        }
    }
}
