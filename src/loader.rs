//! The fault-driven core: resolving a faulting address to one freshly
//! populated page, and the launcher that runs an image end to end.

use std::path::Path;

use crate::image::ImageReader;
use crate::pages::{MmapMapper, PageAllocator, PageMapper};
use crate::segments::{PT_LOAD, SegmentDescriptor, SegmentTable};
use crate::{PAGE_SIZE, Result, trap};

/// Counters reported after the target returns.
///
/// Mutated only by the fault resolver; purely observational.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoaderStats {
    /// Page faults delivered to the resolver.
    pub faults: u64,
    /// Pages materialized.
    pub allocations: u64,
    /// Bytes wasted in the final partial page of each faulted segment.
    pub fragmentation_bytes: u64,
}

/// One loaded image: validated reader, segment table, page ownership, and
/// counters.
///
/// All loader state lives here, so independent sessions can coexist in tests
/// and the resolver needs no process-wide fixtures. The only global is the
/// trap slot in [`trap`], which the signal action needs to reach the active
/// session.
#[derive(Debug)]
pub struct LoaderSession<M: PageMapper> {
    image: ImageReader,
    table: SegmentTable,
    allocator: PageAllocator<M>,
    stats: LoaderStats,
}

impl<M: PageMapper> LoaderSession<M> {
    /// Open and validate the image at `path`, decode its program headers,
    /// and wrap them in a session that places pages through `mapper`.
    ///
    /// Nothing is mapped yet; the first page appears on the first fault.
    ///
    /// # Errors
    ///
    /// `Io` or `InvalidFormat` from opening and validating the image.
    pub fn new(path: &Path, mapper: M) -> Result<Self> {
        let mut image = ImageReader::open(path)?;
        let header = *image.header();
        let table = SegmentTable::load(&header, &mut image)?;

        // One record slot per page of every LOAD segment, reserved now: the
        // fault handler must never grow the vector.
        let capacity = table
            .entries()
            .iter()
            .filter(|segment| segment.kind == PT_LOAD)
            .map(|segment| segment.page_count() as usize)
            .sum();

        Ok(Self {
            image,
            table,
            allocator: PageAllocator::new(mapper, capacity),
            stats: LoaderStats::default(),
        })
    }

    /// Resolve one page fault at `fault_addr`.
    ///
    /// Attributes the address to a LOAD segment, maps exactly one RWX page
    /// at the address the image laid out for itself, and populates it with
    /// the segment's file bytes. Bytes past the segment's file-backed size
    /// keep the zero fill the mapping provides.
    ///
    /// # Errors
    ///
    /// `NoSegment` for an address outside every LOAD segment, `OutOfMemory`
    /// if the page cannot be placed, `Io` if reading the file fails. All are
    /// fatal to the target: resuming would re-execute the faulting access.
    pub fn handle_fault(&mut self, fault_addr: u32) -> Result<()> {
        self.stats.faults += 1;

        let segment = *self.table.find_segment(fault_addr)?;
        let num_pages = segment.page_count();
        let page_index = page_index_of(fault_addr - segment.vaddr);

        // Final page of the segment: count its unused tail. A resident RWX
        // page never faults again, so this is added at most once per segment.
        if page_index + 1 == num_pages {
            self.stats.fragmentation_bytes +=
                u64::from(num_pages) * u64::from(PAGE_SIZE) - u64::from(segment.mem_size);
        }

        self.stats.allocations += 1;
        let page_addr = align_down(segment.vaddr) + page_index * PAGE_SIZE;
        let page = self.allocator.allocate_at(page_addr)?;
        log::trace!(
            "fault {:#010x} -> segment {:#010x} page {page_index} mapped at {page_addr:#010x}",
            fault_addr,
            segment.vaddr,
        );

        self.populate(page, &segment, page_index)
    }

    /// Copy the file bytes backing page `page_index` of `segment` into the
    /// freshly mapped `page`.
    ///
    /// The read is clamped to the segment's `file_size`: the zero-implied
    /// tail of a segment whose memory size exceeds its file size stays
    /// zero-filled instead of being overwritten with adjacent file content.
    fn populate(&mut self, page: *mut u8, segment: &SegmentDescriptor, page_index: u32) -> Result<()> {
        let page_start = u64::from(page_index) * u64::from(PAGE_SIZE);
        let file_size = u64::from(segment.file_size);
        if page_start >= file_size {
            // Entirely zero-implied; the mapping is already zeroed.
            return Ok(());
        }

        let len = usize::try_from(u64::min(file_size - page_start, u64::from(PAGE_SIZE))).unwrap();
        // SAFETY: `page` is the base of a freshly mapped writable page of
        // PAGE_SIZE bytes owned by this session's allocator; len <= PAGE_SIZE.
        let dst = unsafe { core::slice::from_raw_parts_mut(page, len) };
        let read = self
            .image
            .read_up_to(u64::from(segment.offset) + page_start, dst)?;
        if read < len {
            log::trace!("file ended {} bytes into the page; remainder stays zero", read);
        }
        Ok(())
    }

    /// Counters accumulated so far.
    #[must_use]
    pub const fn stats(&self) -> &LoaderStats {
        &self.stats
    }

    /// Entry-point virtual address of the image.
    #[must_use]
    pub const fn entry(&self) -> u32 {
        self.image.header().entry
    }

    /// Pages allocated so far.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.allocator.allocated()
    }

    /// Release every page this session ever granted.
    pub fn release_all(&mut self) {
        self.allocator.release_all();
    }
}

/// Report produced by [`run_program`].
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    /// Value the target's entry point returned.
    pub exit_value: i32,
    /// Fault, allocation, and fragmentation counters.
    pub stats: LoaderStats,
}

/// Validate the image at `path`, arm the fault trap, run the image's entry
/// point, then release every page and report.
///
/// The entry point is invoked with the C calling convention and its `i32`
/// return value captured. Any fault the resolver cannot service terminates
/// the process from the trap glue with a descriptive cause; control does not
/// come back here in that case.
///
/// # Errors
///
/// Any validation or I/O error raised before control transfers, or
/// `AlreadyActive` if a session already ran in this process.
pub fn run_program(path: &Path) -> Result<RunReport> {
    let session = LoaderSession::new(path, MmapMapper)?;
    let entry = session.entry();
    trap::install(session)?;

    let entry_ptr = entry as usize as *const ();
    // SAFETY: the image declared `entry` as its entry point, and the armed
    // trap materializes each page of its LOAD segments on first touch. The
    // jump itself is the first such touch.
    let start = unsafe { core::mem::transmute::<*const (), extern "C" fn() -> i32>(entry_ptr) };
    let exit_value = start();

    let mut session = trap::take().expect("loader session missing after the target returned");
    session.release_all();

    Ok(RunReport {
        exit_value,
        stats: *session.stats(),
    })
}

/// Zero-based index, within a segment, of the page containing byte `offset`.
///
/// An offset that is an exact multiple of `PAGE_SIZE` belongs to the page
/// that starts there, not the one before it: offset 8191 is in page 1,
/// offset 8192 opens page 2.
#[must_use]
#[inline]
#[expect(clippy::cast_possible_truncation, reason = "index <= offset / PAGE_SIZE")]
pub const fn page_index_of(offset: u32) -> u32 {
    ((offset as u64 + 1).div_ceil(PAGE_SIZE as u64) - 1) as u32
}

/// Round `addr` down to its page base.
#[must_use]
#[inline]
pub const fn align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}
