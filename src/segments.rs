//! Program-header decoding and fault-address attribution.

use crate::image::{ElfHeader, ImageReader};
use crate::{LoaderError, PAGE_SIZE, Result};

/// Program header type: loadable segment.
pub const PT_LOAD: u32 = 1;

/// Size of an ELF32 program header entry in bytes.
pub const PHDR_SIZE: usize = 32;

/// One decoded program-header entry, restricted to the fields the loader
/// consumes. Immutable once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Segment type (`p_type`); only [`PT_LOAD`] is meaningful here.
    pub kind: u32,
    /// File offset of the segment's backing bytes (`p_offset`).
    pub offset: u32,
    /// Virtual address the segment occupies (`p_vaddr`).
    pub vaddr: u32,
    /// Bytes backed by the file (`p_filesz`).
    pub file_size: u32,
    /// Bytes occupied in memory (`p_memsz`); may exceed `file_size`, in
    /// which case the tail is zero-implied.
    pub mem_size: u32,
}

impl SegmentDescriptor {
    /// Decode one entry from its [`PHDR_SIZE`] raw bytes.
    #[must_use]
    pub fn decode(raw: &[u8; PHDR_SIZE]) -> Self {
        let u32_at = |offset: usize| u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap());
        Self {
            kind: u32_at(0),
            offset: u32_at(4),
            vaddr: u32_at(8),
            file_size: u32_at(16),
            mem_size: u32_at(20),
        }
    }

    /// Whether `addr` falls in this segment's half-open virtual range
    /// `[vaddr, vaddr + mem_size)`.
    #[must_use]
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.vaddr && addr - self.vaddr < self.mem_size
    }

    /// Number of pages needed to cover the segment in memory.
    #[must_use]
    pub const fn page_count(&self) -> u32 {
        self.mem_size.div_ceil(PAGE_SIZE)
    }
}

/// The ordered program-header table of an image. Read-only after
/// construction.
#[derive(Debug)]
pub struct SegmentTable {
    entries: Vec<SegmentDescriptor>,
}

impl SegmentTable {
    /// Decode all `phnum` program headers of the image, in table order.
    ///
    /// Every entry is kept; filtering for [`PT_LOAD`] happens at lookup
    /// time in [`Self::find_segment`].
    ///
    /// # Errors
    ///
    /// `Io` if any entry cannot be read in full.
    pub fn load(header: &ElfHeader, reader: &mut ImageReader) -> Result<Self> {
        let mut entries = Vec::with_capacity(usize::from(header.phnum));
        for i in 0..u64::from(header.phnum) {
            let offset = u64::from(header.phoff) + i * u64::from(header.phentsize);
            let mut raw = [0u8; PHDR_SIZE];
            reader.read_at(offset, &mut raw)?;
            entries.push(SegmentDescriptor::decode(&raw));
        }
        Ok(Self { entries })
    }

    /// Build a table directly from already-decoded entries.
    #[must_use]
    pub const fn from_entries(entries: Vec<SegmentDescriptor>) -> Self {
        Self { entries }
    }

    /// All decoded entries, in table order.
    #[must_use]
    pub fn entries(&self) -> &[SegmentDescriptor] {
        &self.entries
    }

    /// Attribute a faulting address to the first [`PT_LOAD`] segment whose
    /// virtual range contains it.
    ///
    /// Table order decides ties between overlapping segments. An address
    /// outside every LOAD segment is a hard error; the loader never guesses
    /// a segment.
    ///
    /// # Errors
    ///
    /// `NoSegment` if no LOAD segment contains `fault_addr`.
    pub fn find_segment(&self, fault_addr: u32) -> Result<&SegmentDescriptor> {
        self.entries
            .iter()
            .find(|segment| segment.kind == PT_LOAD && segment.contains(fault_addr))
            .ok_or(LoaderError::NoSegment { addr: fault_addr })
    }
}
