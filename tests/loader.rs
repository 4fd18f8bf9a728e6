//! Fault-resolution tests driving the resolver by direct invocation over a
//! synthetic on-disk image and a heap-backed page mapper.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::rc::Rc;

use faultload::pages::PageMapper;
use faultload::{LoaderError, LoaderSession, PAGE_SIZE};
use tempfile::NamedTempFile;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const PT_LOAD: u32 = 1;

struct SegmentSpec {
    kind: u32,
    vaddr: u32,
    data: Vec<u8>,
    mem_size: u32,
}

/// Build a minimal valid ELF32 little-endian executable image in memory.
///
/// Program headers immediately follow the file header; each segment's file
/// data is laid out sequentially after the program-header table and its
/// `p_offset`/`p_filesz` are filled in accordingly.
fn build_elf(entry: u32, segments: &[SegmentSpec]) -> Vec<u8> {
    let ph_end = EHDR_SIZE + segments.len() * PHDR_SIZE;
    let mut buf = vec![0u8; ph_end];

    buf[0] = 0x7F;
    buf[1] = b'E';
    buf[2] = b'L';
    buf[3] = b'F';
    buf[4] = 1; // ELFCLASS32
    buf[5] = 1; // ELFDATA2LSB
    buf[6] = 1; // EV_CURRENT

    // e_type @ 16 (ET_EXEC), e_machine @ 18 (EM_386)
    buf[16..18].copy_from_slice(&2u16.to_le_bytes());
    buf[18..20].copy_from_slice(&3u16.to_le_bytes());
    // e_version @ 20
    buf[20..24].copy_from_slice(&1u32.to_le_bytes());
    // e_entry @ 24
    buf[24..28].copy_from_slice(&entry.to_le_bytes());
    // e_phoff @ 28 — program headers immediately follow the ELF header
    buf[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
    // e_ehsize @ 40, e_phentsize @ 42, e_phnum @ 44
    buf[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    buf[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    buf[44..46].copy_from_slice(&(segments.len() as u16).to_le_bytes());

    let mut data_offset = ph_end as u32;
    for (i, spec) in segments.iter().enumerate() {
        let ph = EHDR_SIZE + i * PHDR_SIZE;
        buf[ph..ph + 4].copy_from_slice(&spec.kind.to_le_bytes());
        buf[ph + 4..ph + 8].copy_from_slice(&data_offset.to_le_bytes());
        buf[ph + 8..ph + 12].copy_from_slice(&spec.vaddr.to_le_bytes());
        buf[ph + 16..ph + 20].copy_from_slice(&(spec.data.len() as u32).to_le_bytes());
        buf[ph + 20..ph + 24].copy_from_slice(&spec.mem_size.to_le_bytes());
        data_offset += spec.data.len() as u32;
    }

    for spec in segments {
        buf.extend_from_slice(&spec.data);
    }
    buf
}

fn write_image(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(bytes).expect("write image");
    file.flush().expect("flush image");
    file
}

/// Heap-backed page mapper sharing its page set with the test, so page
/// contents can be inspected after the session has consumed the mapper.
#[derive(Debug, Default, Clone)]
struct SharedMapper {
    pages: Rc<RefCell<BTreeMap<u32, Box<[u8; PAGE_SIZE as usize]>>>>,
}

impl SharedMapper {
    fn page(&self, addr: u32) -> Vec<u8> {
        self.pages.borrow()[&addr].to_vec()
    }

    fn mapped_addrs(&self) -> Vec<u32> {
        self.pages.borrow().keys().copied().collect()
    }
}

impl PageMapper for SharedMapper {
    fn map_page(&mut self, addr: u32) -> io::Result<*mut u8> {
        let mut pages = self.pages.borrow_mut();
        if pages.contains_key(&addr) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let mut page = Box::new([0u8; PAGE_SIZE as usize]);
        let ptr = page.as_mut_ptr();
        pages.insert(addr, page);
        Ok(ptr)
    }

    fn unmap_page(&mut self, addr: u32) -> io::Result<()> {
        self.pages
            .borrow_mut()
            .remove(&addr)
            .map(|_| ())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

/// A segment of 3 full pages plus 10 bytes, 2 pages plus 10 bytes of which
/// are file-backed.
fn partial_page_segment(vaddr: u32) -> SegmentSpec {
    let file_size = (PAGE_SIZE * 2 + 10) as usize;
    let data: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8).collect();
    SegmentSpec {
        kind: PT_LOAD,
        vaddr,
        data,
        mem_size: PAGE_SIZE * 3 + 10,
    }
}

#[test]
fn fault_populates_exactly_one_page_with_file_bytes() {
    let vaddr = 0x0804_8000;
    let spec = partial_page_segment(vaddr);
    let expected: Vec<u8> = spec.data[..PAGE_SIZE as usize].to_vec();
    let image = write_image(&build_elf(vaddr, &[spec]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper.clone()).expect("session");

    session.handle_fault(vaddr + 5).expect("fault resolved");

    assert_eq!(mapper.mapped_addrs(), vec![vaddr]);
    assert_eq!(mapper.page(vaddr), expected);
    assert_eq!(session.stats().faults, 1);
    assert_eq!(session.stats().allocations, 1);
}

#[test]
fn second_page_gets_its_own_file_window() {
    let vaddr = 0x0804_8000;
    let spec = partial_page_segment(vaddr);
    let expected: Vec<u8> = spec.data[PAGE_SIZE as usize..2 * PAGE_SIZE as usize].to_vec();
    let image = write_image(&build_elf(vaddr, &[spec]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper.clone()).expect("session");

    session.handle_fault(vaddr + PAGE_SIZE).expect("fault resolved");

    assert_eq!(mapper.mapped_addrs(), vec![vaddr + PAGE_SIZE]);
    assert_eq!(mapper.page(vaddr + PAGE_SIZE), expected);
}

#[test]
fn zero_implied_tail_stays_zero() {
    let vaddr = 0x0804_8000;
    let spec = partial_page_segment(vaddr);
    let file_tail: Vec<u8> = spec.data[2 * PAGE_SIZE as usize..].to_vec();
    let image = write_image(&build_elf(vaddr, &[spec]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper.clone()).expect("session");

    // Page 2 is the last file-backed page: 10 bytes of file data, then zeros.
    session.handle_fault(vaddr + 2 * PAGE_SIZE + 7).expect("fault resolved");
    let page2 = mapper.page(vaddr + 2 * PAGE_SIZE);
    assert_eq!(&page2[..10], &file_tail[..]);
    assert!(page2[10..].iter().all(|&b| b == 0));

    // Page 3 is entirely zero-implied BSS.
    session.handle_fault(vaddr + 3 * PAGE_SIZE + 2).expect("fault resolved");
    assert!(mapper.page(vaddr + 3 * PAGE_SIZE).iter().all(|&b| b == 0));
}

#[test]
fn final_page_fragmentation_is_counted_once() {
    let vaddr = 0x0804_8000;
    let image = write_image(&build_elf(vaddr, &[partial_page_segment(vaddr)]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper).expect("session");

    // Offset 12290 lands in the final, partial page of the segment.
    session.handle_fault(vaddr + 12290).expect("fault resolved");
    assert_eq!(session.stats().fragmentation_bytes, u64::from(PAGE_SIZE - 10));

    // Interior pages add nothing.
    session.handle_fault(vaddr).expect("fault resolved");
    session.handle_fault(vaddr + PAGE_SIZE).expect("fault resolved");
    assert_eq!(session.stats().fragmentation_bytes, u64::from(PAGE_SIZE - 10));
}

#[test]
fn touching_k_distinct_pages_allocates_k_and_releases_all() {
    let vaddr = 0x0804_8000;
    let image = write_image(&build_elf(vaddr, &[partial_page_segment(vaddr)]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper.clone()).expect("session");

    for page in 0..4u32 {
        session.handle_fault(vaddr + page * PAGE_SIZE + 1).expect("fault resolved");
    }

    assert_eq!(session.allocated_pages(), 4);
    assert_eq!(session.stats().allocations, 4);
    assert_eq!(mapper.mapped_addrs().len(), 4);

    session.release_all();
    assert!(mapper.mapped_addrs().is_empty());
    assert_eq!(session.allocated_pages(), 0);
}

#[test]
fn fault_outside_every_segment_is_rejected_without_allocation() {
    let vaddr = 0x0804_8000;
    let image = write_image(&build_elf(vaddr, &[partial_page_segment(vaddr)]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper.clone()).expect("session");

    let result = session.handle_fault(0x500);
    assert!(matches!(result, Err(LoaderError::NoSegment { addr: 0x500 })));
    assert_eq!(session.stats().faults, 1);
    assert_eq!(session.stats().allocations, 0);
    assert!(mapper.mapped_addrs().is_empty());
}

#[test]
fn non_load_segments_never_own_a_fault() {
    let vaddr = 0x0804_8000;
    let mut note = partial_page_segment(vaddr);
    note.kind = 4; // PT_NOTE
    let image = write_image(&build_elf(vaddr, &[note]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper).expect("session");

    assert!(matches!(
        session.handle_fault(vaddr + 5),
        Err(LoaderError::NoSegment { .. })
    ));
}

#[test]
fn unaligned_segment_base_maps_at_the_page_base() {
    // p_vaddr off a page boundary: the page is placed at the aligned base
    // and filled from the segment's file window for that page index.
    let vaddr = 0x0804_8100;
    let spec = partial_page_segment(vaddr);
    let expected: Vec<u8> = spec.data[..PAGE_SIZE as usize].to_vec();
    let image = write_image(&build_elf(vaddr, &[spec]));

    let mapper = SharedMapper::default();
    let mut session = LoaderSession::new(image.path(), mapper.clone()).expect("session");

    session.handle_fault(vaddr + 3).expect("fault resolved");
    assert_eq!(mapper.mapped_addrs(), vec![0x0804_8000]);
    assert_eq!(mapper.page(0x0804_8000), expected);
}

#[test]
fn corrupted_magic_rejects_the_image_before_any_mapping() {
    let vaddr = 0x0804_8000;
    let mut bytes = build_elf(vaddr, &[partial_page_segment(vaddr)]);
    bytes[1] = b'X';
    let image = write_image(&bytes);

    let mapper = SharedMapper::default();
    let result = LoaderSession::new(image.path(), mapper.clone());
    assert!(matches!(result, Err(LoaderError::InvalidFormat(_))));
    assert!(mapper.mapped_addrs().is_empty());
}
