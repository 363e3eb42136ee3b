//! Tests exercising the mapping lifecycle against real pages.

use super::*;
use page_util::PAGE_SIZE;

/// Reserves a free page-aligned address range and releases it again, so the
/// segment under test can claim it with `MAP_FIXED_NOREPLACE`.
fn probe_address(size: usize) -> usize {
    unsafe {
        let addr = libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(addr, libc::MAP_FAILED);
        libc::munmap(addr, size);
        addr as usize
    }
}

fn bss_segment(size: usize) -> MemorySegment {
    let base = probe_address(page_util::align_up(size));
    MemorySegment::new(
        SegmentSource {
            file_addr: 0,
            offset: 0,
            size: 0,
        },
        base,
        0,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        false,
    )
}

#[test]
fn map_zeroes_bss() {
    let mut segment = bss_segment(PAGE_SIZE);
    segment.map().unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(segment.target.address() as *const u8, PAGE_SIZE) };
    assert!(bytes.iter().all(|&byte| byte == 0));
    segment.unmap();
}

#[test]
fn map_copies_source_bytes() {
    let content = [0xabu8; 64];
    let base = probe_address(PAGE_SIZE);
    let mut segment = MemorySegment::new(
        SegmentSource {
            file_addr: content.as_ptr() as usize,
            offset: 0,
            size: content.len(),
        },
        base,
        0,
        content.len(),
        libc::PROT_READ,
        false,
    );
    segment.map().unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(segment.target.address() as *const u8, 64) };
    assert_eq!(bytes, &content[..]);
    segment.unmap();
}

#[test]
fn compose_writes_show_up_in_live_mapping() {
    let mut segment = bss_segment(PAGE_SIZE);
    segment.map().unwrap();
    segment.finalize().unwrap();

    let buffer = segment.compose_pointer(segment.target.address() + 17).unwrap();
    unsafe { *(buffer as *mut u8) = 0x42 };
    let live = unsafe { *((segment.target.address() + 17) as *const u8) };
    assert_eq!(live, 0x42);
    segment.unmap();
}

#[test]
fn relro_finalize_is_read_only() {
    let base = probe_address(PAGE_SIZE);
    let mut segment = MemorySegment::new(
        SegmentSource {
            file_addr: 0,
            offset: 0,
            size: 0,
        },
        base,
        0,
        PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        true,
    );
    segment.map().unwrap();
    segment.finalize().unwrap();
    assert_eq!(segment.target.effective_protection, libc::PROT_READ);
    // The declared protection is unchanged; only the effective one dropped.
    assert!(segment.target.writable());
    segment.unmap();
}

#[test]
fn disable_enable_roundtrip() {
    let mut segment = bss_segment(PAGE_SIZE);
    segment.map().unwrap();
    segment.finalize().unwrap();

    segment.disable().unwrap();
    assert_eq!(segment.target.status, SegmentStatus::Inactive);
    assert_eq!(segment.target.effective_protection, libc::PROT_NONE);

    segment.enable().unwrap();
    assert_eq!(segment.target.status, SegmentStatus::Mapped);
    assert_eq!(segment.target.effective_protection, segment.target.protection);
    segment.unmap();
}

#[test]
fn page_geometry() {
    let segment = MemorySegment::new(
        SegmentSource {
            file_addr: 0,
            offset: 0,
            size: 0,
        },
        0x40_0000,
        0x123,
        0x100,
        libc::PROT_READ,
        false,
    );
    assert_eq!(segment.target.address(), 0x40_0123);
    assert_eq!(segment.target.page_start(), 0x40_0000);
    assert_eq!(segment.target.page_size(), PAGE_SIZE);
    assert_eq!(segment.target.page_end(), 0x40_1000);
    assert!(segment.target.contains(0x40_0123));
    assert!(segment.target.contains(0x40_0222));
    assert!(!segment.target.contains(0x40_0223));
}

#[test]
fn inherited_fd_shares_pages() {
    let mut first = bss_segment(PAGE_SIZE);
    first.map().unwrap();
    unsafe { *(first.target.address() as *mut u64) = 0xdead_beef };

    let base = probe_address(PAGE_SIZE);
    let mut second = MemorySegment::new(
        SegmentSource {
            file_addr: 0,
            offset: 0,
            size: 0,
        },
        base,
        0,
        PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        false,
    );
    second.inherit_fd(first.shmemdup());
    second.map().unwrap();

    // Both versions see the same data pages.
    assert_eq!(unsafe { *(second.target.address() as *const u64) }, 0xdead_beef);
    unsafe { *(second.target.address() as *mut u64) = 7 };
    assert_eq!(unsafe { *(first.target.address() as *const u64) }, 7);

    second.unmap();
    first.unmap();
}
