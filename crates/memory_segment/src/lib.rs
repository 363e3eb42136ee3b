//! One mapped region of a loaded object.
//!
//! A [`MemorySegment`] owns a page-aligned virtual range of the process
//! address space. The pages are backed by an anonymous shared-memory file
//! (`memfd`), which makes two things possible:
//!
//! 1. A *compose buffer*: a second, always-writable mapping of the same
//!    inode at an unrelated address. Relocations and code patches are written
//!    through the buffer while the live mapping stays read-only (or
//!    read-execute); since both mappings share pages, [`finalize`] only has
//!    to adjust protections to publish.
//! 2. *Shared state across versions*: a newer version of the same object can
//!    inherit the fd of a writable segment, so both versions are physically
//!    backed by the same data pages.
//!
//! [`finalize`]: MemorySegment::finalize

use log::{debug, error, warn};

/// Mapping state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Virtual range reserved, pages not established yet.
    NotMapped,
    /// Pages are established and carry their intended protection.
    Mapped,
    /// Pages were turned `PROT_NONE` (retired version): any access faults.
    Inactive,
    /// Content was re-populated by the userfault handler after retirement.
    Reactivated,
}

/// Where the segment's initial content comes from within the object file.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSource {
    /// Address of the file bytes in memory (the whole-file mapping).
    pub file_addr: usize,
    /// Offset of this segment's content within the file.
    pub offset: usize,
    /// Number of content bytes (zero for pure BSS).
    pub size: usize,
}

/// The runtime placement of the segment.
#[derive(Debug)]
pub struct SegmentTarget {
    /// Load base of the owning object.
    pub base: usize,
    /// Virtual offset of the segment relative to `base`.
    pub offset: usize,
    /// Size of the segment in bytes (unaligned).
    pub size: usize,
    /// Protection the segment carries after relocation (`PROT_*`).
    pub protection: i32,
    /// Protection currently applied to the pages.
    pub effective_protection: i32,
    /// Shared-memory file descriptor backing the pages (-1 until mapped).
    pub fd: i32,
    /// Segment falls under `PT_GNU_RELRO` and becomes read-only on finalize.
    pub relro: bool,
    /// Current mapping status.
    pub status: SegmentStatus,
}

impl SegmentTarget {
    /// Runtime start address of the segment.
    #[inline]
    pub fn address(&self) -> usize {
        self.base + self.offset
    }

    /// Page-aligned start of the mapping.
    #[inline]
    pub fn page_start(&self) -> usize {
        page_util::align_down(self.address())
    }

    /// Page-aligned size of the mapping.
    #[inline]
    pub fn page_size(&self) -> usize {
        page_util::align_up((self.address() - self.page_start()) + self.size)
    }

    /// Page-aligned end of the mapping.
    #[inline]
    pub fn page_end(&self) -> usize {
        self.page_start() + self.page_size()
    }

    /// Whether `addr` falls into the segment's (unaligned) range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.address() && addr < self.address() + self.size
    }

    /// Whether the segment is user-writable after finalize.
    #[inline]
    pub fn writable(&self) -> bool {
        self.protection & libc::PROT_WRITE != 0
    }

    /// Whether the segment is executable after finalize.
    #[inline]
    pub fn executable(&self) -> bool {
        self.protection & libc::PROT_EXEC != 0
    }
}

/// A page-aligned mapping of one part of a loaded object.
#[derive(Debug)]
pub struct MemorySegment {
    pub source: SegmentSource,
    pub target: SegmentTarget,
    /// Address of the compose (scratch) mapping, 0 until requested.
    buffer: usize,
}

impl MemorySegment {
    /// Describes a new segment; nothing is mapped until [`map`](Self::map).
    pub fn new(source: SegmentSource, base: usize, offset: usize, size: usize, protection: i32, relro: bool) -> MemorySegment {
        MemorySegment {
            source,
            target: SegmentTarget {
                base,
                offset,
                size,
                protection,
                effective_protection: libc::PROT_NONE,
                fd: -1,
                relro,
                status: SegmentStatus::NotMapped,
            },
            buffer: 0,
        }
    }

    /// Creates the shared-memory backing file for this segment.
    fn shmemfd(&mut self) -> Result<i32, &'static str> {
        let name = b"luci-segment\0";
        let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC) };
        if fd < 0 {
            error!("creating shared memory file for segment at {:#x} failed", self.target.address());
            return Err("memfd_create failed");
        }
        if unsafe { libc::ftruncate(fd, self.target.page_size() as libc::off_t) } != 0 {
            unsafe { libc::close(fd) };
            return Err("sizing shared memory file failed");
        }
        Ok(fd)
    }

    /// Duplicates the backing fd so a newer version can share these pages.
    pub fn shmemdup(&self) -> i32 {
        if self.target.fd < 0 {
            -1
        } else {
            unsafe { libc::fcntl(self.target.fd, libc::F_DUPFD_CLOEXEC, 0) }
        }
    }

    /// Adopts a backing fd inherited from the previous version's segment.
    /// Must be called before [`map`](Self::map).
    pub fn inherit_fd(&mut self, fd: i32) {
        debug_assert_eq!(self.target.status, SegmentStatus::NotMapped);
        self.target.fd = fd;
    }

    /// Establishes the mapping at its runtime address.
    ///
    /// A fresh segment gets a new shared-memory file filled from the source
    /// bytes (or zeroes for BSS). A segment that inherited its fd maps the
    /// already-populated pages of the previous version.
    pub fn map(&mut self) -> Result<(), &'static str> {
        let inherited = self.target.fd >= 0;
        if !inherited {
            self.target.fd = self.shmemfd()?;
        }

        let addr = unsafe {
            libc::mmap(
                self.target.page_start() as *mut libc::c_void,
                self.target.page_size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE,
                self.target.fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            error!(
                "mapping {} bytes at {:#x} failed",
                self.target.page_size(),
                self.target.page_start()
            );
            return Err("mapping segment failed");
        } else if addr as usize != self.target.page_start() {
            error!(
                "requested mapping at {:#x} but got {:p}",
                self.target.page_start(),
                addr
            );
            return Err("segment mapped at wrong address");
        }

        if !inherited && self.source.size > 0 {
            debug!(
                "copy {} bytes from file offset {:#x} to {:#x}",
                self.source.size,
                self.source.offset,
                self.target.address()
            );
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (self.source.file_addr + self.source.offset) as *const u8,
                    self.target.address() as *mut u8,
                    self.source.size,
                );
            }
        }

        self.target.effective_protection = libc::PROT_READ | libc::PROT_WRITE;
        self.target.status = SegmentStatus::Mapped;
        Ok(())
    }

    /// Address of the compose buffer, creating it on first use.
    ///
    /// The buffer is a writable alias of the segment's pages at an unrelated
    /// address; writes to it are visible in the live mapping immediately
    /// (same inode), without ever flipping the live protection.
    pub fn compose(&mut self) -> usize {
        if self.buffer == 0 && self.target.fd >= 0 {
            let addr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    self.target.page_size(),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.target.fd,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                warn!(
                    "creating compose buffer for segment at {:#x} failed",
                    self.target.address()
                );
                return 0;
            }
            self.buffer = addr as usize;
        }
        self.buffer
    }

    /// Translates a live address inside this segment to the corresponding
    /// address in the compose buffer (creating the buffer if needed).
    pub fn compose_pointer(&mut self, addr: usize) -> Option<usize> {
        if !self.target.contains(addr) {
            return None;
        }
        let buffer = self.compose();
        if buffer == 0 {
            return None;
        }
        Some(buffer + (addr - self.target.page_start()))
    }

    /// Publishes the segment: applies the declared protection (read-only for
    /// RELRO) to the live mapping. The compose buffer stays writable.
    pub fn finalize(&mut self) -> Result<(), &'static str> {
        let protection = if self.target.relro {
            libc::PROT_READ
        } else {
            self.target.protection
        };
        self.mprotect(protection)?;
        self.target.effective_protection = protection;
        Ok(())
    }

    /// Turns the pages `PROT_NONE` so stale callers of a retired version
    /// fault (and can be observed via userfaultfd).
    pub fn disable(&mut self) -> Result<(), &'static str> {
        self.mprotect(libc::PROT_NONE)?;
        self.target.effective_protection = libc::PROT_NONE;
        self.target.status = SegmentStatus::Inactive;
        Ok(())
    }

    /// Re-applies the declared protection after [`disable`](Self::disable).
    pub fn enable(&mut self) -> Result<(), &'static str> {
        self.mprotect(self.target.protection)?;
        self.target.effective_protection = self.target.protection;
        self.target.status = SegmentStatus::Mapped;
        Ok(())
    }

    /// Marks the segment as repopulated by the userfault handler.
    pub fn reactivated(&mut self) {
        self.target.status = SegmentStatus::Reactivated;
    }

    /// Releases the mapping, the compose buffer and the backing fd.
    pub fn unmap(&mut self) {
        unsafe {
            if self.target.status != SegmentStatus::NotMapped
                && libc::munmap(self.target.page_start() as *mut libc::c_void, self.target.page_size()) != 0
            {
                warn!(
                    "unmapping {:#x} ({} bytes) failed",
                    self.target.page_start(),
                    self.target.page_size()
                );
            }
            if self.buffer != 0 {
                libc::munmap(self.buffer as *mut libc::c_void, self.target.page_size());
                self.buffer = 0;
            }
            if self.target.fd >= 0 {
                libc::close(self.target.fd);
                self.target.fd = -1;
            }
        }
        self.target.status = SegmentStatus::NotMapped;
    }

    fn mprotect(&self, protection: i32) -> Result<(), &'static str> {
        if unsafe {
            libc::mprotect(
                self.target.page_start() as *mut libc::c_void,
                self.target.page_size(),
                protection,
            )
        } != 0
        {
            error!(
                "protecting {} bytes at {:#x} failed",
                self.target.page_size(),
                self.target.page_start()
            );
            Err("mprotect failed")
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test;
