//! Thread-local storage engine.
//!
//! The registry owns the process-wide TLS module table and a monotonically
//! increasing generation counter; each thread owns a dynamic thread vector
//! (DTV) stored right before its thread control block.
//!
//! DTV layout (16-byte slots):
//! - `dtv[-1]` holds the allocated capacity,
//! - `dtv[0]` holds the generation this DTV was last synchronized with,
//! - `dtv[i]` for module `i` holds `{pointer, to_free}`; a null pointer
//!   means the module's block has not been materialized for this thread.
//!
//! Modules registered before the process gains control ("initial" modules)
//! live inside each thread's static TLS block at fixed negative offsets from
//! the thread pointer; modules registered later are allocated lazily on
//! first access from [`TlsRegistry::get_addr`], the hot path behind
//! `__tls_get_addr`.

use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, info};
use spin::Mutex;

/// Marker for a DTV slot whose module block is not yet materialized.
pub const TLS_UNALLOCATED: usize = 0;

/// Extra room glibc reserves in the static TLS block for late joiners.
const TLS_STATIC_SURPLUS: usize = 0x680;

/// Size reserved for the thread control block after the static TLS area.
const TCB_SIZE: usize = 0x700;

/// One 16-byte slot of a dynamic thread vector.
#[repr(C)]
#[derive(Clone, Copy)]
pub union DtvSlot {
    /// Capacity (`dtv[-1]`) or generation (`dtv[0]`).
    pub counter: usize,
    /// Module block pointer plus the raw allocation for later free.
    pub pointer: DtvPointer,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct DtvPointer {
    pub value: usize,
    pub to_free: usize,
}

/// Minimal thread control block, laid out like the host ABI expects
/// (`%fs:0` is a self pointer, the DTV pointer sits at offset 8, the stack
/// guard at 0x28).
#[repr(C)]
pub struct ThreadControlBlock {
    pub tcb: usize,
    pub dtv: *mut DtvSlot,
    pub self_ptr: usize,
    pub multiple_threads: i32,
    pub gscope_flag: i32,
    pub sysinfo: usize,
    pub stack_guard: u64,
    pub pointer_guard: u64,
    /// Start of the allocation containing static TLS block and this struct.
    pub map_base: usize,
    /// Size of that allocation.
    pub map_size: usize,
}

/// One registered TLS module.
#[derive(Debug)]
struct TlsModule {
    /// Opaque tag identifying the owning object file.
    tag: usize,
    /// Size of the module's TLS block.
    size: usize,
    /// Alignment of the block.
    align: usize,
    /// Current initialization image (address, refreshed on updates).
    image: AtomicUsize,
    /// Size of the initialization image (the rest is zero-filled).
    image_size: usize,
    /// Distance of the block below the thread pointer (initial modules only).
    static_offset: usize,
}

#[derive(Default)]
struct RegistryInner {
    modules: Vec<TlsModule>,
    /// Modules in the initial (static) TLS block.
    initial_count: usize,
    initial_size: usize,
    initial_align: usize,
}

/// The process-wide TLS module registry.
pub struct TlsRegistry {
    inner: Mutex<RegistryInner>,
    /// Bumped on every module registration; drives per-thread DTV catch-up.
    generation: AtomicUsize,
}

impl TlsRegistry {
    pub const fn new() -> TlsRegistry {
        TlsRegistry {
            inner: Mutex::new(RegistryInner {
                modules: Vec::new(),
                initial_count: 0,
                initial_size: 0,
                initial_align: 1,
            }),
            generation: AtomicUsize::new(0),
        }
    }

    /// Current generation.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> usize {
        self.inner.lock().modules.len()
    }

    /// Registers a TLS module and returns `(module_id, tp_offset)`.
    ///
    /// With `pre_execution` set the module is placed in the initial TLS
    /// block and `tp_offset` is its fixed (negative) offset from the thread
    /// pointer; otherwise the block is allocated lazily per thread and the
    /// offset is 0.
    pub fn add_module(
        &self,
        tag: usize,
        size: usize,
        align: usize,
        image: usize,
        image_size: usize,
        pre_execution: bool,
    ) -> (usize, i64) {
        debug_assert!(size >= image_size);
        let mut inner = self.inner.lock();
        let align = align.max(1);

        let mut static_offset = 0;
        let mut tp_offset = 0i64;
        if pre_execution {
            // x86_64 TLS variant II: blocks grow downwards from the thread
            // pointer; the offset must satisfy the block's alignment.
            let distance = page_util::align_up_to(inner.initial_size + size, align);
            inner.initial_size = distance;
            if align > inner.initial_align {
                inner.initial_align = align;
            }
            inner.initial_count += 1;
            static_offset = distance;
            tp_offset = -(distance as i64);
        }

        inner.modules.push(TlsModule {
            tag,
            size,
            align,
            image: AtomicUsize::new(image),
            image_size,
            static_offset,
        });
        let module_id = inner.modules.len();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "registered TLS module {} ({} bytes, align {}, generation {})",
            module_id, size, align, generation
        );
        (module_id, tp_offset)
    }

    /// Points the module's initialization image at a new version's data and
    /// bumps the generation. Threads that already materialized the block
    /// are unaffected; threads created from now on see the new initializer.
    pub fn set_image(&self, module_id: usize, image: usize) {
        let inner = self.inner.lock();
        if let Some(module) = inner.modules.get(module_id - 1) {
            module.image.store(image, Ordering::Release);
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// The object tag a module was registered for.
    pub fn module_tag(&self, module_id: usize) -> Option<usize> {
        self.inner.lock().modules.get(module_id - 1).map(|m| m.tag)
    }

    /// Allocates the static TLS block plus thread control block for a new
    /// thread and its initial DTV. With `set_fs` the thread pointer register
    /// is switched over as well (main thread only).
    pub fn allocate_thread(&self, set_fs: bool) -> *mut ThreadControlBlock {
        let (initial_size, initial_align) = {
            let inner = self.inner.lock();
            (
                inner.initial_size + TLS_STATIC_SURPLUS,
                inner.initial_align.max(64),
            )
        };
        let map_size = initial_size + TCB_SIZE + initial_align;
        let base = unsafe { libc::calloc(1, map_size) } as usize;
        assert!(base != 0, "allocating static TLS block failed");

        let tcb_addr = page_util::align_up_to(base + initial_size, initial_align);
        let tcb = tcb_addr as *mut ThreadControlBlock;
        unsafe {
            (*tcb).tcb = tcb_addr;
            (*tcb).self_ptr = tcb_addr;
            (*tcb).dtv = core::ptr::null_mut();
            (*tcb).map_base = base;
            (*tcb).map_size = map_size;
            self.dtv_allocate(tcb);
        }

        if set_fs {
            let result = unsafe { libc::syscall(libc::SYS_arch_prctl, 0x1002usize, tcb_addr) };
            if result == 0 {
                info!("switched thread pointer to {:#x}", tcb_addr);
            } else {
                error!("switching thread pointer to {:#x} failed", tcb_addr);
            }
        }
        tcb
    }

    /// (Re)allocates the thread's DTV with room for
    /// `max(2 * modules, 16)` modules. Returns the new capacity.
    ///
    /// # Safety
    /// `tcb` must point to a thread control block of the calling thread.
    pub unsafe fn dtv_allocate(&self, tcb: *mut ThreadControlBlock) -> usize {
        let new_capacity = (self.module_count() * 2).max(16);
        let slots = new_capacity + 2; // capacity slot + generation slot
        let bytes = slots * core::mem::size_of::<DtvSlot>();

        let old = (*tcb).dtv;
        let (raw, old_capacity) = if old.is_null() {
            (libc::calloc(1, bytes) as *mut DtvSlot, 0)
        } else {
            let old_capacity = (*old.offset(-1)).counter;
            (
                libc::realloc(old.offset(-1) as *mut libc::c_void, bytes) as *mut DtvSlot,
                old_capacity,
            )
        };
        if raw.is_null() {
            return 0;
        }

        let dtv = raw.add(1);
        (*raw).counter = new_capacity;
        for index in (old_capacity + 1)..=new_capacity {
            (*dtv.add(index)).pointer = DtvPointer {
                value: TLS_UNALLOCATED,
                to_free: 0,
            };
        }
        (*tcb).dtv = dtv;
        new_capacity
    }

    /// Copies every initial module's image into the thread's static block
    /// and publishes the pointers in the DTV.
    ///
    /// # Safety
    /// `tcb` must come from [`allocate_thread`](Self::allocate_thread) and
    /// must not yet be set up.
    pub unsafe fn dtv_setup(&self, tcb: *mut ThreadControlBlock) {
        if self.generation.load(Ordering::Acquire) == 0 {
            self.generation.store(1, Ordering::Release);
        }
        let inner = self.inner.lock();
        let tp = tcb as usize;
        let dtv = (*tcb).dtv;
        assert!(!dtv.is_null());
        assert!((*dtv.offset(-1)).counter >= inner.initial_count);

        for module_id in 1..=inner.initial_count {
            let module = &inner.modules[module_id - 1];
            let addr = tp - module.static_offset;
            debug_assert!(addr % module.align == 0);
            Self::copy_image(module, addr);
            (*dtv.add(module_id)).pointer = DtvPointer {
                value: addr,
                to_free: 0,
            };
        }
        (*dtv).counter = self.generation.load(Ordering::Acquire);
    }

    unsafe fn copy_image(module: &TlsModule, dest: usize) {
        let image = module.image.load(Ordering::Acquire);
        if module.image_size > 0 && image != 0 {
            core::ptr::copy_nonoverlapping(image as *const u8, dest as *mut u8, module.image_size);
        }
        if module.size > module.image_size {
            core::ptr::write_bytes(
                (dest + module.image_size) as *mut u8,
                0,
                module.size - module.image_size,
            );
        }
    }

    /// Base address of a module's TLS block for the given thread, the hot
    /// path of `__tls_get_addr`.
    ///
    /// Performs generation catch-up (growing the DTV if modules appeared)
    /// and, when `alloc` is set, materializes the block on first access.
    /// Without `alloc`, returns 0 for unallocated dynamic modules.
    ///
    /// # Safety
    /// `tcb` must be the calling thread's control block.
    pub unsafe fn get_addr(&self, tcb: *mut ThreadControlBlock, module_id: usize, alloc: bool) -> usize {
        let dtv = (*tcb).dtv;
        if !alloc {
            if dtv.is_null() || module_id > (*dtv.offset(-1)).counter {
                return 0;
            }
            return (*dtv.add(module_id)).pointer.value;
        }

        // Catch up with module registrations since the last access.
        let generation = self.generation.load(Ordering::Acquire);
        if (*dtv).counter != generation {
            debug_assert!((*dtv).counter < generation);
            if ((*(*tcb).dtv.offset(-1)).counter) < self.module_count()
                && self.dtv_allocate(tcb) == 0
            {
                error!("increasing DTV capacity of thread {:#x} failed", tcb as usize);
                panic!("DTV reallocation failed");
            }
            let dtv = (*tcb).dtv;
            (*dtv).counter = generation;
        }
        let dtv = (*tcb).dtv;

        assert!(module_id <= (*dtv.offset(-1)).counter);
        if (*dtv.add(module_id)).pointer.value == TLS_UNALLOCATED {
            // Registry access only on the (cold) allocation path; the DTV
            // itself is only ever written by its owning thread.
            let inner = self.inner.lock();
            assert!(module_id > inner.initial_count && module_id <= inner.modules.len());
            let module = &inner.modules[module_id - 1];

            // Lazy allocation: keep the raw pointer in the word below the
            // aligned data address so free can find it again.
            let raw = libc::malloc(module.size + module.align + core::mem::size_of::<usize>()) as usize;
            assert!(raw != 0, "allocating TLS block failed");
            let data = page_util::align_up_to(raw + core::mem::size_of::<usize>(), module.align);
            *((data - core::mem::size_of::<usize>()) as *mut usize) = raw;
            Self::copy_image(module, data);
            (*dtv.add(module_id)).pointer = DtvPointer {
                value: data,
                to_free: 0,
            };
        }
        (*dtv.add(module_id)).pointer.value
    }

    /// Frees every lazily-allocated block, the DTV backing storage and,
    /// if requested, the thread's static TLS + control block allocation.
    ///
    /// # Safety
    /// `tcb` must not be used afterwards when `free_thread_struct` is set.
    pub unsafe fn free_thread(&self, tcb: *mut ThreadControlBlock, free_thread_struct: bool) {
        let initial_count = self.inner.lock().initial_count;
        let dtv = (*tcb).dtv;
        if !dtv.is_null() {
            let capacity = (*dtv.offset(-1)).counter;
            for module_id in (initial_count + 1)..=capacity {
                let value = (*dtv.add(module_id)).pointer.value;
                if value != TLS_UNALLOCATED {
                    let raw = *((value - core::mem::size_of::<usize>()) as *const usize);
                    libc::free(raw as *mut libc::c_void);
                }
            }
            libc::free(dtv.offset(-1) as *mut libc::c_void);
            (*tcb).dtv = core::ptr::null_mut();
        }
        if free_thread_struct {
            libc::free((*tcb).map_base as *mut libc::c_void);
        }
    }
}

impl Default for TlsRegistry {
    fn default() -> Self {
        TlsRegistry::new()
    }
}

#[cfg(test)]
mod test;
