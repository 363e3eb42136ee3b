//! The lazy-binding resolver entry point.
//!
//! A PLT stub of an unresolved function pushes `(object, relocation index)`
//! and jumps into `GOT[2]`, which the loader pointed at `_dlresolve`. The
//! entry saves the complete volatile register state (callers do not expect
//! a function *call* to happen here), performs the resolution under the
//! loader's write lock, patches the GOT slot and tail-jumps into the
//! resolved function.

use core::arch::global_asm;

use object_metadata::Object;

use crate::{prepare, Loader};

/// Whether the CPU supports `xsave` (checked once at startup).
static CPU_SUPPORTS_XSAVE: core::sync::atomic::AtomicU8 = core::sync::atomic::AtomicU8::new(2);

fn cpu_supports_xsave() -> bool {
    use core::sync::atomic::Ordering;
    match CPU_SUPPORTS_XSAVE.load(Ordering::Relaxed) {
        2 => {
            let supported = unsafe { (core::arch::x86_64::__cpuid(1).ecx & (1 << 26)) != 0 };
            CPU_SUPPORTS_XSAVE.store(supported as u8, Ordering::Relaxed);
            supported
        }
        value => value != 0,
    }
}

/// Address of the assembly entry, for `GOT[2]`.
pub fn resolver_entry_address() -> usize {
    extern "C" {
        fn _dlresolve();
    }
    _dlresolve as usize
}

/// High-level resolver called from the assembly entry with the values the
/// PLT pushed. Preserves the FPU/SSE state around the lookup, since the
/// interrupted code may keep live values in vector registers.
#[no_mangle]
extern "C" fn __dlresolve(object: *const Object, index: usize) -> usize {
    #[repr(align(64))]
    struct FpuArea([u8; 4096]);
    let mut fpu = FpuArea([0; 4096]);
    let xsave = cpu_supports_xsave();
    unsafe {
        if xsave {
            core::arch::asm!(
                "xsave [{area}]",
                area = in(reg) fpu.0.as_mut_ptr(),
                in("eax") 0xffu32,
                in("edx") 0u32,
                options(nostack),
            );
        } else {
            core::arch::asm!(
                "fxsave [{area}]",
                area = in(reg) fpu.0.as_mut_ptr(),
                options(nostack),
            );
        }
    }

    // Borrow the Arc the GOT slot refers to without touching its count;
    // the version chain keeps the object alive.
    let object = unsafe { core::mem::ManuallyDrop::new(std::sync::Arc::from_raw(object)) };

    // Concurrent first calls and updates serialize here.
    let loader = Loader::instance();
    let guard = loader.update_sync.lock();
    let target = prepare::dynamic_resolve(loader, &*object, index);
    drop(guard);

    unsafe {
        if xsave {
            core::arch::asm!(
                "xrstor [{area}]",
                area = in(reg) fpu.0.as_ptr(),
                in("eax") 0xffu32,
                in("edx") 0u32,
                options(nostack),
            );
        } else {
            core::arch::asm!(
                "fxrstor [{area}]",
                area = in(reg) fpu.0.as_ptr(),
                options(nostack),
            );
        }
    }
    target
}

// The raw entry: saves every volatile general-purpose register, reads the
// two PLT arguments from the stack, calls `__dlresolve` and resumes at the
// resolved function with the original register state.
global_asm!(
    r#"
    .globl _dlresolve
    .hidden _dlresolve
    .type _dlresolve, @function
    .align 16
_dlresolve:
    .cfi_startproc
    # Two arguments (object and relocation index) were pushed by the PLT.
    .cfi_adjust_cfa_offset 16
    endbr64

    push rbp
    .cfi_adjust_cfa_offset 8
    mov rbp, rsp

    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    .cfi_adjust_cfa_offset 112

    # The PLT arguments sit right above the saved frame pointer.
    mov rdi, [rbp + 8]
    mov rsi, [rbp + 16]
    call __dlresolve
    # Stash the resolved target where the first PLT argument was.
    mov [rbp + 16], rax

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    .cfi_adjust_cfa_offset -112
    pop rbp
    .cfi_adjust_cfa_offset -8

    # Drop the second PLT argument and jump to the resolved function.
    add rsp, 8
    .cfi_adjust_cfa_offset -8
    ret
    .cfi_endproc
"#
);
