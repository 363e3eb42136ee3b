//! Process bring-up: TLS bootstrap, initial stack construction, and the
//! transfer of control to the loaded program.

use std::ffi::CString;
use std::sync::atomic::Ordering;

use log::{debug, error, info};
use object_metadata::{IdentityRef, ObjectFlags, ObjectKind};
use page_util::PAGE_SIZE;

use crate::{prepare, Loader};

/// Auxiliary vector types placed on the initial stack.
const AT_NULL: usize = 0;
const AT_PHDR: usize = 3;
const AT_PHENT: usize = 4;
const AT_PHNUM: usize = 5;
const AT_PAGESZ: usize = 6;
const AT_ENTRY: usize = 9;
const AT_RANDOM: usize = 25;
const AT_SECURE: usize = 23;

const STACK_SIZE: usize = 8 << 20;

/// Prepares all loaded objects for execution: TLS setup for the main
/// thread, relocation of every object, and the initializer pass.
pub fn prepare_execution(loader: &'static Loader, target: &IdentityRef) -> Result<(), &'static str> {
    loader.set_target(target);

    // The main thread's static TLS block and DTV.
    let tcb = loader.tls.allocate_thread(true);
    loader.main_thread.store(tcb as usize, Ordering::Release);

    loader.relocate_all(false)?;

    unsafe {
        loader.tls.dtv_setup(tcb);
    }

    // Run constructors of the dependencies; the executable itself is
    // initialized by its own startup code.
    let start = target.current().ok_or("target was never loaded")?;
    if start.elf.etype() != goblin::elf::header::ET_REL {
        target.set_flag(ObjectFlags::INITIALIZED, true);
    }
    let identities: Vec<IdentityRef> = loader.lookup.read().iter().rev().cloned().collect();
    for identity in identities {
        if !prepare::initialize_identity(loader, &identity) {
            return Err("initialization failed");
        }
    }
    Ok(())
}

/// Resolves the entry point of the target (honoring an explicit override:
/// a symbol name, an absolute address, or a `+offset` relative one).
pub fn entry_point(
    loader: &Loader,
    target: &IdentityRef,
    custom: Option<&str>,
) -> Result<usize, &'static str> {
    let object = target.current().ok_or("target was never loaded")?;
    if let Some(custom) = custom {
        if let Some(definition) =
            loader.resolve_symbol(custom, None, target.ns, None, crate::ResolveMode::Default)
        {
            debug!("overwrote entry point with symbol {}", custom);
            return Ok(definition.pointer());
        }
        let trimmed = custom.trim();
        let relative = trimmed.starts_with('+');
        let literal = trimmed.trim_start_matches('+');
        let parsed = if let Some(hex) = literal.strip_prefix("0x") {
            usize::from_str_radix(hex, 16)
        } else {
            literal.parse::<usize>()
        };
        match parsed {
            Ok(value) => {
                return Ok(if relative { object.base + value } else { value });
            }
            Err(_) => error!("unable to resolve custom entry {}, using default", custom),
        }
    }
    match object.kind {
        ObjectKind::Dynamic {
            position_independent: true,
        } => Ok(object.base + object.elf.header().e_entry as usize),
        ObjectKind::Relocatable => crate::relocatable::symbol_address(&object, "_start")
            .or_else(|| crate::relocatable::symbol_address(&object, "main"))
            .ok_or("relocatable object has no entry symbol"),
        _ => Ok(object.elf.header().e_entry as usize),
    }
}

/// Builds the initial process stack: `argc`, `argv[]`, `envp[]`, and the
/// auxiliary vector, with the string data stacked above them.
pub fn build_stack(
    target: &IdentityRef,
    args: &[String],
    envs: &[String],
) -> Result<usize, &'static str> {
    let object = target.current().ok_or("target was never loaded")?;

    let stack = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if stack == libc::MAP_FAILED {
        return Err("mapping the initial stack failed");
    }
    let top = stack as usize + STACK_SIZE;

    // Strings land at the very top, pointers below them.
    fn push_string(cursor: &mut usize, text: &str) -> usize {
        let bytes = CString::new(text).unwrap_or_default();
        let bytes = bytes.as_bytes_with_nul();
        *cursor -= bytes.len();
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), *cursor as *mut u8, bytes.len());
        }
        *cursor
    }
    let mut cursor = top;
    let arg_pointers: Vec<usize> = args
        .iter()
        .map(|arg| push_string(&mut cursor, arg))
        .collect();
    let env_pointers: Vec<usize> = envs
        .iter()
        .map(|env| push_string(&mut cursor, env))
        .collect();
    // 16 random bytes for AT_RANDOM.
    cursor -= 16;
    let random = cursor;
    unsafe {
        libc::getrandom(random as *mut libc::c_void, 16, 0);
    }

    let header = object.elf.header();
    let auxv = [
        (AT_PHDR, object.base + header.e_phoff as usize),
        (AT_PHENT, core::mem::size_of::<goblin::elf64::program_header::ProgramHeader>()),
        (AT_PHNUM, header.e_phnum as usize),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_ENTRY, object.base + header.e_entry as usize),
        (AT_RANDOM, random),
        (AT_SECURE, 0),
        (AT_NULL, 0),
    ];

    // Vector area: argc + argv + NULL + envp + NULL + auxv pairs.
    let words = 1 + arg_pointers.len() + 1 + env_pointers.len() + 1 + auxv.len() * 2;
    let mut vector = (cursor - words * 8) & !15;
    let stack_pointer = vector;
    unsafe {
        let mut write = |value: usize| {
            *(vector as *mut usize) = value;
            vector += 8;
        };
        write(args.len());
        for pointer in &arg_pointers {
            write(*pointer);
        }
        write(0);
        for pointer in &env_pointers {
            write(*pointer);
        }
        write(0);
        for (key, value) in auxv.iter() {
            write(*key);
            write(*value);
        }
    }
    Ok(stack_pointer)
}

/// Prints the initial stack contents as the configuration asks for.
pub fn show_init_stack(loader: &Loader, entry: usize, stack_pointer: usize) {
    unsafe {
        let argc = *(stack_pointer as *const usize);
        let argv = (stack_pointer + 8) as *const *const libc::c_char;
        if loader.config.show_args {
            eprintln!("Arguments for {:#x} (with stack pointer at {:#x}):", entry, stack_pointer);
            for index in 0..argc {
                let arg = std::ffi::CStr::from_ptr(*argv.add(index));
                eprintln!("\t{}. \"{}\"", index + 1, arg.to_string_lossy());
            }
        }
        let envp = argv.add(argc + 1);
        if loader.config.show_env {
            eprintln!("Environment variables:");
            let mut index = 0;
            while !(*envp.add(index)).is_null() {
                let env = std::ffi::CStr::from_ptr(*envp.add(index));
                eprintln!("\t{}. \"{}\"", index + 1, env.to_string_lossy());
                index += 1;
            }
        }
        if loader.config.show_auxv {
            let mut index = 0;
            while !(*envp.add(index)).is_null() {
                index += 1;
            }
            let mut auxv = envp.add(index + 1) as *const usize;
            eprintln!("Auxiliary vectors:");
            loop {
                let key = *auxv;
                let value = *auxv.add(1);
                eprintln!("\t[{}] = {:#x}", key, value);
                if key == AT_NULL {
                    break;
                }
                auxv = auxv.add(2);
            }
        }
    }
}

/// Transfers control to the program: switches to the prepared stack and
/// jumps to the entry point with the registers in their ABI start state.
pub fn start_program(loader: &'static Loader, entry: usize, stack_pointer: usize) -> ! {
    loader.process_started.store(true, Ordering::Release);
    info!("starting program at {:#x}", entry);
    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor ebp, ebp",
            "xor edx, edx", // no atexit handler from the loader
            "jmp {entry}",
            stack = in(reg) stack_pointer,
            entry = in(reg) entry,
            options(noreturn),
        );
    }
}
