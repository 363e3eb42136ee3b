//! Trap-based code redirection.
//!
//! A redirection replaces the first byte of a retired function with a trap
//! instruction (`int3`). The process-wide `SIGTRAP` handler looks the
//! faulting address up in the redirection map and rewrites the interrupted
//! context's instruction pointer to the replacement code.
//!
//! A redirection marked *make static* keeps track of which threads have been
//! observed at the trap; once every live task of the process (except the
//! loader's helper thread) has passed through, the trap site is rewritten
//! into an unconditional jump. Rewriting earlier would mutate instruction
//! bytes another CPU might be executing.
//!
//! All patches go through the owning segment's compose buffer, so the live
//! text mapping never becomes writable.

use std::collections::BTreeMap;

use log::{debug, info};
use object_metadata::ObjectRef;
use spin::RwLock;

/// Trap instruction used at redirected sites.
///
/// Only [`TrapMode::Breakpoint`] (`int3`) is implemented; the other
/// encodings are accepted by configuration parsing but rejected at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapMode {
    /// `int1` debug trap.
    Debug,
    /// `int3` breakpoint (the implemented mode).
    Breakpoint,
    /// `ud2` invalid opcode.
    InvalidOpcode,
    /// `hlt` (privileged, faults in ring 3).
    Halt,
    /// Redirection disabled.
    None,
    /// Not set yet.
    NotConfigured,
}

const TRAP_OPCODE: u8 = 0xcc;

/// Promotion state of a redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Keep trapping forever.
    OnlyDynamic,
    /// Rewrite into a jump as soon as every task has been observed.
    MakeStatic,
    /// Already rewritten into a jump.
    MadeStatic,
}

/// Maximum tasks remembered per redirection before promotion gives up.
const MAX_OBSERVED_TASKS: usize = 128;

struct RedirectionEntry {
    /// Replacement code address.
    to: usize,
    kind: RedirectKind,
    /// Writable alias (compose buffer) of the trap site.
    compose: usize,
    /// Bytes replaced at the site (up to the 16 a static jump may need).
    original: [u8; 16],
    original_len: usize,
    /// Thread ids observed at the trap.
    observed: [i32; MAX_OBSERVED_TASKS],
    observed_len: usize,
}

impl RedirectionEntry {
    fn observed_contains(&self, tid: i32) -> bool {
        self.observed[..self.observed_len].contains(&tid)
    }

    fn observe(&mut self, tid: i32) {
        if self.observed_len < MAX_OBSERVED_TASKS && !self.observed_contains(tid) {
            self.observed[self.observed_len] = tid;
            self.observed_len += 1;
        }
    }
}

lazy_static::lazy_static! {
    /// Active redirections keyed by trap address.
    static ref REDIRECTIONS: RwLock<BTreeMap<usize, RedirectionEntry>> = RwLock::new(BTreeMap::new());
}

/// Alternate stack for the trap handler.
static mut TRAP_HANDLER_STACK: [u8; 4096 * 4] = [0; 4096 * 4];

static HANDLER_INSTALLED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
/// Thread id of the loader's helper thread, excluded from task observation.
static HELPER_TID: core::sync::atomic::AtomicI32 = core::sync::atomic::AtomicI32::new(-1);

/// Registers the helper thread so promotion does not wait for it.
pub fn exclude_thread(tid: i32) {
    HELPER_TID.store(tid, core::sync::atomic::Ordering::Release);
}

/// Installs the `SIGTRAP` handler (idempotent).
pub fn setup(mode: TrapMode) -> Result<(), &'static str> {
    match mode {
        TrapMode::Breakpoint => {}
        TrapMode::None | TrapMode::NotConfigured => return Ok(()),
        _ => return Err("only the int3 trap is implemented"),
    }
    if HANDLER_INSTALLED.swap(true, core::sync::atomic::Ordering::AcqRel) {
        return Ok(());
    }

    unsafe {
        let stack = libc::stack_t {
            ss_sp: TRAP_HANDLER_STACK.as_mut_ptr() as *mut libc::c_void,
            ss_flags: 0,
            ss_size: TRAP_HANDLER_STACK.len(),
        };
        if libc::sigaltstack(&stack, core::ptr::null_mut()) != 0 {
            return Err("setting alternate stack for trap handler failed");
        }

        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            trap_handler;
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGTRAP, &action, core::ptr::null_mut()) != 0 {
            return Err("installing trap signal handler failed");
        }
    }
    info!("installed trap signal handler");
    Ok(())
}

/// Encodes a static jump from `from` to `to`: a 5-byte relative jump when
/// the displacement fits, the 16-byte absolute form otherwise.
fn jump_code(from: usize, to: usize) -> ([u8; 16], usize) {
    let mut code = [0u8; 16];
    if relative_jump_possible(from, to) {
        let displacement = (to as i64 - (from as i64 + 5)) as i32;
        code[0] = 0xe9;
        code[1..5].copy_from_slice(&displacement.to_le_bytes());
        (code, 5)
    } else {
        // jmp *0(%rip) with the 64-bit target in the following 8 bytes
        code[0] = 0xff;
        code[1] = 0x25;
        code[6..14].copy_from_slice(&(to as u64).to_le_bytes());
        (code, 14)
    }
}

fn relative_jump_possible(from: usize, to: usize) -> bool {
    (to as i64 - (from as i64 + 5)).unsigned_abs() < (1u64 << 31)
}

/// Adds a redirection from `from` to `to`.
///
/// `from_size` is the number of bytes owned by the redirected symbol; a
/// static rewrite is only attempted when the jump encoding fits into it.
/// The trap byte is written through `object`'s compose buffer immediately.
pub fn add(
    object: &ObjectRef,
    from: usize,
    to: usize,
    from_size: usize,
    make_static: bool,
) -> Result<(), &'static str> {
    let compose = object
        .compose_pointer(from)
        .ok_or("redirected address not in any composable segment")?;
    add_at(from, compose, to, from_size, make_static)
}

/// Adds a redirection with an explicit writable alias of the trap site.
pub fn add_at(
    from: usize,
    compose: usize,
    to: usize,
    from_size: usize,
    make_static: bool,
) -> Result<(), &'static str> {
    let mut kind = RedirectKind::OnlyDynamic;
    let mut replaced = 1;
    if make_static {
        let (_, len) = jump_code(from, to);
        if from_size < len {
            info!(
                "not enough space at {:#x} for a static redirection, staying dynamic",
                from
            );
        } else {
            kind = RedirectKind::MakeStatic;
            replaced = len;
        }
    }

    let mut redirections = REDIRECTIONS.write();
    if let Some(existing) = redirections.get_mut(&from) {
        if existing.kind == RedirectKind::MadeStatic {
            if existing.to == to {
                return Ok(());
            }
            // Rewrite the already-patched jump to the new target.
            let (code, len) = jump_code(from, to);
            unsafe {
                core::ptr::copy_nonoverlapping(code.as_ptr(), existing.compose as *mut u8, len);
            }
            existing.to = to;
            return Ok(());
        } else if existing.to == to && existing.kind == kind {
            return Ok(());
        }
        redirections.remove(&from);
    }

    let mut entry = RedirectionEntry {
        to,
        kind,
        compose,
        original: [0; 16],
        original_len: replaced,
        observed: [0; MAX_OBSERVED_TASKS],
        observed_len: 0,
    };
    unsafe {
        core::ptr::copy_nonoverlapping(from as *const u8, entry.original.as_mut_ptr(), replaced);
        *(compose as *mut u8) = TRAP_OPCODE;
    }
    debug!("redirecting {:#x} to {:#x} ({:?})", from, to, kind);
    redirections.insert(from, entry);
    Ok(())
}

/// Removes a redirection, restoring the original byte sequence exactly.
pub fn remove(from: usize) -> bool {
    let mut redirections = REDIRECTIONS.write();
    match redirections.remove(&from) {
        Some(entry) => {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    entry.original.as_ptr(),
                    entry.compose as *mut u8,
                    entry.original_len,
                );
            }
            true
        }
        None => false,
    }
}

/// Returns the target if a redirection is set for `from`.
pub fn target_of(from: usize) -> Option<usize> {
    REDIRECTIONS.read().get(&from).map(|entry| entry.to)
}

/// Promotion state of the redirection at `from`, if any.
pub fn kind_of(from: usize) -> Option<RedirectKind> {
    REDIRECTIONS.read().get(&from).map(|entry| entry.kind)
}

/// Drops every redirection bookkeeping entry (without restoring bytes);
/// used when a retired version is unmapped entirely.
pub fn forget_range(start: usize, end: usize) {
    let mut redirections = REDIRECTIONS.write();
    let stale: Vec<usize> = redirections
        .range(start..end)
        .map(|(address, _)| *address)
        .collect();
    for address in stale {
        redirections.remove(&address);
    }
}

/// Checks whether every live task (except the helper thread) appears in the
/// observed set. Reads `/proc/self/task` with plain syscalls so it is safe
/// to call from the signal handler.
fn all_tasks_observed(entry: &RedirectionEntry) -> bool {
    let helper = HELPER_TID.load(core::sync::atomic::Ordering::Acquire);
    unsafe {
        let fd = libc::open(
            b"/proc/self/task\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return false;
        }
        let mut buffer = [0u8; 2048];
        let mut complete = true;
        'outer: loop {
            let read = libc::syscall(
                libc::SYS_getdents64,
                fd,
                buffer.as_mut_ptr(),
                buffer.len(),
            );
            if read <= 0 {
                break;
            }
            let mut offset = 0usize;
            while offset < read as usize {
                let dirent = buffer.as_ptr().add(offset) as *const libc::dirent64;
                let reclen = (*dirent).d_reclen as usize;
                let name = (*dirent).d_name.as_ptr();
                if let Some(tid) = parse_tid(name) {
                    if tid != helper && !entry.observed_contains(tid) {
                        complete = false;
                        break 'outer;
                    }
                }
                offset += reclen;
            }
        }
        libc::close(fd);
        complete
    }
}

/// Parses a numeric directory name into a thread id.
unsafe fn parse_tid(name: *const libc::c_char) -> Option<i32> {
    let mut value: i64 = 0;
    let mut offset = 0;
    loop {
        let byte = *name.add(offset) as u8;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (byte - b'0') as i64;
        offset += 1;
    }
    if offset == 0 {
        None
    } else {
        Some(value as i32)
    }
}

/// The `SIGTRAP` handler. Must not allocate; the redirection map is only
/// read, and the observed-task set is a fixed-size array.
extern "C" fn trap_handler(
    signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    if signal != libc::SIGTRAP {
        return;
    }
    let ucontext = context as *mut libc::ucontext_t;
    let rip = unsafe { &mut (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] };
    // The trap has already been executed: rip points one byte past the site.
    let site = (*rip - 1) as usize;
    let tid = unsafe { libc::syscall(libc::SYS_gettid) as i32 };

    let mut target = None;
    let mut promote = false;
    {
        let redirections = REDIRECTIONS.read();
        if let Some(entry) = redirections.get(&site) {
            target = Some(entry.to);
            promote = entry.kind == RedirectKind::MakeStatic && !entry.observed_contains(tid);
        }
    }
    match target {
        Some(to) => *rip = to as i64,
        None => {
            // Not ours: report and resume (the byte was not a redirection).
            let message = b"trap at unregistered address\n";
            unsafe {
                libc::write(
                    libc::STDERR_FILENO,
                    message.as_ptr() as *const libc::c_void,
                    message.len(),
                );
            }
            return;
        }
    }

    if promote {
        let mut redirections = REDIRECTIONS.write();
        if let Some(entry) = redirections.get_mut(&site) {
            entry.observe(tid);
            if entry.kind == RedirectKind::MakeStatic && all_tasks_observed(entry) {
                let (code, len) = jump_code(site, entry.to);
                unsafe {
                    core::ptr::copy_nonoverlapping(code.as_ptr(), entry.compose as *mut u8, len);
                }
                entry.kind = RedirectKind::MadeStatic;
            }
        }
    }
}

#[cfg(test)]
mod test;
