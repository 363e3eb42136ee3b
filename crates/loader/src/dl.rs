//! The host contract: the link map and the classic `dl*` interface.

use std::ffi::{CStr, CString};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};
use object_metadata::{
    IdentityRef, Namespace, ObjectFlags, SymbolVersion, VersionedSymbol, NAMESPACE_BASE,
};
use spin::Mutex;

use crate::{Loader, ResolveMode};

/// A node of the `link_map` list exposed to the host runtime.
#[repr(C)]
pub struct LinkMap {
    pub l_addr: usize,
    pub l_name: *const libc::c_char,
    pub l_ld: usize,
    pub l_next: *mut LinkMap,
    pub l_prev: *mut LinkMap,
}

// SAFETY: `LinkMap` nodes are only ever accessed through `DL_STATE`'s mutex,
// which serializes access across threads.
unsafe impl Send for LinkMap {}
unsafe impl Sync for LinkMap {}

/// The `Dl_info` structure filled by `dladdr`.
#[repr(C)]
pub struct DlInfo {
    pub dli_fname: *const libc::c_char,
    pub dli_fbase: usize,
    pub dli_sname: *const libc::c_char,
    pub dli_saddr: usize,
}

/// One program-header callback record for `dl_iterate_phdr`.
#[repr(C)]
pub struct DlPhdrInfo {
    pub dlpi_addr: usize,
    pub dlpi_name: *const libc::c_char,
    pub dlpi_phdr: usize,
    pub dlpi_phnum: u16,
}

struct DlState {
    /// Stable backing storage for link-map nodes and their names.
    nodes: Vec<Box<LinkMap>>,
    names: Vec<CString>,
    /// Last error for `dlerror`.
    error: Option<CString>,
    /// Stable storage for symbol names handed out via `dladdr`.
    symbol_names: Vec<CString>,
}

lazy_static::lazy_static! {
    static ref DL_STATE: Mutex<DlState> = Mutex::new(DlState {
        nodes: Vec::new(),
        names: Vec::new(),
        error: None,
        symbol_names: Vec::new(),
    });
}

fn set_error(message: String) {
    DL_STATE.lock().error = CString::new(message).ok();
}

/// Rebuilds the link-map chain from the current lookup list and returns
/// its head.
pub fn link_map_head(loader: &Loader) -> *mut LinkMap {
    let mut state = DL_STATE.lock();
    state.nodes.clear();
    state.names.clear();

    for identity in loader.lookup.read().iter() {
        let name = CString::new(identity.path.to_string_lossy().into_owned())
            .unwrap_or_else(|_| CString::new("?").unwrap());
        state.names.push(name);
        let l_name = state.names.last().unwrap().as_ptr();
        state.nodes.push(Box::new(LinkMap {
            l_addr: identity.link_base.load(Ordering::Acquire),
            l_name,
            l_ld: identity.link_dynamic.load(Ordering::Acquire),
            l_next: core::ptr::null_mut(),
            l_prev: core::ptr::null_mut(),
        }));
    }

    // Wire the doubly-linked list.
    for index in 0..state.nodes.len() {
        let next = if index + 1 < state.nodes.len() {
            &mut *state.nodes[index + 1] as *mut LinkMap
        } else {
            core::ptr::null_mut()
        };
        let prev = if index > 0 {
            &mut *state.nodes[index - 1] as *mut LinkMap
        } else {
            core::ptr::null_mut()
        };
        state.nodes[index].l_next = next;
        state.nodes[index].l_prev = prev;
    }
    state
        .nodes
        .first_mut()
        .map(|node| &mut **node as *mut LinkMap)
        .unwrap_or(core::ptr::null_mut())
}

/// `dlopen`: load (or find) a library and return an opaque handle.
pub fn dlopen(loader: &'static Loader, file: Option<&str>, flags: i32) -> *mut libc::c_void {
    dlmopen(loader, NAMESPACE_BASE, file, flags)
}

/// `dlmopen`: like [`dlopen`], in an explicit namespace (`-1` = new one).
pub fn dlmopen(
    loader: &'static Loader,
    ns: Namespace,
    file: Option<&str>,
    flags: i32,
) -> *mut libc::c_void {
    let mut object_flags = ObjectFlags::empty();
    if flags & libc::RTLD_NOW != 0 {
        object_flags |= ObjectFlags::BIND_NOW;
    }
    if flags & libc::RTLD_GLOBAL != 0 {
        object_flags |= ObjectFlags::BIND_GLOBAL;
    }
    if flags & libc::RTLD_DEEPBIND != 0 {
        object_flags |= ObjectFlags::BIND_DEEP;
    }
    if flags & libc::RTLD_NODELETE != 0 {
        object_flags |= ObjectFlags::PERSISTENT;
    }

    match loader.dlopen(file, object_flags, ns) {
        Some(identity) => Arc::into_raw(identity) as *mut libc::c_void,
        None => {
            set_error(format!("cannot open {}", file.unwrap_or("<target>")));
            core::ptr::null_mut()
        }
    }
}

/// `dlclose` is a no-op: identities live until process exit.
pub fn dlclose(_handle: *mut libc::c_void) -> i32 {
    0
}

/// Recovers the identity behind a `dlopen` handle without consuming it.
fn identity_of(handle: *mut libc::c_void) -> Option<IdentityRef> {
    if handle.is_null() {
        return None;
    }
    unsafe {
        let identity = Arc::from_raw(handle as *const object_metadata::ObjectIdentity);
        let clone = identity.clone();
        core::mem::forget(identity);
        Some(clone)
    }
}

/// `dlsym`: resolve a symbol relative to a handle (or globally for null).
///
/// With `dynamic_dlupdate` the returned address is a trampoline stub whose
/// target follows future updates, so saved pointers stay valid.
pub fn dlsym(loader: &Loader, handle: *mut libc::c_void, name: &str) -> *mut libc::c_void {
    dlvsym_impl(loader, handle, name, None)
}

/// `dlvsym`: like [`dlsym`] with an explicit symbol version.
pub fn dlvsym(
    loader: &Loader,
    handle: *mut libc::c_void,
    name: &str,
    version: &str,
) -> *mut libc::c_void {
    dlvsym_impl(loader, handle, name, Some(SymbolVersion::named(version)))
}

fn dlvsym_impl(
    loader: &Loader,
    handle: *mut libc::c_void,
    name: &str,
    version: Option<SymbolVersion>,
) -> *mut libc::c_void {
    let identity = identity_of(handle);
    let definition = loader.resolve_symbol(
        name,
        version.as_ref(),
        identity.as_ref().map(|identity| identity.ns).unwrap_or(NAMESPACE_BASE),
        identity.as_ref(),
        if identity.is_some() {
            ResolveMode::ObjectFirst
        } else {
            ResolveMode::Default
        },
    );
    match definition {
        Some(definition) => {
            if loader.config.dynamic_dlupdate {
                let request = VersionedSymbol::new(
                    name,
                    version.unwrap_or_else(SymbolVersion::any),
                );
                match loader
                    .symbol_trampoline
                    .set(&request, definition.pointer())
                {
                    Ok(stub) => return stub as *mut libc::c_void,
                    Err(message) => warn!("trampoline for {} failed: {}", name, message),
                }
            }
            definition.pointer() as *mut libc::c_void
        }
        None => {
            set_error(format!("undefined symbol: {}", name));
            core::ptr::null_mut()
        }
    }
}

/// `dladdr`: reverse-map an address to its object and nearest symbol.
pub fn dladdr(loader: &Loader, addr: usize, info: &mut DlInfo) -> i32 {
    let object = match loader.resolve_object(addr, NAMESPACE_BASE) {
        Some(object) => object,
        None => return 0,
    };
    let identity = match object.identity() {
        Some(identity) => identity,
        None => return 0,
    };
    let mut state = DL_STATE.lock();
    let fname = CString::new(identity.path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| CString::new("?").unwrap());
    state.symbol_names.push(fname);
    info.dli_fname = state.symbol_names.last().unwrap().as_ptr();
    info.dli_fbase = object.base;
    info.dli_sname = core::ptr::null();
    info.dli_saddr = 0;
    if let Some(definition) = object.resolve_address(addr) {
        info.dli_saddr = definition.pointer();
        if let Ok(sname) = CString::new(definition.symbol.name) {
            state.symbol_names.push(sname);
            info.dli_sname = state.symbol_names.last().unwrap().as_ptr();
        }
    }
    1
}

/// `dladdr1`: like [`dladdr`], optionally handing out the link-map node of
/// the containing object (`RTLD_DL_LINKMAP`).
pub fn dladdr1(
    loader: &Loader,
    addr: usize,
    info: &mut DlInfo,
    extra_info: *mut *mut LinkMap,
    flags: i32,
) -> i32 {
    const RTLD_DL_LINKMAP: i32 = 2;
    let result = dladdr(loader, addr, info);
    if result != 0 && flags == RTLD_DL_LINKMAP && !extra_info.is_null() {
        let mut node = link_map_head(loader);
        unsafe {
            *extra_info = core::ptr::null_mut();
            while !node.is_null() {
                if (*node).l_addr == info.dli_fbase {
                    *extra_info = node;
                    break;
                }
                node = (*node).l_next;
            }
        }
    }
    result
}

/// `dlerror`: hand out (and clear) the last error message.
pub fn dlerror() -> *const libc::c_char {
    let mut state = DL_STATE.lock();
    match state.error.take() {
        Some(message) => {
            // Keep the string alive; glibc's dlerror has the same contract
            // of returning a pointer valid until the next call.
            state.symbol_names.push(message);
            state.symbol_names.last().unwrap().as_ptr()
        }
        None => core::ptr::null(),
    }
}

/// `dl_iterate_phdr`: snapshot-then-call over every version of every
/// object.
pub fn dl_iterate_phdr(
    loader: &Loader,
    callback: extern "C" fn(*mut DlPhdrInfo, usize, *mut libc::c_void) -> i32,
    data: *mut libc::c_void,
) -> i32 {
    // Snapshot first so the callback runs without loader locks held.
    let mut snapshot = Vec::new();
    for identity in loader.lookup.read().iter() {
        for object in identity.versions() {
            let name = CString::new(identity.path.to_string_lossy().into_owned())
                .unwrap_or_else(|_| CString::new("?").unwrap());
            let header = object.elf.header();
            snapshot.push((
                object.base,
                name,
                object.data.addr + header.e_phoff as usize,
                header.e_phnum,
            ));
        }
    }

    let mut result = 0;
    for (base, name, phdr, phnum) in snapshot {
        let mut info = DlPhdrInfo {
            dlpi_addr: base,
            dlpi_name: name.as_ptr(),
            dlpi_phdr: phdr,
            dlpi_phnum: phnum,
        };
        result = callback(
            &mut info,
            core::mem::size_of::<DlPhdrInfo>(),
            data,
        );
        if result != 0 {
            break;
        }
    }
    result
}

/// The TLS descriptor passed to `__tls_get_addr`.
#[repr(C)]
pub struct TlsIndex {
    pub module: usize,
    pub offset: usize,
}

/// `__tls_get_addr`: address of a TLS variable for the calling thread,
/// materializing the module's block on first access.
///
/// # Safety
/// Must be called from a thread whose control block was set up by the
/// loader's TLS engine.
pub unsafe fn tls_get_addr(loader: &Loader, index: *const TlsIndex) -> *mut libc::c_void {
    let mut tcb: usize = 0;
    libc::syscall(libc::SYS_arch_prctl, 0x1003usize, &mut tcb as *mut usize);
    debug_assert!(tcb != 0);
    let base = loader.tls.get_addr(
        tcb as *mut tls_dtv::ThreadControlBlock,
        (*index).module,
        true,
    );
    (base + (*index).offset) as *mut libc::c_void
}

/// `dlinfo` for the requests the loader answers: the link map of a handle.
pub fn dlinfo_linkmap(loader: &Loader, handle: *mut libc::c_void) -> *mut LinkMap {
    let identity = match identity_of(handle) {
        Some(identity) => identity,
        None => return core::ptr::null_mut(),
    };
    let head = link_map_head(loader);
    let mut node = head;
    let path = CString::new(identity.path.to_string_lossy().into_owned()).ok();
    while !node.is_null() {
        unsafe {
            if let Some(path) = &path {
                if CStr::from_ptr((*node).l_name) == path.as_c_str() {
                    return node;
                }
            }
            node = (*node).l_next;
        }
    }
    debug!("no link map entry for handle {:p}", handle);
    core::ptr::null_mut()
}
