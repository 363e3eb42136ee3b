//! The per-identity load pipeline: open and validate the file, deduplicate,
//! construct the version object, discover segments and dependencies, map,
//! and (for updates) relocate immediately.

use std::sync::Arc;

use binary_hash::BinaryHash;
use elf_image::defs::{DF_1_GLOBAL, DF_1_NOW, DF_BIND_NOW};
use elf_image::{ElfImage, SymbolTable, VersionTable};
use goblin::elf::header::{ET_DYN, ET_EXEC, ET_REL};
use goblin::elf::program_header::{PT_DYNAMIC, PT_GNU_RELRO, PT_LOAD, PT_TLS, PF_W, PF_X};
use log::{debug, error, info, warn};
use memory_segment::{MemorySegment, SegmentSource};
use object_metadata::{
    IdentityRef, Info, Object, ObjectData, ObjectFlags, ObjectKind, ObjectRef, ObjectStatus,
};
use spin::Mutex;
use xxhash_rust::xxh64::xxh64;

use crate::{prepare, relocatable, Loader};

/// Loads the current file contents (or the premapped image at `addr`) as a
/// new version of `identity`.
pub fn load_object(loader: &Loader, identity: &IdentityRef, addr: usize) -> (Option<ObjectRef>, Info) {
    // Not updatable: only one version is ever allowed.
    if identity.current().is_some() && !identity.flag(ObjectFlags::UPDATABLE) {
        warn!(
            "cannot load new version of {:?}, updates are not allowed",
            identity
        );
        return (None, Info::UpdateDisabled);
    }

    let mut data = ObjectData {
        fd: -1,
        ..ObjectData::default()
    };
    if addr == 0 {
        match open_file(loader, identity, &mut data) {
            Ok(()) => {}
            Err(info) => return (None, info),
        }
    } else {
        data.addr = addr;
        data.size = match ElfImage::new(addr, usize::MAX >> 1) {
            Ok(image) => image.derived_size(),
            Err(_) => return (None, Info::ErrorElf),
        };
    }

    let result = create_object(loader, identity, data);
    if result.0.is_none() && data.addr != 0 && addr == 0 {
        unsafe {
            libc::munmap(data.addr as *mut libc::c_void, data.size);
            if data.fd >= 0 {
                libc::close(data.fd);
            }
        }
    }
    result
}

/// Opens and maps the file bytes, applying the modification-time gate.
fn open_file(loader: &Loader, identity: &IdentityRef, data: &mut ObjectData) -> Result<(), Info> {
    let path = match std::ffi::CString::new(identity.path.to_string_lossy().into_owned()) {
        Ok(path) => path,
        Err(_) => return Err(Info::ErrorOpen),
    };
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        debug!("opening {:?} failed", identity);
        return Err(Info::ErrorOpen);
    }
    data.fd = fd;

    let mut stat: libc::stat = unsafe { core::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        error!("stat of {:?} failed", identity);
        unsafe { libc::close(fd) };
        return Err(Info::ErrorStat);
    }
    data.mtime = (stat.st_mtime, stat.st_mtime_nsec);
    data.size = stat.st_size as usize;

    // Deduplicate by modification time before reading any content.
    if loader.config.use_mtime
        && identity.flag(ObjectFlags::SKIP_IDENTICAL)
        && !identity.flag(ObjectFlags::IGNORE_MTIME)
        && identity.has_version_with_mtime(data.mtime, data.size)
    {
        info!(
            "already loaded {:?} with same modification time, aborting",
            identity
        );
        unsafe { libc::close(fd) };
        return Err(Info::IdenticalTime);
    }

    let mapped = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            data.size,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_POPULATE,
            fd,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        error!("mapping {:?} failed", identity);
        unsafe { libc::close(fd) };
        return Err(Info::ErrorMap);
    }

    if identity.flag(ObjectFlags::IMMUTABLE_SOURCE) {
        data.addr = mapped as usize;
    } else {
        // A populated private mapping does not shield against concurrent
        // writes to the underlying file; updatable sources get a full
        // in-memory copy instead.
        let copy = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                data.size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if copy == libc::MAP_FAILED {
            error!("mapping anonymous memory for {:?} failed", identity);
            unsafe {
                libc::munmap(mapped, data.size);
                libc::close(fd);
            }
            return Err(Info::ErrorMap);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(mapped as *const u8, copy as *mut u8, data.size);
            libc::munmap(mapped, data.size);
            libc::close(fd);
        }
        data.fd = -1;
        data.addr = copy as usize;
    }
    Ok(())
}

/// Validates, deduplicates by content and constructs the version.
fn create_object(
    loader: &Loader,
    identity: &IdentityRef,
    mut data: ObjectData,
) -> (Option<ObjectRef>, Info) {
    let elf = match ElfImage::new(data.addr, data.size) {
        Ok(elf) => elf,
        Err(message) => {
            error!("unsupported ELF in {:?}: {}", identity, message);
            return (None, Info::ErrorElf);
        }
    };

    // Content hash gate.
    if identity.flag(ObjectFlags::UPDATABLE) && identity.flag(ObjectFlags::SKIP_IDENTICAL) {
        let seed = xxh64(identity.name().as_bytes(), 0);
        data.hash = xxh64(
            unsafe { core::slice::from_raw_parts(data.addr as *const u8, data.size) },
            seed,
        );
        debug!("{:?} has hash {:#x}", identity, data.hash);
        if identity.has_version_with_hash(data.hash, data.size) {
            info!("already loaded {:?} with same hash, aborting", identity);
            return (None, Info::IdenticalHash);
        }
    }

    let premapped = identity.flag(ObjectFlags::PREMAPPED);
    let kind = match elf.etype() {
        ET_EXEC => {
            if elf
                .program_headers()
                .iter()
                .any(|phdr| phdr.p_type == PT_DYNAMIC)
            {
                debug!("executable {:?} has a dynamic section", identity);
                ObjectKind::Dynamic {
                    position_independent: false,
                }
            } else {
                ObjectKind::Executable
            }
        }
        ET_DYN => ObjectKind::Dynamic {
            position_independent: true,
        },
        ET_REL => ObjectKind::Relocatable,
        _ => {
            error!("unsupported ELF type in {:?}", identity);
            return (None, Info::ErrorElf);
        }
    };

    // Base address assignment.
    let base = match kind {
        ObjectKind::Dynamic {
            position_independent: true,
        } => {
            if premapped {
                data.addr - elf.virt_offset()
            } else {
                let mut span = 0;
                for phdr in elf.program_headers() {
                    if phdr.p_type == PT_LOAD {
                        let end = (phdr.p_vaddr + phdr.p_memsz) as usize;
                        if end > span {
                            span = end;
                        }
                    }
                }
                loader.next_address(span)
            }
        }
        ObjectKind::Relocatable => {
            let (_, span) = crate::relocatable::span_of(&elf);
            loader.next_address(span)
        }
        _ => 0,
    };

    let dynamic_info = elf.dynamic(premapped);
    let (symbols, version_table) = match &dynamic_info {
        Some(info) => {
            let symbols = SymbolTable::new(info);
            let versions = VersionTable::new(info, &symbols);
            (Some(symbols), Some(versions))
        }
        None => (None, None),
    };

    // The SONAME overrides the file name.
    if let Some(info) = &dynamic_info {
        if let Some(soname) = &info.soname {
            if *soname != identity.name() && !identity.name().is_empty() {
                warn!(
                    "library file name ({}) differs from soname ({}), using the latter",
                    identity.name(),
                    soname
                );
            }
            identity.set_name(soname);
        }
    }

    let global_offset_table = match kind {
        ObjectKind::Relocatable => crate::relocatable::span_of(&elf).0,
        _ => dynamic_info.as_ref().map(|info| info.pltgot).unwrap_or(0),
    };

    // Per-symbol fingerprints for updatable identities. A stripped object
    // may carry its symbol table in a separate debug file.
    let binary_hash = if identity.flag(ObjectFlags::UPDATABLE) && kind != ObjectKind::Relocatable {
        info!("calculating binary hash of {:?}", identity);
        let seed = xxh64(identity.name().as_bytes(), 0);
        let debug_image = if loader.config.find_debug_symbols {
            find_debug_symbols(loader, identity, elf.build_id().as_deref())
        } else {
            None
        };
        match debug_image {
            Some(debug_elf) => Some(BinaryHash::new(&debug_elf, seed)),
            None => Some(BinaryHash::new(&elf, seed)),
        }
    } else {
        None
    };

    let previous = identity.current();
    let object = Arc::new(Object {
        identity: Arc::downgrade(identity),
        data,
        elf,
        kind,
        base,
        global_offset_table,
        dynamic_info,
        symbols,
        version_table,
        build_id: elf.build_id(),
        binary_hash,
        file_previous: previous.clone(),
        segments: Mutex::new(Vec::new()),
        dependencies: Mutex::new(Vec::new()),
        relocations: Mutex::new(Vec::new()),
        status: Mutex::new(ObjectStatus::Mapped),
    });

    // Patchability against the current version.
    if let Some(previous) = &previous {
        match patchable(loader, identity, &object, previous) {
            Ok(()) => {}
            Err(info) => {
                warn!(
                    "got new version of {:?}, but it cannot patch the current one",
                    identity
                );
                loader.reset_address(base);
                return (None, info);
            }
        }
    }

    // Segment and dependency discovery.
    let preloaded = match object.kind {
        ObjectKind::Relocatable => relocatable::preload(loader, identity, &object),
        _ => preload(loader, identity, &object),
    };
    if !preloaded {
        error!("loading of {:?} failed while preloading", identity);
        loader.reset_address(base);
        return (None, Info::FailedPreloading);
    }

    if !premapped {
        if object.map().is_err() {
            error!("loading of {:?} failed while mapping", identity);
            object.unmap();
            loader.reset_address(base);
            return (None, Info::FailedMapping);
        }
    } else {
        for segment in object.segments.lock().iter_mut() {
            segment.target.status = memory_segment::SegmentStatus::Mapped;
        }
    }

    identity.set_current(object.clone());

    // Updates of running programs cannot bind lazily: relocate right away.
    if identity.flag(ObjectFlags::INITIALIZED) && object.file_previous.is_some() {
        info!("preparing new version of {:?}", identity);
        identity.set_flag(ObjectFlags::BIND_NOW, true);
        if !prepare::prepare_object(loader, &object) {
            warn!("preparing updated object {:?} failed", identity);
        }
        *object.status.lock() = ObjectStatus::Prepared;
    }

    // A new version of a TLS-carrying file changes the initialization image
    // for threads created from now on.
    let tls_module = identity.tls_module_id();
    if tls_module != 0 && object.file_previous.is_some() {
        if let Some(tdata) = tls_image_address(&object) {
            loader.tls.set_image(tls_module, tdata);
        }
    }

    info!(
        "successfully loaded {:?} v{} with base {:#x}",
        identity,
        object.version(),
        object.base
    );

    let info = if object.file_previous.is_none() {
        Info::SuccessLoad
    } else {
        Info::SuccessUpdate
    };
    (Some(object), info)
}

/// Runtime address of the TLS initialization image of this version.
fn tls_image_address(object: &ObjectRef) -> Option<usize> {
    object
        .elf
        .program_headers()
        .iter()
        .find(|phdr| phdr.p_type == PT_TLS)
        .map(|phdr| object.base + phdr.p_vaddr as usize)
}

/// Collects segments (splitting at RELRO boundaries), registers TLS and
/// loads the needed libraries.
fn preload(loader: &Loader, identity: &IdentityRef, object: &ObjectRef) -> bool {
    let relro = object
        .elf
        .program_headers()
        .iter()
        .find(|phdr| phdr.p_type == PT_GNU_RELRO)
        .cloned();

    let mut segments = Vec::new();
    for phdr in object.elf.program_headers() {
        match phdr.p_type {
            PT_LOAD if phdr.p_memsz > 0 => {
                let protection = protection_of(phdr.p_flags);
                if let Some(relro) = relro.as_ref().filter(|relro| {
                    relro.p_offset == phdr.p_offset && relro.p_vaddr == phdr.p_vaddr
                }) {
                    debug!(
                        "relocation read-only at {:#x} with {} bytes",
                        relro.p_vaddr, relro.p_memsz
                    );
                    segments.push(MemorySegment::new(
                        SegmentSource {
                            file_addr: object.data.addr,
                            offset: relro.p_offset as usize,
                            size: relro.p_filesz as usize,
                        },
                        object.base,
                        relro.p_vaddr as usize,
                        relro.p_memsz as usize,
                        protection,
                        true,
                    ));
                    if phdr.p_memsz > relro.p_memsz {
                        debug_assert!(
                            ((relro.p_vaddr + relro.p_memsz) as usize) % page_util::PAGE_SIZE == 0
                        );
                        segments.push(MemorySegment::new(
                            SegmentSource {
                                file_addr: object.data.addr,
                                offset: (phdr.p_offset + relro.p_memsz) as usize,
                                size: (phdr.p_filesz.saturating_sub(relro.p_memsz)) as usize,
                            },
                            object.base,
                            (phdr.p_vaddr + relro.p_memsz) as usize,
                            (phdr.p_memsz - relro.p_memsz) as usize,
                            protection,
                            false,
                        ));
                    }
                } else {
                    segments.push(MemorySegment::new(
                        SegmentSource {
                            file_addr: object.data.addr,
                            offset: phdr.p_offset as usize,
                            size: phdr.p_filesz as usize,
                        },
                        object.base,
                        phdr.p_vaddr as usize,
                        phdr.p_memsz as usize,
                        protection,
                        false,
                    ));
                }
            }
            PT_TLS if phdr.p_memsz > 0 => {
                if identity.tls_module_id() == 0 {
                    let (module_id, offset) = loader.tls.add_module(
                        Arc::as_ptr(identity) as usize,
                        phdr.p_memsz as usize,
                        phdr.p_align as usize,
                        object.base + phdr.p_vaddr as usize,
                        phdr.p_filesz as usize,
                        !loader
                            .process_started
                            .load(core::sync::atomic::Ordering::Acquire),
                    );
                    identity.set_tls_module(module_id, offset);
                }
            }
            _ => {}
        }
    }

    // Updates share the writable pages of the previous version so global
    // state survives the version switch.
    if let Some(previous) = &object.file_previous {
        let previous_segments = previous.segments.lock();
        if previous_segments.len() != segments.len() {
            warn!(
                "load segments differ in {:?} ({} compared to {} in the current version)",
                identity,
                segments.len(),
                previous_segments.len()
            );
            return false;
        }
        for (new, old) in segments.iter_mut().zip(previous_segments.iter()) {
            if old.target.writable() && !old.target.relro && old.target.fd >= 0 {
                new.inherit_fd(old.shmemdup());
            }
        }
    }

    let has_segments = !segments.is_empty();
    *object.segments.lock() = segments;

    has_segments && preload_libraries(loader, identity, object)
}

fn protection_of(p_flags: u32) -> i32 {
    let mut protection = 0;
    if p_flags & goblin::elf::program_header::PF_R != 0 {
        protection |= libc::PROT_READ;
    }
    if p_flags & PF_W != 0 {
        protection |= libc::PROT_WRITE;
    }
    if p_flags & PF_X != 0 {
        protection |= libc::PROT_EXEC;
    }
    protection
}

/// Loads every `DT_NEEDED` dependency (honoring the exclude list and the
/// object's rpath/runpath) and records the `DT_FLAGS` bind options.
fn preload_libraries(loader: &Loader, identity: &IdentityRef, object: &ObjectRef) -> bool {
    let info = match &object.dynamic_info {
        Some(info) => info,
        None => return true,
    };

    if info.flags & DF_BIND_NOW != 0 || info.flags_1 & DF_1_NOW != 0 {
        identity.set_flag(ObjectFlags::BIND_NOW, true);
    }
    if info.flags_1 & DF_1_GLOBAL != 0 {
        identity.set_flag(ObjectFlags::BIND_GLOBAL, true);
    }

    let rpath = expand_paths(&info.rpath, identity);
    let runpath = expand_paths(&info.runpath, identity);

    // Dependencies inherit the identity's flags minus per-file state.
    let mut flags = *identity.flags.read();
    flags.remove(
        ObjectFlags::IMMUTABLE_SOURCE
            | ObjectFlags::IGNORE_MTIME
            | ObjectFlags::INITIALIZED
            | ObjectFlags::PREMAPPED
            | ObjectFlags::EXECUTED_BINARY,
    );
    flags.set(ObjectFlags::UPDATABLE, loader.config.dynamic_update);

    let mut success = true;
    for library in &info.needed {
        if loader
            .library_exclude
            .iter()
            .any(|excluded| excluded == library)
        {
            warn!("library '{}' will be skipped (exclude list)", library);
            continue;
        }
        match loader.library(library, flags, &rpath, &runpath, identity.ns) {
            Some(dependency) => object.dependencies.lock().push(dependency),
            None => {
                warn!("{:?} has an unresolved dependency: {}", identity, library);
                success = false;
            }
        }
    }
    success
}

/// Expands `$ORIGIN`, `$LIB` and `$PLATFORM` in rpath/runpath entries.
fn expand_paths(paths: &[String], identity: &IdentityRef) -> Vec<String> {
    let origin = identity
        .path
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .unwrap_or_default();
    paths
        .iter()
        .map(|path| {
            path.replace("$ORIGIN", &origin)
                .replace("${ORIGIN}", &origin)
                .replace("$LIB", "lib64")
                .replace("${LIB}", "lib64")
                .replace("$PLATFORM", "x86_64")
                .replace("${PLATFORM}", "x86_64")
        })
        .collect()
}

/// Checks whether the new version may patch the currently loaded one.
fn patchable(
    loader: &Loader,
    identity: &IdentityRef,
    object: &ObjectRef,
    previous: &ObjectRef,
) -> Result<(), Info> {
    if previous.elf.identification() != object.elf.identification()
        || previous.elf.header().e_machine != object.elf.header().e_machine
        || previous.elf.header().e_version != object.elf.header().e_version
    {
        return Err(Info::UpdateIncompatible);
    }

    info!("checking if {:?} can patch the previous version", identity);
    let (new_hash, old_hash) = match (&object.binary_hash, &previous.binary_hash) {
        (Some(new_hash), Some(old_hash)) => (new_hash, old_hash),
        _ => return Err(Info::UpdateIncompatible),
    };

    let diff = new_hash.diff(old_hash);
    debug!(
        "found {} differences in {:?} compared to the current version",
        diff.len(),
        identity
    );
    if !binary_hash::patchable(&diff) {
        warn!(
            "new version of {:?} has non-trivial changes in the data section",
            identity
        );
        if !loader.config.force_update {
            return Err(Info::UpdateIncompatible);
        }
    }

    // Every reference currently pointing into the outdated version must be
    // satisfiable by the new one.
    for other in loader.lookup.read().iter() {
        for version in other.versions() {
            for (_, definition) in version.relocations.lock().iter() {
                if Arc::ptr_eq(&definition.object, previous) {
                    let symbol = &definition.symbol;
                    if object
                        .resolve_symbol(
                            &symbol.name,
                            symbol.hash,
                            symbol.gnu_hash,
                            &symbol.version,
                        )
                        .is_none()
                    {
                        warn!(
                            "required symbol {} not found in new version of {:?}, not patching",
                            symbol.name, identity
                        );
                        return Err(Info::UpdateIncompatible);
                    }
                }
            }
        }
    }

    // External oracle comparing debug (DWARF) hashes, when connected.
    if !loader.config.force_update {
        if let (Some(new_digest), Some(old_digest)) = (
            query_debug_hash(loader, object),
            query_debug_hash(loader, previous),
        ) {
            if new_digest != old_digest {
                warn!(
                    "debug hash of new version ({}) differs from current ({}), not patching",
                    new_digest, old_digest
                );
                return Err(Info::UpdateIncompatible);
            }
            info!("debug hash ({}) is identical", new_digest);
        }
    }

    Ok(())
}

/// Locates the separate debug-symbol file of a stripped object (by
/// build-id under `<root>/usr/lib/debug/.build-id/`, then next to the
/// file) and maps it for fingerprinting.
fn find_debug_symbols(
    loader: &Loader,
    identity: &IdentityRef,
    build_id: Option<&str>,
) -> Option<ElfImage> {
    let root = loader
        .config
        .debug_symbols_root
        .clone()
        .unwrap_or_default();
    let mut candidates = Vec::new();
    if let Some(build_id) = build_id.filter(|id| id.len() > 2) {
        candidates.push(format!(
            "{}/usr/lib/debug/.build-id/{}/{}.debug",
            root,
            &build_id[..2],
            &build_id[2..]
        ));
    }
    candidates.push(format!("{}{}.debug", root, identity.path.display()));
    candidates.push(format!(
        "{}/usr/lib/debug{}.debug",
        root,
        identity.path.display()
    ));

    for candidate in candidates {
        let bytes = match std::fs::read(&candidate) {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        // Leaked intentionally: the fingerprint borrows these bytes only
        // while it is being built, but keeping them around makes the image
        // addresses stable for any later diff logging.
        let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        match ElfImage::new(bytes.as_ptr() as usize, bytes.len()) {
            Ok(image) => {
                info!(
                    "using external debug symbols at {} for {:?}",
                    candidate, identity
                );
                return Some(image);
            }
            Err(_) => warn!(
                "external debug symbols at {} for {:?} are unusable",
                candidate, identity
            ),
        }
    }
    debug!("no external debug symbols for {:?} found", identity);
    None
}

/// Asks the debug-hash oracle for the digest of an object, first by
/// build-id, then by path.
fn query_debug_hash(loader: &Loader, object: &ObjectRef) -> Option<String> {
    let fd = loader
        .debug_hash_fd
        .load(core::sync::atomic::Ordering::Acquire);
    if fd < 0 {
        return None;
    }
    let identity = object.identity()?;
    let mut queries = Vec::new();
    if let Some(build_id) = &object.build_id {
        queries.push(build_id.clone());
    }
    queries.push(identity.path.to_string_lossy().into_owned());

    for query in queries {
        let request = format!("{}\n", query);
        let sent = unsafe {
            libc::send(
                fd,
                request.as_ptr() as *const libc::c_void,
                request.len(),
                0,
            )
        };
        if sent != request.len() as isize {
            warn!("debug hash socket sent {} of {} bytes", sent, request.len());
            continue;
        }
        let mut reply = [0u8; 128];
        let received = unsafe {
            libc::recv(fd, reply.as_mut_ptr() as *mut libc::c_void, reply.len(), 0)
        };
        if received > 0 && reply[0] != b'-' {
            let digest = String::from_utf8_lossy(&reply[..received as usize])
                .trim()
                .to_string();
            if !digest.is_empty() {
                return Some(digest);
            }
        }
    }
    None
}
