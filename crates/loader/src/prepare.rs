//! Relocation application and lazy binding.

use std::sync::Arc;

use elf_image::ElfImage;
use goblin::elf::sym::STB_WEAK;
use log::{debug, error, info, trace, warn};
use object_metadata::{IdentityRef, ObjectFlags, ObjectKind, ObjectRef, ObjectStatus};
use relocate_x86_64::{Relocation, Relocator};

use crate::resolver_entry::resolver_entry_address;
use crate::{relocatable, Loader, ResolveMode};

/// Prepares an identity's current version, dependencies first. The status
/// field guards against (legal) dependency cycles.
pub fn prepare_identity(loader: &Loader, identity: &IdentityRef) -> bool {
    let object = match identity.current() {
        Some(object) => object,
        None => return false,
    };
    let status = *object.status.lock();
    match status {
        ObjectStatus::Mapped => {
            *object.status.lock() = ObjectStatus::Preparing;

            let dependencies = object.dependencies.lock().clone();
            for dependency in dependencies {
                if !prepare_identity(loader, &dependency) {
                    return false;
                }
            }

            debug!("preparing {:?}", object);
            if prepare_object(loader, &object) {
                *object.status.lock() = ObjectStatus::Prepared;
                true
            } else {
                false
            }
        }
        ObjectStatus::Preparing => {
            warn!("circular dependency on {:?}", object);
            true
        }
        ObjectStatus::Prepared => true,
    }
}

/// Applies all relocation tables of one object version.
pub fn prepare_object(loader: &Loader, object: &ObjectRef) -> bool {
    match object.kind {
        ObjectKind::Relocatable => return relocatable::prepare(loader, object),
        ObjectKind::Executable => return true,
        ObjectKind::Dynamic { .. } => {}
    }
    let info = match &object.dynamic_info {
        Some(info) => info,
        None => return true,
    };
    let identity = match object.identity() {
        Some(identity) => identity,
        None => return false,
    };
    info!(
        "preparing {:?} with GOT at {:#x}",
        object, object.global_offset_table
    );

    // Regular relocation table.
    for rela in ElfImage::rela_table(info.rela, info.rela_size) {
        let relocation = Relocation::from_rela(rela, false);
        if relocate_one(loader, object, &relocation, true).is_err() {
            return false;
        }
    }

    // PLT relocations: either bind eagerly or arm the lazy resolver.
    if !ElfImage::rela_table(info.jmprel, info.jmprel_size).is_empty() && object.global_offset_table != 0 {
        let bind_now = identity.flag(ObjectFlags::BIND_NOW);
        let got = object.base + object.global_offset_table;
        // The fixed GOT slots: got[1] identifies the object for the
        // resolver entry, got[2] is the resolver entry itself.
        unsafe {
            let got_slots = got as *mut usize;
            *got_slots.add(1) = Arc::as_ptr(object) as usize;
            *got_slots.add(2) = resolver_entry_address();
        }

        for rela in ElfImage::rela_table(info.jmprel, info.jmprel_size) {
            let relocation = Relocation::from_rela(rela, true);
            if bind_now {
                if relocate_one(loader, object, &relocation, true).is_err() {
                    return false;
                }
            } else {
                // Rebase the slot so the PLT stub falls through into the
                // resolver on first call.
                let relocator = Relocator::new(&relocation, object.global_offset_table as u64);
                let target = relocator.address(object.base);
                let dest = object.compose_pointer(target).unwrap_or(target);
                relocator.rebase(dest, object.base as u64);
            }
        }
    }
    true
}

/// Resolves and applies a single relocation. Returns the stored value.
///
/// With `fix` unset the value is only computed (used by the lazy resolver
/// when `BIND_NOT` asks it to leave the GOT untouched).
pub fn relocate_one(
    loader: &Loader,
    object: &ObjectRef,
    relocation: &Relocation,
    fix: bool,
) -> Result<u64, &'static str> {
    let identity = object.identity().ok_or("object lost its identity")?;
    let relocator = Relocator::new(relocation, object.global_offset_table as u64);
    if !relocator.recognized() {
        error!("unsupported relocation type {}", relocation.rtype);
        return Err("unsupported relocation type");
    }
    let target = relocator.address(object.base);

    // Detect user modifications of data-section relocation targets.
    let datarel_key = if loader.config.check_relocation_content
        && object.in_writable_segment(target)
        && object.is_latest_version()
    {
        let key = (object.data.fd, target - object.base);
        if let Some(cached) = identity.datarel_content.lock().get(&key) {
            let current = relocator.read(object.base);
            if current != *cached {
                warn!(
                    "value at relocation target {:#x} has changed ({:#x} instead of {:#x}), skipping",
                    target, current, cached
                );
                return Ok(*cached);
            }
        }
        Some(key)
    } else {
        None
    };

    if relocation.sym_index == 0 {
        // No symbol involved: the value only depends on this object.
        let value = relocator.value_internal(
            object.base as u64,
            identity.tls_module_id(),
            identity.tls_offset(),
        );
        if fix && relocator.read(object.base) != value {
            let dest = object.compose_pointer(target).unwrap_or(target);
            let written = relocator.store(dest, value);
            debug_assert_eq!(written, value);
            if let Some(key) = datarel_key {
                identity.datarel_content.lock().insert(key, written);
            }
        }
        return Ok(value);
    }

    // External symbol: resolve in the proper scope.
    let symbols = object.symbols.as_ref().ok_or("object has no symbol table")?;
    let sym = symbols
        .at(relocation.sym_index as usize)
        .ok_or("relocation references an out-of-range symbol")?;
    let name = symbols
        .name(relocation.sym_index as usize)
        .ok_or("relocation references a nameless symbol")?
        .to_string();
    let bind = sym.st_info >> 4;
    let version = object.version_of(relocation.sym_index as usize);
    let version = if version.name.is_some() {
        Some(version)
    } else {
        None
    };

    // Copy relocations must find the *other* definition of the same name.
    let mode = if relocator.is_copy() {
        ResolveMode::ExceptObject
    } else if identity.flag(ObjectFlags::BIND_DEEP) {
        ResolveMode::ObjectFirst
    } else {
        ResolveMode::Default
    };

    match loader.resolve_symbol(&name, version.as_ref(), identity.ns, Some(&identity), mode) {
        Some(definition) => {
            let value = relocator.value_external(object.base as u64, definition.placement());
            trace!(
                "relocating {} in {:?} with {} to {:#x}",
                name,
                object,
                definition.symbol.name,
                value
            );
            object.record_relocation(*relocation, definition.clone());

            if relocator.is_copy() {
                // Copy the initial bytes of the definition into the
                // executable's own storage.
                let dest = object.compose_pointer(target).unwrap_or(target);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        definition.pointer() as *const u8,
                        dest as *mut u8,
                        definition.size as usize,
                    );
                }
            } else if fix && relocator.read(object.base) != value {
                let dest = object.compose_pointer(target).unwrap_or(target);
                let written = relocator.store(dest, value);
                debug_assert_eq!(written, value);
                if let Some(key) = datarel_key {
                    identity.datarel_content.lock().insert(key, written);
                }
            }
            Ok(value)
        }
        None if bind == STB_WEAK => {
            debug!("unable to resolve weak symbol {}...", name);
            if fix {
                let dest = object.compose_pointer(target).unwrap_or(target);
                relocator.store(dest, 0);
            }
            Ok(0)
        }
        None => {
            error!("unable to resolve symbol {} for relocation in {:?}", name, object);
            Err("unresolved symbol")
        }
    }
}

/// High-level part of the lazy resolver: relocates PLT entry `index` of
/// `object` and returns the call target.
pub fn dynamic_resolve(loader: &Loader, object: &ObjectRef, index: usize) -> usize {
    let info = match &object.dynamic_info {
        Some(info) => info,
        None => {
            error!("object {:?} does not support lazy resolution", object);
            std::process::abort();
        }
    };
    let table = ElfImage::rela_table(info.jmprel, info.jmprel_size);
    let rela = match table.get(index) {
        Some(rela) => rela,
        None => {
            error!("lazy resolution of {:?} index {} out of range", object, index);
            std::process::abort();
        }
    };
    let relocation = Relocation::from_rela(rela, true);
    let fix = !object
        .identity()
        .map(|identity| identity.flag(ObjectFlags::BIND_NOT))
        .unwrap_or(false);
    match relocate_one(loader, object, &relocation, fix) {
        Ok(value) => value as usize,
        Err(message) => {
            // A lazy lookup has no caller to report to; failing to resolve
            // a called function is unrecoverable.
            error!("lazy resolution in {:?} failed: {}", object, message);
            std::process::abort();
        }
    }
}

/// Runs the initialization routines of an identity (dependencies first).
pub fn initialize_identity(loader: &Loader, identity: &IdentityRef) -> bool {
    if identity.flag(ObjectFlags::INITIALIZED) {
        return true;
    }
    identity.set_flag(ObjectFlags::INITIALIZED, true);

    let object = match identity.current() {
        Some(object) => object,
        None => return false,
    };
    let dependencies = object.dependencies.lock().clone();
    for dependency in dependencies {
        if !initialize_identity(loader, &dependency) {
            return false;
        }
    }
    debug!("initializing {:?}", object);
    run_initializers(&object);
    true
}

/// Calls `DT_INIT` and the `DT_INIT_ARRAY` entries of a mapped object.
fn run_initializers(object: &ObjectRef) {
    let info = match &object.dynamic_info {
        Some(info) => info,
        None => return,
    };
    unsafe {
        if info.init != 0 {
            let init: extern "C" fn() = core::mem::transmute(object.base + info.init);
            init();
        }
        if info.init_array == 0 {
            return;
        }
        let count = info.init_array_size / core::mem::size_of::<usize>();
        let array = (object.base + info.init_array) as *const usize;
        for index in 0..count {
            let entry = *array.add(index);
            if entry != 0 && entry != usize::MAX {
                let init: extern "C" fn() = core::mem::transmute(entry);
                init();
            }
        }
    }
}
