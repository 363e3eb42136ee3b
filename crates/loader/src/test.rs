//! Loader tests over synthetic objects with fabricated dynamic symbol
//! tables (SysV hash with a single bucket, so lookups walk every chain
//! entry and match by name).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64};
use std::sync::Arc;

use elf_image::{DynamicInfo, ElfImage, SymbolTable};
use goblin::elf::sym::{STB_GLOBAL, STB_WEAK, STT_FUNC};
use goblin::elf64::sym::Sym;
use object_metadata::{
    IdentityRef, Namespace, Object, ObjectData, ObjectFlags, ObjectIdentity, ObjectKind,
    ObjectRef, ObjectStatus, NAMESPACE_BASE,
};
use spin::Mutex;

use super::*;

lazy_static::lazy_static! {
    /// Tests mutate the shared lookup list; serialize them.
    static ref TEST_LOCK: Mutex<()> = Mutex::new(());
}

fn test_loader() -> &'static Loader {
    INSTANCE
        .call_once(|| {
            let mut config = Config::default();
            config.dynamic_weak = true;
            &*Box::leak(Box::new(Loader::initialize_for_tests(config)))
        })
        .clone()
}

impl Loader {
    /// Test constructor bypassing the global installation side effects.
    fn initialize_for_tests(config: Config) -> Loader {
        Loader {
            config,
            library_path_runtime: Vec::new(),
            library_path_config: Vec::new(),
            library_path_default: Vec::new(),
            library_exclude: Vec::new(),
            lookup: spin::RwLock::new(Vec::new()),
            update_sync: Mutex::new(()),
            tls: tls_dtv::TlsRegistry::new(),
            symbol_trampoline: trampoline_pool::Trampoline::new(),
            target: spin::RwLock::new(None),
            default_flags: ObjectFlags::BIND_GLOBAL,
            main_thread: core::sync::atomic::AtomicUsize::new(0),
            next_namespace: AtomicI64::new(1),
            next_library_address: Mutex::new(0),
            statusinfo_fd: AtomicI32::new(-1),
            inotify_fd: AtomicI32::new(-1),
            userfault_fd: AtomicI32::new(-1),
            debug_hash_fd: AtomicI32::new(-1),
            process_started: AtomicBool::new(false),
        }
    }
}

/// Builds a leaked dynamic string/symbol/hash table triple defining the
/// given `(name, value, bind)` symbols.
fn fabricate_dynamic(symbols: &[(&str, u64, u8)]) -> DynamicInfo {
    let mut strtab = vec![0u8];
    let mut syms = vec![Sym {
        st_name: 0,
        st_info: 0,
        st_other: 0,
        st_shndx: 0,
        st_value: 0,
        st_size: 0,
    }];
    for (name, value, bind) in symbols {
        let offset = strtab.len() as u32;
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
        syms.push(Sym {
            st_name: offset,
            st_info: (*bind << 4) | STT_FUNC,
            st_other: 0,
            st_shndx: 1,
            st_value: *value,
            st_size: 16,
        });
    }

    // SysV hash with one bucket: bucket -> first symbol, chain walks on.
    let count = syms.len();
    let mut hash: Vec<u32> = vec![1, count as u32, if count > 1 { 1 } else { 0 }];
    for index in 0..count {
        hash.push(if index + 1 < count && index > 0 {
            (index + 1) as u32
        } else {
            0
        });
    }

    let strtab: &'static [u8] = Box::leak(strtab.into_boxed_slice());
    let syms: &'static [Sym] = Box::leak(syms.into_boxed_slice());
    let hash: &'static [u32] = Box::leak(hash.into_boxed_slice());

    DynamicInfo {
        strtab: strtab.as_ptr() as usize,
        strsz: strtab.len(),
        symtab: syms.as_ptr() as usize,
        hash: hash.as_ptr() as usize,
        ..DynamicInfo::default()
    }
}

fn leaked_elf_bytes() -> &'static [u8] {
    let mut bytes = vec![0u8; 64];
    bytes[..4].copy_from_slice(&goblin::elf::header::ELFMAG[..]);
    bytes[4] = goblin::elf::header::ELFCLASS64;
    bytes[5] = goblin::elf::header::ELFDATA2LSB;
    bytes[6] = 1;
    bytes[16] = 3;
    bytes[18] = 62;
    bytes[20] = 1;
    Box::leak(bytes.into_boxed_slice())
}

/// A synthetic loaded library exporting the given symbols.
fn library_with(
    name: &str,
    ns: Namespace,
    base: usize,
    symbols: &[(&str, u64, u8)],
    flags: ObjectFlags,
) -> (IdentityRef, ObjectRef) {
    let identity = ObjectIdentity::new(PathBuf::from(format!("/tmp/{}", name)), None, ns, flags);
    let bytes = leaked_elf_bytes();
    let dynamic = fabricate_dynamic(symbols);
    let table = SymbolTable::new(&dynamic);
    let object = Arc::new(Object {
        identity: Arc::downgrade(&identity),
        data: ObjectData {
            addr: bytes.as_ptr() as usize,
            size: bytes.len(),
            mtime: (0, 0),
            fd: -1,
            hash: base as u64,
        },
        elf: ElfImage::new(bytes.as_ptr() as usize, bytes.len()).unwrap(),
        kind: ObjectKind::Dynamic {
            position_independent: true,
        },
        base,
        global_offset_table: 0,
        dynamic_info: Some(dynamic),
        symbols: Some(table),
        version_table: None,
        build_id: None,
        binary_hash: None,
        file_previous: None,
        segments: Mutex::new(Vec::new()),
        dependencies: Mutex::new(Vec::new()),
        relocations: Mutex::new(Vec::new()),
        status: Mutex::new(ObjectStatus::Prepared),
    });
    identity.set_current(object.clone());
    (identity, object)
}

fn install(loader: &Loader, identities: &[&IdentityRef]) {
    let mut lookup = loader.lookup.write();
    lookup.clear();
    for identity in identities {
        lookup.push((*identity).clone());
    }
}

#[test]
fn global_scope_prefers_load_order() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    let (first, first_object) = library_with(
        "liba.so",
        NAMESPACE_BASE,
        0x10_0000,
        &[("answer", 0x100, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL,
    );
    let (second, _) = library_with(
        "libb.so",
        NAMESPACE_BASE,
        0x20_0000,
        &[("answer", 0x200, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL,
    );
    install(loader, &[&first, &second]);

    let definition = loader
        .resolve_symbol("answer", None, NAMESPACE_BASE, None, ResolveMode::Default)
        .expect("symbol must resolve");
    assert!(Arc::ptr_eq(&definition.object, &first_object));
    assert_eq!(definition.pointer(), 0x10_0100);
}

#[test]
fn except_object_skips_the_requester() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    let (requester, _) = library_with(
        "app",
        NAMESPACE_BASE,
        0x10_0000,
        &[("answer", 0x100, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL,
    );
    let (other, other_object) = library_with(
        "libx.so",
        NAMESPACE_BASE,
        0x20_0000,
        &[("answer", 0x200, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL,
    );
    install(loader, &[&requester, &other]);

    let definition = loader
        .resolve_symbol(
            "answer",
            None,
            NAMESPACE_BASE,
            Some(&requester),
            ResolveMode::ExceptObject,
        )
        .expect("symbol must resolve elsewhere");
    assert!(Arc::ptr_eq(&definition.object, &other_object));
}

#[test]
fn deep_binding_prefers_the_requester() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    let (global, _) = library_with(
        "libfirst.so",
        NAMESPACE_BASE,
        0x10_0000,
        &[("answer", 0x100, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL,
    );
    let (deep, deep_object) = library_with(
        "libdeep.so",
        NAMESPACE_BASE,
        0x20_0000,
        &[("answer", 0x200, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL | ObjectFlags::BIND_DEEP,
    );
    install(loader, &[&global, &deep]);

    let definition = loader
        .resolve_symbol(
            "answer",
            None,
            NAMESPACE_BASE,
            Some(&deep),
            ResolveMode::ObjectFirst,
        )
        .expect("symbol must resolve");
    assert!(Arc::ptr_eq(&definition.object, &deep_object));
}

#[test]
fn weak_definition_yields_to_strong() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    let (weak, _) = library_with(
        "libweak.so",
        NAMESPACE_BASE,
        0x10_0000,
        &[("answer", 0x100, STB_WEAK)],
        ObjectFlags::BIND_GLOBAL,
    );
    let (strong, strong_object) = library_with(
        "libstrong.so",
        NAMESPACE_BASE,
        0x20_0000,
        &[("answer", 0x200, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL,
    );
    install(loader, &[&weak, &strong]);

    // dynamic_weak is enabled in the test configuration: the weak match is
    // remembered but the later strong one wins.
    let definition = loader
        .resolve_symbol("answer", None, NAMESPACE_BASE, None, ResolveMode::Default)
        .expect("symbol must resolve");
    assert!(Arc::ptr_eq(&definition.object, &strong_object));
}

#[test]
fn weak_definition_used_as_fallback() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    let (weak, weak_object) = library_with(
        "libonlyweak.so",
        NAMESPACE_BASE,
        0x10_0000,
        &[("answer", 0x100, STB_WEAK)],
        ObjectFlags::BIND_GLOBAL,
    );
    install(loader, &[&weak]);

    let definition = loader
        .resolve_symbol("answer", None, NAMESPACE_BASE, None, ResolveMode::Default)
        .expect("weak fallback must be returned");
    assert!(Arc::ptr_eq(&definition.object, &weak_object));
}

#[test]
fn namespaces_do_not_share_symbols() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    let (isolated, _) = library_with(
        "libiso.so",
        7,
        0x10_0000,
        &[("answer", 0x100, STB_GLOBAL)],
        ObjectFlags::BIND_GLOBAL,
    );
    install(loader, &[&isolated]);

    assert!(loader
        .resolve_symbol("answer", None, NAMESPACE_BASE, None, ResolveMode::Default)
        .is_none());
    assert!(loader
        .resolve_symbol("answer", None, 7, None, ResolveMode::Default)
        .is_some());
}

/// A minimal position-independent object: one read-only `PT_LOAD` segment
/// covering the whole (one page) file, no dynamic section.
fn minimal_shared_object() -> Vec<u8> {
    let mut bytes = vec![0u8; 4096];
    bytes[..4].copy_from_slice(&goblin::elf::header::ELFMAG[..]);
    bytes[4] = goblin::elf::header::ELFCLASS64;
    bytes[5] = goblin::elf::header::ELFDATA2LSB;
    bytes[6] = 1;
    bytes[16] = 3; // ET_DYN
    bytes[18] = 62; // EM_X86_64
    bytes[20] = 1;
    bytes[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
    bytes[54] = 56; // e_phentsize
    bytes[56] = 1; // e_phnum

    // The program header at offset 64.
    let phdr = &mut bytes[64..120];
    phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    phdr[4..8].copy_from_slice(&4u32.to_le_bytes()); // PF_R
    phdr[8..16].copy_from_slice(&0u64.to_le_bytes()); // p_offset
    phdr[16..24].copy_from_slice(&0u64.to_le_bytes()); // p_vaddr
    phdr[32..40].copy_from_slice(&4096u64.to_le_bytes()); // p_filesz
    phdr[40..48].copy_from_slice(&4096u64.to_le_bytes()); // p_memsz
    phdr[48..56].copy_from_slice(&4096u64.to_le_bytes()); // p_align
    bytes
}

#[test]
fn repeated_load_is_deduplicated_and_updates_splice_in() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    install(loader, &[]);

    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("libmini.so");
    std::fs::write(&path, minimal_shared_object()).unwrap();

    let flags = ObjectFlags::BIND_GLOBAL | ObjectFlags::UPDATABLE | ObjectFlags::SKIP_IDENTICAL;
    let identity = loader
        .open(&path, flags, NAMESPACE_BASE, None)
        .expect("initial load must succeed");
    assert_eq!(identity.versions().len(), 1);

    // Idempotence: unchanged content is never installed again.
    let (object, info) = crate::load_object(loader, &identity, 0);
    assert!(object.is_none());
    assert_eq!(info, object_metadata::Info::IdenticalHash);
    assert_eq!(identity.versions().len(), 1);

    // Changed content becomes a new version ahead of the old one.
    let mut changed = minimal_shared_object();
    changed[4000] = 0x42;
    std::fs::write(&path, changed).unwrap();
    let (object, info) = crate::load_object(loader, &identity, 0);
    let object = object.expect("update must succeed");
    assert_eq!(info, object_metadata::Info::SuccessUpdate);
    assert_eq!(identity.versions().len(), 2);
    assert!(object.is_latest_version());
    assert!(object.file_previous.is_some());

    // Both versions occupy distinct address ranges.
    let (new_start, new_end) = object.memory_range().unwrap();
    let (old_start, old_end) = object.file_previous.as_ref().unwrap().memory_range().unwrap();
    assert!(new_end <= old_start || old_end <= new_start);

    install(loader, &[]);
}

#[test]
fn outdated_relocation_flag_is_derived_from_config() {
    let _guard = TEST_LOCK.lock();
    let mut config = Config::default();
    config.update_outdated_relocations = true;
    let local = Loader::initialize_for_tests(config);

    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("libflag.so");
    std::fs::write(&path, minimal_shared_object()).unwrap();
    let identity = local
        .open(
            &path,
            ObjectFlags::BIND_GLOBAL | ObjectFlags::UPDATABLE,
            NAMESPACE_BASE,
            None,
        )
        .expect("load must succeed");
    assert!(identity.flag(ObjectFlags::UPDATE_OUTDATED));

    // The knob only applies to updatable identities.
    let path = directory.path().join("libplain.so");
    std::fs::write(&path, minimal_shared_object()).unwrap();
    let plain = local
        .open(&path, ObjectFlags::BIND_GLOBAL, NAMESPACE_BASE, None)
        .expect("load must succeed");
    assert!(!plain.flag(ObjectFlags::UPDATE_OUTDATED));
}

#[test]
fn next_address_is_monotonic_and_aligned() {
    let _guard = TEST_LOCK.lock();
    let loader = test_loader();
    install(loader, &[]);

    let first = loader.next_address(0x5000);
    let second = loader.next_address(0x1000);
    assert_eq!(first % page_util::PAGE_SIZE, 0);
    assert_eq!(second % page_util::PAGE_SIZE, 0);
    assert!(second >= first + 0x5000);

    loader.reset_address(first);
    let third = loader.next_address(0x1000);
    assert_eq!(third, first);
}
