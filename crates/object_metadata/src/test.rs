//! Version chain and symbol-matching tests over synthetic objects.

use std::path::PathBuf;
use std::sync::Arc;

use goblin::elf::reloc::R_X86_64_GLOB_DAT;
use relocate_x86_64::Relocation;
use spin::Mutex;

use super::*;

/// A minimal valid ELF64 header for x86_64, leaked so the image can borrow
/// it for the rest of the test run.
fn leaked_elf_bytes() -> &'static [u8] {
    let mut bytes = vec![0u8; 64];
    bytes[..4].copy_from_slice(&goblin::elf::header::ELFMAG[..]);
    bytes[4] = goblin::elf::header::ELFCLASS64;
    bytes[5] = goblin::elf::header::ELFDATA2LSB;
    bytes[6] = 1;
    bytes[16] = 3; // ET_DYN
    bytes[18] = 62; // EM_X86_64
    bytes[20] = 1;
    Box::leak(bytes.into_boxed_slice())
}

fn test_object(identity: &IdentityRef, previous: Option<ObjectRef>, hash: u64) -> ObjectRef {
    let bytes = leaked_elf_bytes();
    let object = Arc::new(Object {
        identity: Arc::downgrade(identity),
        data: ObjectData {
            addr: bytes.as_ptr() as usize,
            size: bytes.len(),
            mtime: (hash as i64, 0),
            fd: -1,
            hash,
        },
        elf: elf_image::ElfImage::new(bytes.as_ptr() as usize, bytes.len()).unwrap(),
        kind: ObjectKind::Dynamic {
            position_independent: true,
        },
        base: 0x7f00_0000_0000 + (hash as usize) * 0x10_0000,
        global_offset_table: 0,
        dynamic_info: None,
        symbols: None,
        version_table: None,
        build_id: None,
        binary_hash: None,
        file_previous: previous,
        segments: Mutex::new(Vec::new()),
        dependencies: Mutex::new(Vec::new()),
        relocations: Mutex::new(Vec::new()),
        status: Mutex::new(ObjectStatus::Mapped),
    });
    identity.set_current(object.clone());
    object
}

fn test_identity() -> IdentityRef {
    ObjectIdentity::new(
        PathBuf::from("/tmp/libx.so.1"),
        None,
        NAMESPACE_BASE,
        ObjectFlags::BIND_GLOBAL | ObjectFlags::UPDATABLE,
    )
}

#[test]
fn version_chain_is_ordered_newest_first() {
    let identity = test_identity();
    let first = test_object(&identity, None, 1);
    let second = test_object(&identity, Some(first.clone()), 2);
    let third = test_object(&identity, Some(second.clone()), 3);

    assert!(third.is_latest_version());
    assert!(!second.is_latest_version());
    assert!(!first.is_latest_version());

    assert_eq!(first.version(), 0);
    assert_eq!(second.version(), 1);
    assert_eq!(third.version(), 2);

    let versions = identity.versions();
    assert_eq!(versions.len(), 3);
    assert!(Arc::ptr_eq(&versions[0], &third));
    assert!(Arc::ptr_eq(&versions[2], &first));

    // Every element of the chain belongs to this identity.
    for version in &versions {
        assert!(Arc::ptr_eq(&version.identity().unwrap(), &identity));
    }
}

#[test]
fn rollback_restores_previous_current() {
    let identity = test_identity();
    let first = test_object(&identity, None, 1);
    let _second = test_object(&identity, Some(first.clone()), 2);

    identity.rollback();
    assert!(first.is_latest_version());
    assert_eq!(identity.versions().len(), 1);
}

#[test]
fn dedup_by_mtime_and_hash() {
    let identity = test_identity();
    let first = test_object(&identity, None, 7);

    assert!(identity.has_version_with_mtime(first.data.mtime, first.data.size));
    assert!(!identity.has_version_with_mtime((99, 99), first.data.size));
    assert!(identity.has_version_with_hash(7, first.data.size));
    assert!(!identity.has_version_with_hash(8, first.data.size));
}

#[test]
fn record_relocation_replaces_same_site() {
    let identity = test_identity();
    let object = test_object(&identity, None, 1);

    let relocation = Relocation {
        offset: 0x4018,
        rtype: R_X86_64_GLOB_DAT,
        addend: 0,
        sym_index: 3,
        in_plt: false,
    };
    let definition = |value| SymbolDefinition {
        object: object.clone(),
        index: 3,
        value,
        size: 8,
        bind: goblin::elf::sym::STB_GLOBAL,
        sym_type: goblin::elf::sym::STT_FUNC,
        symbol: VersionedSymbol::unversioned("answer"),
    };

    object.record_relocation(relocation, definition(0x100));
    object.record_relocation(relocation, definition(0x200));
    let log = object.relocations.lock();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1.value, 0x200);
}

#[test]
fn symbol_version_matching() {
    let any = SymbolVersion::any();
    let v1 = SymbolVersion::named("LIBX_1.0");
    let v2 = SymbolVersion::named("LIBX_2.0");

    assert!(any.matches(&v1));
    assert!(v1.matches(&any));
    assert!(v1.matches(&SymbolVersion::named("LIBX_1.0")));
    assert!(!v1.matches(&v2));

    let in_file = SymbolVersion::named_in("LIBX_1.0", "libx.so.1", false);
    let other_file = SymbolVersion::named_in("LIBX_1.0", "liby.so.1", false);
    assert!(v1.matches(&in_file));
    assert!(!in_file.matches(&other_file));
}

#[test]
fn info_reports_status_text() {
    assert_eq!(
        Info::SuccessLoad.to_string(),
        "SUCCESS (loaded initial version)"
    );
    assert_eq!(
        Info::UpdateIncompatible.to_string(),
        "FAILED (new version is incompatible)"
    );
    assert!(Info::SuccessUpdate.success());
    assert!(!Info::IdenticalHash.success());
}

mod chain_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The `file_previous` chain is acyclic and exactly as long as the
        /// number of loads, regardless of how many versions are installed.
        #[test]
        fn chain_length_matches_loads(count in 1usize..24) {
            let identity = test_identity();
            let mut previous = None;
            for index in 0..count {
                previous = Some(test_object(&identity, previous.clone(), index as u64 + 1));
            }
            let versions = identity.versions();
            prop_assert_eq!(versions.len(), count);
            // Strictly decreasing version numbers prove acyclicity.
            for (offset, version) in versions.iter().enumerate() {
                prop_assert_eq!(version.version(), count - 1 - offset);
            }
        }
    }
}
