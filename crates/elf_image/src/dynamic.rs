//! Extraction of the `PT_DYNAMIC` table.

use goblin::elf::dynamic::{
    DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ,
    DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTGOT, DT_PLTRELSZ, DT_PREINIT_ARRAY, DT_PREINIT_ARRAYSZ,
    DT_RELA, DT_RELASZ, DT_RPATH, DT_RUNPATH, DT_SONAME, DT_STRSZ, DT_STRTAB, DT_SYMTAB,
};
use goblin::elf::program_header::PT_DYNAMIC;
use goblin::elf64::dynamic::Dyn;

use crate::defs::{
    DT_FLAGS, DT_FLAGS_1, DT_GNU_HASH, DT_RELACOUNT, DT_VERDEF, DT_VERDEFNUM, DT_VERNEED,
    DT_VERNEEDNUM, DT_VERSYM,
};
use crate::ElfImage;

/// The decoded dynamic section of an object.
///
/// Pointer-valued tags are resolved to absolute addresses within the mapping
/// the [`ElfImage`] was created over, so the table can be consumed both from
/// a freshly mapped file and from a premapped runtime image. `pltgot` and
/// `dynamic_vaddr` stay file-relative: they are only meaningful relative to
/// the runtime base of the object.
#[derive(Debug, Default, Clone)]
pub struct DynamicInfo {
    /// Names of the libraries this object depends on (`DT_NEEDED`).
    pub needed: Vec<String>,
    /// The object's `DT_SONAME`, if present.
    pub soname: Option<String>,
    /// Raw (colon-separated, unexpanded) `DT_RPATH` entries.
    pub rpath: Vec<String>,
    /// Raw (colon-separated, unexpanded) `DT_RUNPATH` entries.
    pub runpath: Vec<String>,

    pub strtab: usize,
    pub strsz: usize,
    pub symtab: usize,
    pub hash: usize,
    pub gnu_hash: usize,

    pub rela: usize,
    pub rela_size: usize,
    pub rela_count: usize,
    pub jmprel: usize,
    pub jmprel_size: usize,

    /// File-relative virtual address of the global offset table.
    pub pltgot: usize,
    /// File-relative virtual address of the `_DYNAMIC` array itself.
    pub dynamic_vaddr: usize,

    pub init: usize,
    pub init_array: usize,
    pub init_array_size: usize,
    pub preinit_array: usize,
    pub preinit_array_size: usize,
    pub fini: usize,
    pub fini_array: usize,
    pub fini_array_size: usize,

    pub versym: usize,
    pub verneed: usize,
    pub verneed_num: usize,
    pub verdef: usize,
    pub verdef_num: usize,

    pub flags: u64,
    pub flags_1: u64,
}

impl DynamicInfo {
    pub(crate) fn parse(image: &ElfImage, loaded: bool) -> Option<DynamicInfo> {
        let phdr = image
            .program_headers()
            .iter()
            .find(|phdr| phdr.p_type == PT_DYNAMIC)?;

        // Where a dynamic vaddr lives within this mapping.
        let bias = if loaded {
            image.address().wrapping_sub(image.virt_offset())
        } else {
            0
        };
        let resolve = |vaddr: usize| -> usize {
            if vaddr == 0 {
                0
            } else if loaded {
                bias.wrapping_add(vaddr)
            } else {
                match image.vaddr_to_offset(vaddr) {
                    Some(offset) => image.address() + offset,
                    None => 0,
                }
            }
        };

        let table_addr = if loaded {
            bias.wrapping_add(phdr.p_vaddr as usize)
        } else {
            image.address() + phdr.p_offset as usize
        };
        let count = phdr.p_filesz as usize / core::mem::size_of::<Dyn>();
        let entries = unsafe { core::slice::from_raw_parts(table_addr as *const Dyn, count) };

        let mut info = DynamicInfo {
            dynamic_vaddr: phdr.p_vaddr as usize,
            ..DynamicInfo::default()
        };

        // String-valued tags need the string table, which may appear after
        // them in the array; collect the offsets first.
        let mut needed_offsets = Vec::new();
        let mut soname_offset = None;
        let mut rpath_offset = None;
        let mut runpath_offset = None;

        for dyn_entry in entries {
            let value = dyn_entry.d_val as usize;
            match dyn_entry.d_tag {
                DT_NULL => break,
                DT_NEEDED => needed_offsets.push(value),
                DT_SONAME => soname_offset = Some(value),
                DT_RPATH => rpath_offset = Some(value),
                DT_RUNPATH => runpath_offset = Some(value),
                DT_STRTAB => info.strtab = resolve(value),
                DT_STRSZ => info.strsz = value,
                DT_SYMTAB => info.symtab = resolve(value),
                DT_HASH => info.hash = resolve(value),
                DT_RELA => info.rela = resolve(value),
                DT_RELASZ => info.rela_size = value,
                DT_JMPREL => info.jmprel = resolve(value),
                DT_PLTRELSZ => info.jmprel_size = value,
                DT_PLTGOT => info.pltgot = value,
                DT_INIT => info.init = value,
                DT_INIT_ARRAY => info.init_array = value,
                DT_INIT_ARRAYSZ => info.init_array_size = value,
                DT_PREINIT_ARRAY => info.preinit_array = value,
                DT_PREINIT_ARRAYSZ => info.preinit_array_size = value,
                DT_FINI => info.fini = value,
                DT_FINI_ARRAY => info.fini_array = value,
                DT_FINI_ARRAYSZ => info.fini_array_size = value,
                DT_GNU_HASH => info.gnu_hash = resolve(value),
                DT_RELACOUNT => info.rela_count = value,
                DT_VERSYM => info.versym = resolve(value),
                DT_VERNEED => info.verneed = resolve(value),
                DT_VERNEEDNUM => info.verneed_num = value,
                DT_VERDEF => info.verdef = resolve(value),
                DT_VERDEFNUM => info.verdef_num = value,
                DT_FLAGS => info.flags = dyn_entry.d_val,
                DT_FLAGS_1 => info.flags_1 = dyn_entry.d_val,
                _ => {}
            }
        }

        let strtab = info.strtab;
        let strsz = info.strsz;
        let string_at = |offset: usize| -> Option<String> {
            if strtab == 0 || offset >= strsz {
                return None;
            }
            let start = (strtab + offset) as *const u8;
            let max = strsz - offset;
            let mut len = 0;
            unsafe {
                while len < max && *start.add(len) != 0 {
                    len += 1;
                }
                core::str::from_utf8(core::slice::from_raw_parts(start, len))
                    .ok()
                    .map(|s| s.to_string())
            }
        };

        for offset in needed_offsets {
            if let Some(name) = string_at(offset) {
                info.needed.push(name);
            }
        }
        info.soname = soname_offset.and_then(&string_at);
        if let Some(paths) = rpath_offset.and_then(&string_at) {
            info.rpath = paths.split(':').map(|s| s.to_string()).collect();
        }
        if let Some(paths) = runpath_offset.and_then(&string_at) {
            info.runpath = paths.split(':').map(|s| s.to_string()).collect();
        }

        Some(info)
    }
}
